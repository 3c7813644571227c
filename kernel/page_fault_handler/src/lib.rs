//! The page-fault service path: the glue between the trap dispatcher and
//! the virtual-memory system.
//!
//! A fault resolves in five steps: find the owning space (kernel half vs.
//! current user space), find the region under the faulting address, check
//! the access against the region's object permissions, demand the page
//! from the object's backend, and install the mapping through the MUL.
//! The trap path then resumes the faulting instruction.
//!
//! The handler runs with preemption held. It never takes a fault on its
//! own working memory: region nodes, the page hash, and backend tables
//! all live in wired kernel allocations.

#![no_std]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;


use kernel_config::memory::KERNEL_SPACE_START;
use memory_structs::VirtualAddress;

bitflags! {
    /// What the hardware reported about the faulting access.
    pub struct FaultKind: u32 {
        /// The access was a write (otherwise a read).
        const WRITE   = 1 << 0;
        /// The access came from user mode.
        const USER    = 1 << 1;
        /// The access was an instruction fetch.
        const EXEC    = 1 << 2;
        /// The translation was present; the fault is a permission issue.
        const PRESENT = 1 << 3;
    }
}

/// Why a fault could not be serviced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultError {
    /// No region covers the address: a stray access.
    NoRegion,
    /// The access violates the region's permissions.
    Protection,
    /// The backend could not produce a page.
    OutOfMemory,
}

/// Services a page fault at `vaddr`. On success a mapping is installed
/// and the faulting instruction can be resumed; on failure the trap path
/// terminates the faulting context or panics, depending on who faulted.
pub fn handle_page_fault(vaddr: VirtualAddress, kind: FaultKind) -> Result<(), FaultError> {
    let _preempt = cpu::hold_preempt();

    // User code touching the kernel half is always a protection fault;
    // don't even consult the region list.
    let kernel_addr = vaddr.value() >= KERNEL_SPACE_START;
    if kernel_addr && kind.contains(FaultKind::USER) {
        return Err(FaultError::Protection);
    }

    let space = address_space::space_for(vaddr).ok_or(FaultError::NoRegion)?;
    let region = space.find_fault_region(vaddr).ok_or(FaultError::NoRegion)?;
    let object = region.object();
    let perm = object.perm();

    if kind.contains(FaultKind::WRITE) && !perm.is_writable() {
        return Err(FaultError::Protection);
    }
    if kind.contains(FaultKind::EXEC) && !perm.is_executable() {
        return Err(FaultError::Protection);
    }
    if kind.contains(FaultKind::USER) && perm.is_kernel_only() {
        return Err(FaultError::Protection);
    }

    let offset = vaddr.value() - region.start().value();
    let frame = object.page_in(offset).map_err(|err| {
        warn!("page fault at {}: backend page-in failed: {:?}", vaddr, err);
        FaultError::OutOfMemory
    })?;

    let page_va = VirtualAddress::new_canonical(vaddr.value() & !(kernel_config::memory::PAGE_SIZE - 1));
    let mul_space = space.mul();

    // A fault that raced an earlier installation of the same translation
    // needs no second mapping.
    if let Some((mapped, _)) = mul_space.get_mapping(page_va) {
        if mapped == frame {
            return Ok(());
        }
    }

    if mul_space.map(page_va, frame, perm).is_err() {
        error!("page fault at {}: mapping installation rejected", vaddr);
        return Err(FaultError::Protection);
    }
    frame_allocator::rmap_add(frame, space.id(), page_va);
    trace!("page fault at {} serviced with {:?}", vaddr, frame);
    Ok(())
}
