//! The nexke captain: brings every kernel subsystem up in dependency
//! order from the boot handoff, owns the exception/interrupt dispatch
//! contract, and carries the panic path.
//!
//! Boot order (leaves first): log relocation → frame-allocator bootstrap
//! (boot early pool) → slab bootstrap (static pool) → frame-allocator
//! full init → MUL → kernel address space → clock/timer → interrupt
//! dispatch → scheduler → the Terminator work queue → first thread.

#![no_std]

extern crate alloc;
#[macro_use]
extern crate log;

pub mod interrupt;
pub mod panic;

use alloc::sync::Arc;
use alloc::vec::Vec;
use boot_info::{BootInfo, MemoryKind};
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_config::memory::PAGE_SIZE;
use log::LevelFilter;
use memory_structs::{Frame, FrameRange, VirtualAddress};
use mul::MmuDriver;
use pte_flags::PteFlags;
use spin::Once;
use time::{ClockSource, TimerDevice};
use workqueue::{WorkFlags, WorkQueue, WorkQueueKind};

/// The platform devices the core consumes; chosen by platform init,
/// opaque from here on.
pub struct Platform {
    pub mmu: &'static dyn MmuDriver,
    pub clock: &'static dyn ClockSource,
    pub timer: Option<&'static dyn TimerDevice>,
    pub int_controller: &'static dyn interrupt::IntController,
    /// True while physical addresses are directly usable (identity boot
    /// environments); the kernel-heap page supplier stays off then.
    pub identity_boot: bool,
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// The Terminator: destroys exited threads from a context where freeing
/// their stacks is legal.
static TERMINATOR: Once<WorkQueue> = Once::new();

/// Brings the kernel core up. Called exactly once from the entry stub
/// with interrupts masked.
pub fn init(boot: &'static BootInfo, platform: Platform) -> Result<(), &'static str> {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return Err("nexke::init called twice");
    }

    // The MMU driver first: the log replay and every zeroing path below
    // go through the page-table cache.
    mul::early_init(platform.mmu);

    logger::init(log_level_from_args(boot));
    relocate_boot_log(boot);
    info!("nexke: booting on '{}' ({:?} firmware)", boot.system_name, boot.firmware);

    // Stage one of the frame allocator: bump allocations from the boot
    // early pool, enough for early page tables.
    let (pool_base, pool_len) = boot.early_pool;
    frame_allocator::init_bootstrap(pool_base, pool_len);

    // Full frame-allocator init. The early pool and the loaded modules
    // are wired: they must never land on a free list.
    let mut wired: Vec<FrameRange> = Vec::new();
    if pool_len > 0 {
        wired.push(FrameRange::from_phys_addr(pool_base, pool_len));
    }
    for module in boot.modules {
        wired.push(FrameRange::from_phys_addr(module.base, module.length));
    }
    frame_allocator::init(boot.memory_map, &wired)?;
    info!(
        "nexke: {} free frames across {} bytes of usable RAM",
        frame_allocator::total_free(),
        boot.free_memory_bytes()
    );

    // Kernel page tables and the kernel half's address space.
    mul::init().map_err(|_| "failed to create the kernel page tables")?;
    address_space::kernel_init(None).map_err(|_| "failed to create the kernel address space")?;

    // With KVA working, the slab allocator can stop living off its
    // static pool (not in identity-boot environments, where kernel
    // virtual addresses are not real).
    if !platform.identity_boot {
        slab_allocator::set_page_supplier(slab_allocator::SlabSource {
            grow: kernel_heap_grow,
            release: None,
        });
        slab_allocator::kernel_heap::set_large_alloc_hooks(
            slab_allocator::kernel_heap::LargeAllocHooks {
                grow: kernel_heap_grow_large,
                release: kernel_heap_release_large,
            },
        );
    }

    // Time, interrupts, scheduling.
    time::init(platform.clock, platform.timer);
    interrupt::init(platform.int_controller);
    scheduler::init();
    scheduler::start_timeslice_timer();

    // The Terminator work queue reaps exited threads.
    let terminator = WorkQueue::new(
        "terminator",
        terminator_callback,
        WorkQueueKind::Demand,
        WorkFlags::default(),
        1,
    );
    TERMINATOR.call_once(|| terminator);
    spawn::set_reaper(reap_thread);

    info!("nexke: core initialized");
    Ok(())
}

/// Hands the CPU to the first real thread. Never returns.
pub fn handoff(entry: fn()) -> ! {
    let initial = spawn::new_thread("init", move || entry());
    info!("nexke: handing off to the init thread");
    scheduler::set_initial_thread(initial)
}

/// `-loglevel=` from the kernel command line, defaulting to info.
fn log_level_from_args(boot: &BootInfo) -> LevelFilter {
    match boot.arg("loglevel") {
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Replays the bootloader's log buffer into the kernel ring, one frame's
/// worth at a time through the page-table cache.
fn relocate_boot_log(boot: &BootInfo) {
    let Some((base, len)) = boot.log_buffer else { return };
    let mut copied = 0;
    let mut chunk = [0u8; 256];
    while copied < len {
        let at = base + copied;
        let room = PAGE_SIZE - at.frame_offset();
        let take = chunk.len().min(room).min(len - copied);
        mul::read_phys(at, &mut chunk[..take]);
        logger::replay_boot_log(&chunk[..take]);
        copied += take;
    }
    debug!("nexke: relocated {} bytes of boot log", len);
}

/// Grows the kernel heap by one mapped page. Installed as the slab page
/// supplier once kernel virtual memory works.
fn kernel_heap_grow() -> Option<core::ptr::NonNull<u8>> {
    match address_space::alloc_kv_region(1, PteFlags::READ | PteFlags::WRITE) {
        Ok(region) => core::ptr::NonNull::new(region.start().value() as *mut u8),
        Err(err) => {
            error!("kernel heap growth failed: {:?}", err);
            None
        }
    }
}

/// Multi-page kernel allocations: one mapped region per allocation.
fn kernel_heap_grow_large(bytes: usize) -> Option<core::ptr::NonNull<u8>> {
    let pages = bytes.div_ceil(PAGE_SIZE);
    match address_space::alloc_kv_region(pages, PteFlags::READ | PteFlags::WRITE) {
        Ok(region) => core::ptr::NonNull::new(region.start().value() as *mut u8),
        Err(err) => {
            error!("large kernel allocation of {} bytes failed: {:?}", bytes, err);
            None
        }
    }
}

fn kernel_heap_release_large(ptr: core::ptr::NonNull<u8>, _bytes: usize) {
    let vaddr = VirtualAddress::new_canonical(ptr.as_ptr() as usize);
    let space = address_space::kernel_space();
    match space.find_region(vaddr) {
        Some(region) => {
            let _ = space.free_space(&region);
        }
        None => warn!("large kernel free at {} matches no region", vaddr),
    }
}

/// The reaper hook: exited threads travel to the Terminator as raw
/// payloads.
fn reap_thread(thread: task::ThreadRef) {
    let payload = Arc::into_raw(thread) as usize;
    match TERMINATOR.get() {
        Some(queue) => queue.submit(payload),
        None => {
            // Too early for the Terminator; reclaim the reference and
            // let the zombie list keep it.
            let thread = unsafe { Arc::from_raw(payload as *const task::Thread) };
            warn!("thread {} exited before the Terminator existed", thread.tid());
            core::mem::forget(thread);
        }
    }
}

/// Runs on the Terminator's thread: dropping the last reference frees
/// the thread's stack, which is only legal from another context.
fn terminator_callback(payload: usize) {
    let thread = unsafe { Arc::from_raw(payload as *const task::Thread) };
    trace!("terminator: destroying thread {}", thread.tid());
    drop(thread);
}

/// Total frames of usable memory the boot map describes; sanity checks
/// and the OOM report use it.
pub fn usable_frames(boot: &BootInfo) -> usize {
    boot.memory_map
        .iter()
        .filter(|region| region.kind == MemoryKind::Free)
        .map(|region| region.length / PAGE_SIZE)
        .sum()
}

/// The kernel cannot continue without memory.
pub fn oom_panic(what: &'static str) -> ! {
    panic!("out of memory: {} (free frames: {})", what, frame_allocator::total_free());
}

/// A page fault that reached the kernel unhandled.
pub fn unhandled_page_fault(vaddr: VirtualAddress, kind: page_fault_handler::FaultKind) -> ! {
    panic!("unhandled page fault at {} ({:?})", vaddr, kind);
}

/// Converts a physical range into frames, for building kernel-resident
/// objects out of boot artifacts (modules, framebuffer).
pub fn frames_of_range(base: memory_structs::PhysicalAddress, len: usize) -> Vec<Frame> {
    FrameRange::from_phys_addr(base, len).iter().collect()
}
