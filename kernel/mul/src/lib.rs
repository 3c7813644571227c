//! The MMU underlayer (MUL): nexke's portable interface to page tables.
//!
//! Callers describe mappings with [`PteFlags`]; the MUL owns the radix
//! walk, table allocation, TLB policy, and the *page-table cache*: a set
//! of per-CPU window slots at a fixed kernel address through which table
//! frames (and frames being zeroed) are reached, so no permanent linear
//! map of physical memory is required.
//!
//! The architecture's actual PTE encoding and invalidation instructions
//! hide behind the [`MmuDriver`] trait. The [`IdentityDriver`] shipped
//! here backs two situations where physical addresses are directly
//! dereferenceable: early boot before the kernel tables are live, and
//! host-side tests running against a simulated physical arena. The real
//! hardware driver is installed by platform init and is out of scope.
//!
//! Table layout is a four-level radix with 512 eight-byte entries per
//! level. An entry holds the portable flag bits in its low byte and the
//! child/leaf frame's physical address above bit 12.

#![no_std]

extern crate alloc;
#[macro_use]
extern crate log;

#[cfg(test)]
mod test;

use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use frame_allocator::{AllocError, PageFrame};
use kernel_config::memory::{
    ENTRIES_PER_TABLE, KERNEL_SPACE_START, PAGE_SIZE, PT_CACHE_SLOTS, PT_LEVELS,
};
use memory_structs::{Frame, Page, PhysicalAddress, VirtualAddress};
use pte_flags::PteFlags;
use spin::Once;
use sync_irq::IplMutex;

/// Errors surfaced by mapping operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MulError {
    /// The request itself is invalid, e.g. a user-permission PTE aimed at
    /// the kernel half.
    InvalidMapping,
    /// A required intermediate table could not be allocated.
    OutOfMemory,
    /// The virtual address has no mapping.
    NotMapped,
}

impl From<AllocError> for MulError {
    fn from(_: AllocError) -> MulError {
        MulError::OutOfMemory
    }
}

/// The pluggable hardware backend.
pub trait MmuDriver: Send + Sync {
    /// Makes the given frame's contents addressable through the PTCACHE
    /// window `slot`, returning a pointer to its first byte.
    fn window_map(&self, slot: usize, frame: Frame) -> NonNull<u8>;
    /// Releases a window slot previously handed out by `window_map`.
    fn window_unmap(&self, slot: usize);
    /// Invalidates the translation for one page of the active space.
    fn flush_page(&self, vaddr: VirtualAddress);
    /// Invalidates every translation of the active space.
    fn flush_all(&self);
    /// Whether `flush_page` is a real fine-grained invalidate. Drivers
    /// without one get `flush_all` on every single-page mutation.
    fn supports_page_flush(&self) -> bool {
        true
    }
    /// Makes `root` the active top-level table.
    fn load_root(&self, root: Frame);
    /// The currently active top-level table.
    fn current_root(&self) -> Frame;
}

/// Driver for contexts where physical addresses are directly usable as
/// pointers: early boot (identity-mapped or MMU off) and host tests.
pub struct IdentityDriver {
    root: AtomicUsize,
}

impl IdentityDriver {
    pub const fn new() -> IdentityDriver {
        IdentityDriver { root: AtomicUsize::new(0) }
    }
}

impl MmuDriver for IdentityDriver {
    fn window_map(&self, _slot: usize, frame: Frame) -> NonNull<u8> {
        NonNull::new(frame.start_address().value() as *mut u8)
            .expect("identity window over the zero frame")
    }
    fn window_unmap(&self, _slot: usize) {}
    fn flush_page(&self, _vaddr: VirtualAddress) {}
    fn flush_all(&self) {}
    fn load_root(&self, root: Frame) {
        self.root.store(root.number(), Ordering::Release);
    }
    fn current_root(&self) -> Frame {
        Frame::from_number(self.root.load(Ordering::Acquire))
    }
}

static MMU_DRIVER: Once<&'static dyn MmuDriver> = Once::new();

fn driver() -> &'static dyn MmuDriver {
    *MMU_DRIVER.get().expect("MUL used before early_init")
}

/// Bumped whenever a new top-level table appears in the kernel half, so
/// user spaces can lazily shadow the new entry on their next switch.
static KERNEL_VERSION: AtomicU64 = AtomicU64::new(0);

/// The kernel space's top-level table, created by [`init`].
static KERNEL_SPACE: Once<MulSpace> = Once::new();

/// Installs the MMU driver. Must precede every other MUL call; the early
/// map helpers only need this much.
pub fn early_init(mmu: &'static dyn MmuDriver) {
    MMU_DRIVER.call_once(|| mmu);
}

/// Creates the kernel space's page tables and switches to them.
/// Requires the frame allocator to be fully initialized.
pub fn init() -> Result<(), MulError> {
    if KERNEL_SPACE.is_completed() {
        warn!("mul: init called twice");
        return Ok(());
    }
    let root = frame_allocator::alloc_page()?;
    zero_frame(root.frame());
    let space = MulSpace {
        inner: IplMutex::new(MulSpaceInner {
            root: Some(root),
            table_pages: Vec::new(),
            kernel_version: 0,
            pending_flush: false,
        }),
        user: false,
    };
    driver().load_root(space.root_frame());
    KERNEL_SPACE.call_once(|| space);
    Ok(())
}

/// The distinguished kernel space, shared (by top-level shadowing) with
/// every user space.
pub fn kernel_space() -> &'static MulSpace {
    KERNEL_SPACE.get().expect("mul::init has not run")
}

// ---------------------------------------------------------------------------
// Page-table cache
// ---------------------------------------------------------------------------

/// In-use flags for the PTCACHE window slots. All access happens at IPL
/// High, so a walk can never be torn by the timer or the expiry path.
static PT_CACHE_IN_USE: IplMutex<[bool; PT_CACHE_SLOTS]> = IplMutex::new([false; PT_CACHE_SLOTS]);

/// Runs `f` with the given frame addressable through a PTCACHE window.
///
/// Nesting is fine up to the slot count, which is sized for a full walk
/// (one slot per level) plus a data page being zeroed.
fn with_frame<R>(frame: Frame, f: impl FnOnce(*mut u8) -> R) -> R {
    let ipl = cpu::raise_ipl(cpu::Ipl::High);
    let slot = {
        let mut in_use = PT_CACHE_IN_USE.lock();
        let slot = in_use
            .iter()
            .position(|used| !used)
            .expect("page-table cache slots exhausted; walk deeper than PT_CACHE_SLOTS");
        in_use[slot] = true;
        slot
    };
    let ptr = driver().window_map(slot, frame);
    let result = f(ptr.as_ptr());
    driver().window_unmap(slot);
    PT_CACHE_IN_USE.lock()[slot] = false;
    cpu::lower_ipl(ipl);
    result
}

/// Zeroes a physical frame through the page-table cache.
pub fn zero_frame(frame: Frame) {
    with_frame(frame, |ptr| unsafe {
        core::ptr::write_bytes(ptr, 0, PAGE_SIZE);
    });
}

/// Reads `len` bytes at `phys` through the page-table cache. `phys + len`
/// must not cross a frame boundary.
pub fn read_phys(phys: PhysicalAddress, out: &mut [u8]) {
    debug_assert!(phys.frame_offset() + out.len() <= PAGE_SIZE);
    with_frame(Frame::containing_address(phys), |ptr| unsafe {
        core::ptr::copy_nonoverlapping(ptr.add(phys.frame_offset()), out.as_mut_ptr(), out.len());
    });
}

/// Writes `data` at `phys` through the page-table cache. Same bounds rule
/// as [`read_phys`].
pub fn write_phys(phys: PhysicalAddress, data: &[u8]) {
    debug_assert!(phys.frame_offset() + data.len() <= PAGE_SIZE);
    with_frame(Frame::containing_address(phys), |ptr| unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(phys.frame_offset()), data.len());
    });
}

// ---------------------------------------------------------------------------
// Entry encoding
// ---------------------------------------------------------------------------

const ENTRY_FLAGS_MASK: u64 = 0xFFF;

fn make_entry(frame: Frame, flags: PteFlags) -> u64 {
    (frame.start_address().value() as u64) | (flags.bits() & ENTRY_FLAGS_MASK)
}

fn entry_frame(entry: u64) -> Frame {
    Frame::containing_address(PhysicalAddress::new_canonical((entry & !ENTRY_FLAGS_MASK) as usize))
}

fn entry_flags(entry: u64) -> PteFlags {
    PteFlags::from_bits_truncate(entry & ENTRY_FLAGS_MASK)
}

fn read_entry(table: Frame, idx: usize) -> u64 {
    debug_assert!(idx < ENTRIES_PER_TABLE);
    with_frame(table, |ptr| unsafe { (ptr as *const u64).add(idx).read_volatile() })
}

fn write_entry(table: Frame, idx: usize, entry: u64) {
    debug_assert!(idx < ENTRIES_PER_TABLE);
    with_frame(table, |ptr| unsafe { (ptr as *mut u64).add(idx).write_volatile(entry) })
}

fn is_kernel_half(vaddr: VirtualAddress) -> bool {
    vaddr.value() >= KERNEL_SPACE_START
}

/// Flags given to intermediate tables: fully permissive, the leaf decides.
fn intermediate_flags(kernel: bool) -> PteFlags {
    let mut flags = PteFlags::PRESENT | PteFlags::READ | PteFlags::WRITE | PteFlags::EXECUTABLE;
    if kernel {
        flags |= PteFlags::KERNEL;
    }
    flags
}

// ---------------------------------------------------------------------------
// Spaces
// ---------------------------------------------------------------------------

struct MulSpaceInner {
    /// `Some` for the space's whole life; taken only by the drop path.
    root: Option<PageFrame>,
    /// Intermediate table frames this space owns (kernel-half tables of a
    /// user space are shadows owned by the kernel space, never listed here).
    table_pages: Vec<PageFrame>,
    /// Which kernel top-level layout this space has shadowed.
    kernel_version: u64,
    /// A flush is owed to this space the next time it becomes active.
    pending_flush: bool,
}

impl MulSpaceInner {
    fn root_frame(&self) -> Frame {
        self.root.as_ref().expect("space used after teardown").frame()
    }
}

/// One set of page tables: the kernel space, or one per-process space that
/// shadows the kernel's top-level entries.
pub struct MulSpace {
    inner: IplMutex<MulSpaceInner>,
    user: bool,
}

impl MulSpace {
    /// Creates a per-process space whose kernel half mirrors the kernel
    /// space's current top-level entries.
    pub fn new_user() -> Result<MulSpace, MulError> {
        let root = frame_allocator::alloc_page()?;
        zero_frame(root.frame());
        let version = shadow_kernel_entries(root.frame());
        Ok(MulSpace {
            inner: IplMutex::new(MulSpaceInner {
                root: Some(root),
                table_pages: Vec::new(),
                kernel_version: version,
                pending_flush: false,
            }),
            user: true,
        })
    }

    pub fn is_user(&self) -> bool {
        self.user
    }

    /// The physical frame of this space's top-level table.
    pub fn root_frame(&self) -> Frame {
        self.inner.lock().root_frame()
    }

    /// Checks which half of the address space a request belongs in.
    /// Kernel-half mappings only exist in the kernel space (user spaces see
    /// them through top-level shadowing); the kernel space holds nothing in
    /// the user half.
    fn check_half(&self, vaddr: VirtualAddress, perm: Option<PteFlags>) -> Result<bool, MulError> {
        let kernel_half = is_kernel_half(vaddr);
        if kernel_half != !self.user {
            error!("mul: {} aimed at the wrong space", vaddr);
            return Err(MulError::InvalidMapping);
        }
        if let Some(perm) = perm {
            if kernel_half && !perm.is_kernel_only() {
                error!("mul: rejecting user-permission mapping at kernel address {}", vaddr);
                return Err(MulError::InvalidMapping);
            }
        }
        Ok(kernel_half)
    }

    /// Installs a mapping of `frame` at `vaddr` with the given permissions.
    ///
    /// A user-permission PTE aimed at the kernel half is rejected: that
    /// combination can only be a caller bug, never policy.
    pub fn map(&self, vaddr: VirtualAddress, frame: Frame, perm: PteFlags) -> Result<(), MulError> {
        let kernel_half = self.check_half(vaddr, Some(perm))?;
        let mut inner = self.inner.lock();
        let page = Page::containing_address(vaddr);
        let leaf = self.walk(&mut *inner, page, true)?;
        let idx = page.table_index(0);
        let old = read_entry(leaf, idx);
        write_entry(leaf, idx, make_entry(frame, perm | PteFlags::PRESENT));
        if entry_flags(old).is_present() {
            warn!("mul: map over an existing mapping at {}", vaddr);
            self.flush_one(&mut *inner, vaddr, kernel_half);
        }
        Ok(())
    }

    /// Removes the mapping at `vaddr`, returning the frame it covered.
    pub fn unmap(&self, vaddr: VirtualAddress) -> Result<Frame, MulError> {
        let kernel_half = self.check_half(vaddr, None)?;
        let mut inner = self.inner.lock();
        let page = Page::containing_address(vaddr);
        let leaf = self.walk(&mut *inner, page, false)?;
        let idx = page.table_index(0);
        let old = read_entry(leaf, idx);
        if !entry_flags(old).is_present() {
            return Err(MulError::NotMapped);
        }
        write_entry(leaf, idx, 0);
        self.flush_one(&mut *inner, vaddr, kernel_half);
        Ok(entry_frame(old))
    }

    /// Rewrites the permissions of an existing mapping in place.
    pub fn change_perm(&self, vaddr: VirtualAddress, perm: PteFlags) -> Result<(), MulError> {
        let kernel_half = self.check_half(vaddr, Some(perm))?;
        let mut inner = self.inner.lock();
        let page = Page::containing_address(vaddr);
        let leaf = self.walk(&mut *inner, page, false)?;
        let idx = page.table_index(0);
        let old = read_entry(leaf, idx);
        if !entry_flags(old).is_present() {
            return Err(MulError::NotMapped);
        }
        write_entry(leaf, idx, make_entry(entry_frame(old), perm | PteFlags::PRESENT));
        self.flush_one(&mut *inner, vaddr, kernel_half);
        Ok(())
    }

    /// Looks up the frame mapped at `vaddr`, with its flags.
    pub fn get_mapping(&self, vaddr: VirtualAddress) -> Option<(Frame, PteFlags)> {
        let mut inner = self.inner.lock();
        let page = Page::containing_address(vaddr);
        let leaf = self.walk(&mut *inner, page, false).ok()?;
        let entry = read_entry(leaf, page.table_index(0));
        let flags = entry_flags(entry);
        if flags.is_present() {
            Some((entry_frame(entry), flags))
        } else {
            None
        }
    }

    /// Makes this space the active one: refreshes stale kernel shadows,
    /// loads the root, and honors any deferred flush.
    pub fn switch_to(&self) {
        let mut inner = self.inner.lock();
        if self.user {
            let version = KERNEL_VERSION.load(Ordering::Acquire);
            if inner.kernel_version < version {
                inner.kernel_version = shadow_kernel_entries(inner.root_frame());
            }
        }
        driver().load_root(inner.root_frame());
        if inner.pending_flush {
            inner.pending_flush = false;
            driver().flush_all();
        }
    }

    /// Walks from the root to the leaf table of `page`, optionally creating
    /// missing intermediate tables, and returns the leaf table's frame.
    fn walk(
        &self,
        inner: &mut MulSpaceInner,
        page: Page,
        create: bool,
    ) -> Result<Frame, MulError> {
        let kernel_half = is_kernel_half(page.start_address());
        let mut table = inner.root_frame();
        for level in (1..PT_LEVELS).rev() {
            let idx = page.table_index(level);
            let entry = read_entry(table, idx);
            if entry_flags(entry).is_present() {
                table = entry_frame(entry);
                continue;
            }
            if !create {
                return Err(MulError::NotMapped);
            }
            let new_table = frame_allocator::alloc_page()?;
            zero_frame(new_table.frame());
            write_entry(table, idx, make_entry(new_table.frame(), intermediate_flags(kernel_half)));
            // A new kernel top-level entry obsoletes every user space's
            // shadow of the kernel half.
            if kernel_half && level == PT_LEVELS - 1 && !self.user {
                KERNEL_VERSION.fetch_add(1, Ordering::AcqRel);
            }
            table = new_table.frame();
            inner.table_pages.push(new_table);
        }
        Ok(table)
    }

    /// Single-page TLB maintenance per the flush policy.
    fn flush_one(&self, inner: &mut MulSpaceInner, vaddr: VirtualAddress, kernel_half: bool) {
        let mmu = driver();
        if kernel_half || self.is_active_inner(inner) {
            if mmu.supports_page_flush() {
                mmu.flush_page(vaddr);
            } else {
                mmu.flush_all();
            }
        } else {
            // Not active: settle up when this space is switched to.
            inner.pending_flush = true;
        }
    }

    fn is_active_inner(&self, inner: &MulSpaceInner) -> bool {
        driver().current_root() == inner.root_frame()
    }
}

impl Drop for MulSpace {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        for table in inner.table_pages.drain(..) {
            frame_allocator::free_page(table);
        }
        if let Some(root) = inner.root.take() {
            frame_allocator::free_page(root);
        }
    }
}

/// Copies the kernel half's top-level entries from the kernel space root
/// into `root`, returning the version that copy reflects.
fn shadow_kernel_entries(root: Frame) -> u64 {
    let version = KERNEL_VERSION.load(Ordering::Acquire);
    let kernel_root = kernel_space().root_frame();
    let first_kernel_idx =
        Page::containing_address(VirtualAddress::new_canonical(KERNEL_SPACE_START))
            .table_index(PT_LEVELS - 1);
    for idx in first_kernel_idx..ENTRIES_PER_TABLE {
        let entry = read_entry(kernel_root, idx);
        write_entry(root, idx, entry);
    }
    version
}

// ---------------------------------------------------------------------------
// Early mapping helpers
// ---------------------------------------------------------------------------

/// Maps `frame` at `vaddr` in the currently-active tables, walking them
/// directly. Used before the kernel space exists; table frames allocated
/// here come from the bootstrap pool and are wired forever.
pub fn early_map(vaddr: VirtualAddress, frame: Frame, perm: PteFlags) -> Result<(), MulError> {
    let page = Page::containing_address(vaddr);
    let kernel_half = is_kernel_half(vaddr);
    if kernel_half && !perm.is_kernel_only() {
        return Err(MulError::InvalidMapping);
    }
    let mut table = driver().current_root();
    for level in (1..PT_LEVELS).rev() {
        let idx = page.table_index(level);
        let entry = read_entry(table, idx);
        if entry_flags(entry).is_present() {
            table = entry_frame(entry);
        } else {
            let new_table = frame_allocator::alloc_page()?;
            zero_frame(new_table.frame());
            write_entry(table, idx, make_entry(new_table.frame(), intermediate_flags(kernel_half)));
            table = new_table.frame();
            // Early tables are never reclaimed; forget the token.
            core::mem::forget(new_table);
        }
    }
    write_entry(table, page.table_index(0), make_entry(frame, perm | PteFlags::PRESENT));
    Ok(())
}

/// Resolves `vaddr` through the currently-active tables.
pub fn early_get_phys(vaddr: VirtualAddress) -> Option<PhysicalAddress> {
    let page = Page::containing_address(vaddr);
    let mut table = driver().current_root();
    for level in (1..PT_LEVELS).rev() {
        let entry = read_entry(table, page.table_index(level));
        if !entry_flags(entry).is_present() {
            return None;
        }
        table = entry_frame(entry);
    }
    let entry = read_entry(table, page.table_index(0));
    if !entry_flags(entry).is_present() {
        return None;
    }
    Some(entry_frame(entry).start_address() + vaddr.page_offset())
}
