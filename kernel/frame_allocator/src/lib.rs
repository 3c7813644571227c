//! The page frame allocator (PFA): owns every physical page frame in the
//! system.
//!
//! Frames are grouped into *zones* by purpose, built from the boot memory
//! map. Each usable zone keeps a LIFO free list threaded through its
//! per-frame descriptors, so `alloc_page`/`free_page` are O(1) push/pop at
//! the head. `alloc_pages_at` is the O(n) contiguous-run scan reserved for
//! rare DMA-style allocations with address and alignment constraints.
//!
//! This also supports a bootstrap stage before the zone descriptors exist:
//! until [`init`] runs, single-frame allocations are bump-served from the
//! boot early pool, and the full init afterwards marks those frames as
//! wired inside their covering zone.
//!
//! Frame descriptors also carry the back-mapping (rmap) list of
//! `(space, vaddr)` pairs, so unmap and page-out paths can find and clear
//! every PTE that points at a frame.

#![no_std]

extern crate alloc;
#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

mod zone;


use alloc::vec::Vec;
use boot_info::MemoryRegion;
use core::fmt;
use kernel_config::memory::PAGE_SIZE;
use memory_structs::{Frame, FrameRange, PhysicalAddress, VirtualAddress};
use spin::Once;
use sync_irq::IplMutex;

pub use zone::{PageState, RmapEntry, ZoneFlags, ZoneStats};
use zone::{PhysMem, BOOTSTRAP_ZONE};

/// Errors surfaced by the frame allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// No free frame satisfied the request.
    OutOfMemory,
}

/// An owned physical page frame.
///
/// This token is move-only: holding it is holding the frame. It carries no
/// drop glue; a frame is returned to its zone only by an explicit
/// [`free_page`] (or, for frames attached to a memory object, by the
/// object's teardown).
#[derive(PartialEq, Eq)]
pub struct PageFrame {
    frame: Frame,
    zone_idx: u16,
}

// A frame token must never be duplicated: two owners would double-free.
assert_not_impl_any!(PageFrame: Clone, Copy);

impl PageFrame {
    pub fn frame(&self) -> Frame {
        self.frame
    }

    pub fn start_address(&self) -> PhysicalAddress {
        self.frame.start_address()
    }

    pub(crate) fn new(frame: Frame, zone_idx: u16) -> PageFrame {
        PageFrame { frame, zone_idx }
    }

    pub(crate) fn zone_idx(&self) -> u16 {
        self.zone_idx
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PageFrame({:#X})", self.frame.start_address().value())
    }
}

/// A read-only view of one frame's descriptor, as returned by
/// [`find_page_by_pfn`].
#[derive(Clone, Debug)]
pub struct PageInfo {
    pub frame: Frame,
    pub state: PageState,
    pub zone_flags: ZoneFlags,
    /// Valid only while `state == PageState::InObject`.
    pub offset_in_object: usize,
}

/// The system-wide allocator state. Populated once by [`init`].
static PHYS_MEM: Once<IplMutex<PhysMem>> = Once::new();

/// The pre-init bump pool over the boot early pool: (next, end).
static BOOTSTRAP_POOL: IplMutex<Option<(PhysicalAddress, PhysicalAddress)>> = IplMutex::new(None);

/// Begins the bootstrap stage: frame allocations are bump-served from the
/// given boot early pool until [`init`] is called.
pub fn init_bootstrap(pool_base: PhysicalAddress, pool_len: usize) {
    let mut pool = BOOTSTRAP_POOL.lock();
    if pool.is_some() {
        warn!("frame_allocator: bootstrap pool installed twice, keeping the first");
        return;
    }
    // Round the base up to a frame boundary; partial frames are unusable.
    let base = PhysicalAddress::new_canonical(
        (pool_base.value() + PAGE_SIZE - 1) & !(PAGE_SIZE - 1),
    );
    let end = pool_base + pool_len;
    *pool = Some((base, end));
}

/// Fully initializes the allocator from the boot memory map.
///
/// `wired` lists frame ranges that are already in use (kernel image,
/// bootstrap pool) and must not appear on any free list.
pub fn init(memory_map: &[MemoryRegion], wired: &[FrameRange]) -> Result<(), &'static str> {
    if PHYS_MEM.is_completed() {
        return Err("frame allocator was already initialized, cannot be initialized twice");
    }
    let phys_mem = PhysMem::build(memory_map, wired)?;
    for stats in phys_mem.zone_stats() {
        debug!(
            "frame_allocator: zone at {:#X}, {} pages, {} free, flags {:?}",
            stats.base.start_address().value(),
            stats.num_pages,
            stats.free_count,
            stats.flags
        );
    }
    PHYS_MEM.call_once(|| IplMutex::new(phys_mem));
    Ok(())
}

fn with_phys_mem<R>(f: impl FnOnce(&mut PhysMem) -> R) -> Option<R> {
    PHYS_MEM.get().map(|pm| f(&mut pm.lock()))
}

/// Allocates one page frame from any generic-allocation zone, falling back
/// to constrained zones only when the generic ones are exhausted.
///
/// During the bootstrap stage this bumps from the boot early pool instead.
pub fn alloc_page() -> Result<PageFrame, AllocError> {
    if let Some(pm) = PHYS_MEM.get() {
        return pm.lock().alloc_page();
    }
    // Bootstrap stage: no zones yet.
    let mut pool = BOOTSTRAP_POOL.lock();
    let (next, end) = pool.ok_or(AllocError::OutOfMemory)?;
    if next + PAGE_SIZE > end {
        error!("frame_allocator: boot early pool exhausted before full init");
        return Err(AllocError::OutOfMemory);
    }
    *pool = Some((next + PAGE_SIZE, end));
    Ok(PageFrame::new(Frame::containing_address(next), BOOTSTRAP_ZONE))
}

/// Allocates `num_frames` physically-contiguous frames whose start address
/// is below `max_phys` and aligned to `align_frames` frames.
///
/// This is an O(n) scan over zone descriptors; it exists for rare
/// DMA-style allocations and is not the general path.
pub fn alloc_pages_at(
    num_frames: usize,
    max_phys: PhysicalAddress,
    align_frames: usize,
) -> Result<Vec<PageFrame>, AllocError> {
    with_phys_mem(|pm| pm.alloc_pages_at(num_frames, max_phys, align_frames))
        .unwrap_or(Err(AllocError::OutOfMemory))
}

/// Returns the given frame to its zone's free list (LIFO: it becomes the
/// next frame handed out).
pub fn free_page(page: PageFrame) {
    if page.zone_idx() == BOOTSTRAP_ZONE {
        // Bootstrap frames are wired forever; dropping the token is enough.
        trace!("frame_allocator: ignoring free of bootstrap {:?}", page);
        return;
    }
    if with_phys_mem(|pm| pm.free_page(page)).is_none() {
        error!("frame_allocator: free_page before init");
    }
}

/// Resolves a PFN to its descriptor view. Frames inside Reserved or MMIO
/// zones come back with `state == Unusable`: they can be used to map MMIO
/// windows but are never placed on a free list. Returns `None` if no zone
/// covers the PFN.
pub fn find_page_by_pfn(pfn: usize) -> Option<PageInfo> {
    with_phys_mem(|pm| pm.find_page_by_pfn(pfn)).flatten()
}

/// Marks a frame as attached to a memory object at the given page offset.
pub fn page_attach(page: &PageFrame, offset_in_object: usize) {
    with_phys_mem(|pm| pm.set_object_attachment(page, Some(offset_in_object)));
}

/// Clears a frame's object attachment, returning it to the plain allocated
/// state.
pub fn page_detach(page: &PageFrame) {
    with_phys_mem(|pm| pm.set_object_attachment(page, None));
}

/// Records a back-mapping: `vaddr` in the space identified by `space_id`
/// now maps this frame.
pub fn rmap_add(frame: Frame, space_id: u64, vaddr: VirtualAddress) {
    with_phys_mem(|pm| pm.rmap_add(frame, space_id, vaddr));
}

/// Removes one back-mapping previously added with [`rmap_add`].
pub fn rmap_remove(frame: Frame, space_id: u64, vaddr: VirtualAddress) {
    with_phys_mem(|pm| pm.rmap_remove(frame, space_id, vaddr));
}

/// Takes the whole back-mapping list for a frame, leaving it empty.
/// The caller walks it to clear PTEs before the frame is freed.
pub fn rmap_take(frame: Frame) -> Vec<RmapEntry> {
    with_phys_mem(|pm| pm.rmap_take(frame)).unwrap_or_default()
}

/// Total count of free frames across all zones.
pub fn total_free() -> usize {
    with_phys_mem(|pm| pm.total_free()).unwrap_or(0)
}

/// Folds reclaimable zones (ACPI-reclaim, boot-reclaim) into the free pool.
/// Called once the tables and handoff structures they hold are consumed.
pub fn reclaim_boot_regions() -> usize {
    with_phys_mem(|pm| pm.reclaim_boot_regions()).unwrap_or(0)
}

/// A debugging function used to dump the allocator's zone accounting.
#[doc(hidden)]
pub fn dump_zone_state() {
    with_phys_mem(|pm| {
        debug!("--------------- ZONES ---------------");
        for stats in pm.zone_stats() {
            debug!("{:X?}", stats);
        }
        debug!("-------------------------------------");
    });
}
