//! Address spaces: ordered collections of non-overlapping virtual regions,
//! each region binding a range of pages to a memory object.
//!
//! Regions live in an intrusive red-black tree keyed by their start
//! address, with two permanent *sentinel* regions at the space's bounds so
//! that every gap, including the ones at the edges, is the span between
//! two adjacent tree entries. Allocation is first-fit with a hint: the
//! walk starts at the region at or before the hint, and if nothing fits
//! from there to the top, it restarts from the bottom, so a caller's hint
//! never deprives them of valid space below it.
//!
//! One distinguished space covers the kernel half; per-process spaces
//! cover the user half and shadow the kernel's top-level page tables
//! through the MUL.

#![no_std]

extern crate alloc;
#[macro_use]
extern crate log;

#[cfg(test)]
mod test;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use intrusive_collections::{intrusive_adapter, Bound, KeyAdapter, RBTree, RBTreeAtomicLink};
use kernel_config::memory::{
    KERNEL_SPACE_START, PAGE_SIZE, PT_CACHE_BASE, USER_SPACE_START,
};
use memory_structs::{Frame, PhysicalAddress, VirtualAddress};
use memory_object::{MemObject, ObjRef};
use mul::{MulError, MulSpace};
use pte_flags::PteFlags;
use spin::Once;
use sync_irq::IplMutex;

/// The first non-allocatable user address: the page-aligned top of the
/// user half, used as the user spaces' high sentinel.
const USER_SPACE_LIMIT: usize = 0x0000_7FFF_FFFF_F000;

/// Errors surfaced by region operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpaceError {
    /// No gap large enough for the requested region.
    NoSpace,
    /// No region covers the given address.
    NotFound,
    /// The underlying mapping operation failed.
    Mapping(MulError),
}

impl From<MulError> for SpaceError {
    fn from(err: MulError) -> SpaceError {
        SpaceError::Mapping(err)
    }
}

/// One virtual region: `num_pages` pages starting at `start`, backed by a
/// memory object from its offset zero. Sentinels carry no object and zero
/// pages.
pub struct Region {
    link: RBTreeAtomicLink,
    start: VirtualAddress,
    num_pages: usize,
    object: Option<ObjRef>,
}

intrusive_adapter!(RegionAdapter = Arc<Region>: Region { link: RBTreeAtomicLink });

impl<'a> KeyAdapter<'a> for RegionAdapter {
    type Key = VirtualAddress;
    fn get_key(&self, region: &'a Region) -> VirtualAddress {
        region.start
    }
}

impl Region {
    fn sentinel(start: VirtualAddress) -> Arc<Region> {
        Arc::new(Region { link: RBTreeAtomicLink::new(), start, num_pages: 0, object: None })
    }

    pub fn start(&self) -> VirtualAddress {
        self.start
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// One past the last address of the region.
    pub fn end(&self) -> VirtualAddress {
        self.start + self.num_pages * PAGE_SIZE
    }

    pub fn is_sentinel(&self) -> bool {
        self.object.is_none()
    }

    /// The backing object. Panics on sentinels, which never escape the
    /// space's own walks.
    pub fn object(&self) -> ObjRef {
        self.object.clone().expect("sentinel region has no object")
    }

    pub fn contains(&self, vaddr: VirtualAddress) -> bool {
        vaddr >= self.start && vaddr < self.end()
    }
}

struct SpaceInner {
    regions: RBTree<RegionAdapter>,
    num_entries: usize,
    /// Start address of the last region a fault resolved to.
    fault_hint: Option<VirtualAddress>,
}

/// How a space reaches its page tables: the kernel space borrows the
/// MUL-global one, user spaces own theirs.
enum MulHandle {
    Kernel,
    User(MulSpace),
}

/// An address space. See the module docs.
pub struct AddrSpace {
    id: u64,
    start: VirtualAddress,
    /// Exclusive upper boundary; also the high sentinel's start.
    end: VirtualAddress,
    mul: MulHandle,
    inner: IplMutex<SpaceInner>,
}

static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

/// The distinguished kernel space, created by [`kernel_init`].
static KERNEL_ADDR_SPACE: Once<Arc<AddrSpace>> = Once::new();

/// The user space currently active on this CPU, if any.
static CURRENT_USER_SPACE: IplMutex<Option<Arc<AddrSpace>>> = IplMutex::new(None);

fn new_space_inner(start: VirtualAddress, end: VirtualAddress) -> SpaceInner {
    let mut regions = RBTree::new(RegionAdapter::new());
    regions.insert(Region::sentinel(start));
    regions.insert(Region::sentinel(end));
    SpaceInner { regions, num_entries: 0, fault_hint: None }
}

/// Creates the kernel address space over the kernel half (stopping below
/// the page-table cache windows). `kernel_image` describes the statically
/// mapped kernel area: its base address and the physical frames backing
/// it, which become the distinguished kernel-resident region.
pub fn kernel_init(kernel_image: Option<(VirtualAddress, Vec<Frame>)>) -> Result<(), SpaceError> {
    if KERNEL_ADDR_SPACE.is_completed() {
        warn!("address_space: kernel_init called twice");
        return Ok(());
    }
    let space = Arc::new(AddrSpace {
        id: 0,
        start: VirtualAddress::new_canonical(KERNEL_SPACE_START),
        end: VirtualAddress::new_canonical(PT_CACHE_BASE),
        mul: MulHandle::Kernel,
        inner: IplMutex::new(new_space_inner(
            VirtualAddress::new_canonical(KERNEL_SPACE_START),
            VirtualAddress::new_canonical(PT_CACHE_BASE),
        )),
    });
    if let Some((image_base, frames)) = kernel_image {
        let object = MemObject::new_kernel(
            frames,
            PteFlags::kernel_data() | PteFlags::EXECUTABLE,
        );
        space.alloc_space(object, image_base, 0)?;
    }
    KERNEL_ADDR_SPACE.call_once(|| space);
    Ok(())
}

/// The kernel address space.
pub fn kernel_space() -> Arc<AddrSpace> {
    KERNEL_ADDR_SPACE.get().expect("address_space::kernel_init has not run").clone()
}

/// Switches this CPU to `space`: loads its page tables (honoring any
/// deferred flush) and records it as current for fault resolution.
pub fn switch_space(space: Arc<AddrSpace>) {
    space.mul().switch_to();
    *CURRENT_USER_SPACE.lock() = Some(space);
}

/// The user space currently active on this CPU.
pub fn current_user_space() -> Option<Arc<AddrSpace>> {
    CURRENT_USER_SPACE.lock().clone()
}

/// Resolves the space owning `vaddr`: kernel half or the current user
/// space.
pub fn space_for(vaddr: VirtualAddress) -> Option<Arc<AddrSpace>> {
    if vaddr.value() >= KERNEL_SPACE_START {
        KERNEL_ADDR_SPACE.get().cloned()
    } else {
        current_user_space()
    }
}

impl AddrSpace {
    /// Creates a per-process space over the user half.
    pub fn new_user() -> Result<Arc<AddrSpace>, MulError> {
        let start = VirtualAddress::new_canonical(USER_SPACE_START);
        let end = VirtualAddress::new_canonical(USER_SPACE_LIMIT);
        Ok(Arc::new(AddrSpace {
            id: NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed),
            start,
            end,
            mul: MulHandle::User(MulSpace::new_user()?),
            inner: IplMutex::new(new_space_inner(start, end)),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn start_addr(&self) -> VirtualAddress {
        self.start
    }

    pub fn end_addr(&self) -> VirtualAddress {
        self.end
    }

    /// This space's page tables.
    pub fn mul(&self) -> &MulSpace {
        match &self.mul {
            MulHandle::Kernel => mul::kernel_space(),
            MulHandle::User(space) => space,
        }
    }

    pub fn num_regions(&self) -> usize {
        self.inner.lock().num_entries
    }

    /// Allocates a region of `num_pages` pages bound to `object`,
    /// first-fit starting at the region at or before `hint` (pass the
    /// space's start, or zero, for "anywhere"). `num_pages == 0` takes the
    /// object's own page count.
    pub fn alloc_space(
        &self,
        object: ObjRef,
        hint: VirtualAddress,
        num_pages: usize,
    ) -> Result<Arc<Region>, SpaceError> {
        let num_pages = if num_pages == 0 { object.page_count() } else { num_pages };
        if num_pages == 0 {
            return Err(SpaceError::NoSpace);
        }
        let hint = if hint < self.start || hint >= self.end {
            self.start
        } else {
            VirtualAddress::new_canonical(hint.value() & !(PAGE_SIZE - 1))
        };
        let want = num_pages * PAGE_SIZE;

        let mut inner = self.inner.lock();
        let base = Self::find_gap(&inner.regions, hint, want)
            // The hint walk saw nothing past the hint; retry the whole
            // range so space below the hint still counts.
            .or_else(|| Self::find_gap(&inner.regions, self.start, want))
            .ok_or(SpaceError::NoSpace)?;

        let region = Arc::new(Region {
            link: RBTreeAtomicLink::new(),
            start: base,
            num_pages,
            object: Some(object),
        });
        inner.regions.insert(region.clone());
        inner.num_entries += 1;
        Ok(region)
    }

    /// Walks gaps from the region at or before `from`, returning the base
    /// of the first gap of at least `want` bytes.
    fn find_gap(
        regions: &RBTree<RegionAdapter>,
        from: VirtualAddress,
        want: usize,
    ) -> Option<VirtualAddress> {
        let mut cursor = regions.upper_bound(Bound::Included(&from));
        if cursor.is_null() {
            cursor = regions.front();
        }
        while let Some(region) = cursor.get() {
            let gap_base = core::cmp::max(region.end(), from);
            cursor.move_next();
            let next_start = match cursor.get() {
                Some(next) => next.start,
                None => break,
            };
            if gap_base + want <= next_start {
                return Some(gap_base);
            }
        }
        None
    }

    /// Removes a region: every mapped page is unmapped (with its
    /// back-mapping cleared) and the region leaves the list. The backing
    /// object loses one reference.
    pub fn free_space(&self, region: &Arc<Region>) -> Result<(), SpaceError> {
        let mut inner = self.inner.lock();
        self.unmap_region_pages(region);
        if inner.fault_hint == Some(region.start) {
            inner.fault_hint = None;
        }
        let mut cursor = inner.regions.find_mut(&region.start);
        match cursor.remove() {
            Some(_removed) => {
                inner.num_entries -= 1;
                Ok(())
            }
            None => Err(SpaceError::NotFound),
        }
    }

    fn unmap_region_pages(&self, region: &Region) {
        let mul_space = self.mul();
        for i in 0..region.num_pages {
            let va = region.start + i * PAGE_SIZE;
            match mul_space.unmap(va) {
                Ok(frame) => frame_allocator::rmap_remove(frame, self.id, va),
                Err(MulError::NotMapped) => {}
                Err(err) => warn!("address_space: unmap of {} failed: {:?}", va, err),
            }
        }
    }

    /// Changes a region's object permissions and rewrites every mapping
    /// already installed for it, so the change applies immediately rather
    /// than at the next fault.
    pub fn protect_region(&self, region: &Arc<Region>, new_perm: PteFlags) -> Result<(), SpaceError> {
        let object = region.object();
        object.protect(new_perm);
        let mul_space = self.mul();
        for i in 0..region.num_pages() {
            let va = region.start() + i * PAGE_SIZE;
            match mul_space.change_perm(va, new_perm) {
                Ok(()) | Err(MulError::NotMapped) => {}
                Err(err) => return Err(SpaceError::Mapping(err)),
            }
        }
        Ok(())
    }

    /// The region covering `vaddr`, if any. The general lookup used by
    /// management paths.
    pub fn find_region(&self, vaddr: VirtualAddress) -> Option<Arc<Region>> {
        let inner = self.inner.lock();
        Self::lookup(&inner.regions, vaddr)
    }

    /// The fault path's lookup: tries the last faulting region first, and
    /// refreshes the hint on the slow path.
    pub fn find_fault_region(&self, vaddr: VirtualAddress) -> Option<Arc<Region>> {
        let mut inner = self.inner.lock();
        if let Some(hint) = inner.fault_hint {
            if let Some(region) = inner.regions.find(&hint).clone_pointer() {
                if region.contains(vaddr) {
                    return Some(region);
                }
            }
        }
        let region = Self::lookup(&inner.regions, vaddr)?;
        inner.fault_hint = Some(region.start);
        Some(region)
    }

    fn lookup(regions: &RBTree<RegionAdapter>, vaddr: VirtualAddress) -> Option<Arc<Region>> {
        let cursor = regions.upper_bound(Bound::Included(&vaddr));
        let region = cursor.clone_pointer()?;
        if !region.is_sentinel() && region.contains(vaddr) {
            Some(region)
        } else {
            None
        }
    }

    /// Walks every live region in address order, for diagnostics and
    /// teardown.
    pub fn regions_snapshot(&self) -> Vec<Arc<Region>> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.num_entries);
        let mut cursor = inner.regions.front();
        while let Some(region) = cursor.clone_pointer() {
            if !region.is_sentinel() {
                out.push(region);
            }
            cursor.move_next();
        }
        out
    }
}

impl Drop for AddrSpace {
    fn drop(&mut self) {
        // Unmap everything while the page tables still exist; the owned
        // MulSpace (if any) drops after this and frees its table frames.
        let mut inner = self.inner.lock();
        let mut cursor = inner.regions.front_mut();
        loop {
            let is_sentinel = match cursor.get() {
                None => break,
                Some(region) => region.is_sentinel(),
            };
            if is_sentinel {
                cursor.move_next();
                continue;
            }
            // remove() advances the cursor to the successor.
            let region = cursor.remove().expect("cursor vanished mid-walk");
            self.unmap_region_pages(&region);
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel virtual-address helpers
// ---------------------------------------------------------------------------

/// Allocates `num_pages` of kernel virtual address space backed by fresh
/// anonymous memory, eagerly faulted in and mapped. Returns the region.
pub fn alloc_kv_region(num_pages: usize, perm: PteFlags) -> Result<Arc<Region>, SpaceError> {
    let space = kernel_space();
    let object = MemObject::new_anon(num_pages, perm | PteFlags::KERNEL);
    let region = space.alloc_space(object, space.start_addr(), num_pages)?;
    map_region_eagerly(&space, &region)?;
    Ok(region)
}

/// Maps `num_pages` of MMIO starting at `phys` into kernel space,
/// cache-disabled unless `write_through` asks for the write-through
/// policy instead. Returns the region; its start is the window address.
pub fn alloc_kv_mmio(
    phys: PhysicalAddress,
    num_pages: usize,
    write_through: bool,
) -> Result<Arc<Region>, SpaceError> {
    let space = kernel_space();
    let first = Frame::containing_address(phys);
    let frames: Vec<Frame> = (0..num_pages).map(|i| first + i).collect();
    let mut perm = PteFlags::kernel_data();
    if write_through {
        perm |= PteFlags::WRITE_THROUGH;
    } else {
        perm |= PteFlags::CACHE_DISABLE;
    }
    let object = MemObject::new_kernel(frames, perm);
    let region = space.alloc_space(object, space.start_addr(), num_pages)?;
    map_region_eagerly(&space, &region)?;
    Ok(region)
}

/// Faults in and maps every page of `region` up front. Kernel callers
/// expect their KVA to be immediately usable.
fn map_region_eagerly(space: &Arc<AddrSpace>, region: &Arc<Region>) -> Result<(), SpaceError> {
    let object = region.object();
    let perm = object.perm();
    let mul_space = space.mul();
    for i in 0..region.num_pages() {
        let va = region.start() + i * PAGE_SIZE;
        let frame = object
            .page_in(i * PAGE_SIZE)
            .map_err(|_| SpaceError::Mapping(MulError::OutOfMemory))?;
        mul_space.map(va, frame, perm)?;
        frame_allocator::rmap_add(frame, space.id(), va);
    }
    Ok(())
}
