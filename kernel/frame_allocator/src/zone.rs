//! Zone bookkeeping: frame descriptors, free lists, and the allocator core.
//!
//! A zone is a contiguous PFN range sharing one purpose classification.
//! Usable zones carry a descriptor per frame; the free list is a doubly
//! linked list threaded through descriptor indices, pushed and popped at
//! the head so that allocation is O(1) and recently-freed frames are
//! reused first. Reserved zones carry no descriptors at all, their frames
//! are synthesized as `Unusable` on lookup.

use alloc::vec::Vec;
use boot_info::{MemoryKind, MemoryRegion};
use core::fmt;
use kernel_config::memory::{LOW_ZONE_PHYS_LIMIT, PAGE_SIZE};
use memory_structs::{Frame, FrameRange, PhysicalAddress, VirtualAddress};

use crate::{AllocError, PageFrame, PageInfo};

/// Zone index used by frames handed out during the bootstrap stage,
/// before any zone exists.
pub(crate) const BOOTSTRAP_ZONE: u16 = u16::MAX;

bitflags::bitflags! {
    /// Purpose classification of a zone.
    pub struct ZoneFlags: u32 {
        /// Frames are plain RAM the kernel may use.
        const KERNEL_USABLE    = 1 << 0;
        /// Frames are memory-mapped device registers.
        const MMIO             = 1 << 1;
        /// Frames are permanently unusable.
        const RESERVED         = 1 << 2;
        /// Frames hold boot/ACPI data and may be reclaimed later.
        const RECLAIMABLE      = 1 << 3;
        /// Frames may be allocated.
        const ALLOCATABLE      = 1 << 4;
        /// Frames are excluded from `alloc_page`; only the constrained
        /// `alloc_pages_at` path may take them (unless everything else
        /// is exhausted).
        const NO_GENERIC_ALLOC = 1 << 5;
    }
}

/// The lifecycle state of one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// On its zone's free list.
    Free,
    /// Handed out but not (yet) attached to a memory object.
    Allocated,
    /// Attached to exactly one memory object at a known offset.
    InObject,
    /// Never allocatable: reserved, MMIO, or pending reclamation.
    Unusable,
}

/// One back-mapping: a virtual address in some space maps this frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RmapEntry {
    pub space_id: u64,
    pub vaddr: VirtualAddress,
}

/// Per-frame descriptor. `prev`/`next` are free-list links (descriptor
/// indices within the zone), valid only while `state == Free`.
struct PageDesc {
    state: PageState,
    prev: Option<u32>,
    next: Option<u32>,
    offset_in_object: usize,
    rmap: Vec<RmapEntry>,
}

impl PageDesc {
    fn new(state: PageState) -> PageDesc {
        PageDesc { state, prev: None, next: None, offset_in_object: 0, rmap: Vec::new() }
    }
}

struct Zone {
    base: Frame,
    num_pages: usize,
    flags: ZoneFlags,
    free_count: usize,
    free_head: Option<u32>,
    /// Empty for descriptor-less (RESERVED) zones.
    descs: Vec<PageDesc>,
}

/// A snapshot of one zone's accounting, for logs and tests.
#[derive(Clone)]
pub struct ZoneStats {
    pub base: Frame,
    pub num_pages: usize,
    pub free_count: usize,
    pub flags: ZoneFlags,
}

impl fmt::Debug for ZoneStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Zone {{ base: {:#X}, pages: {}, free: {}, flags: {:?} }}",
            self.base.start_address().value(),
            self.num_pages,
            self.free_count,
            self.flags
        )
    }
}

impl Zone {
    fn contains(&self, frame: Frame) -> bool {
        frame.number() >= self.base.number() && frame.number() < self.base.number() + self.num_pages
    }

    fn desc_idx(&self, frame: Frame) -> usize {
        frame.number() - self.base.number()
    }

    fn frame_at(&self, idx: usize) -> Frame {
        self.base + idx
    }

    /// Pushes the descriptor at `idx` onto the head of the free list.
    fn push_free(&mut self, idx: usize) {
        let old_head = self.free_head;
        {
            let desc = &mut self.descs[idx];
            desc.state = PageState::Free;
            desc.prev = None;
            desc.next = old_head;
        }
        if let Some(old) = old_head {
            self.descs[old as usize].prev = Some(idx as u32);
        }
        self.free_head = Some(idx as u32);
        self.free_count += 1;
    }

    /// Pops the head of the free list.
    fn pop_free(&mut self) -> Option<usize> {
        let head = self.free_head? as usize;
        self.unlink_free(head);
        Some(head)
    }

    /// Removes the descriptor at `idx` from wherever it sits in the free list.
    fn unlink_free(&mut self, idx: usize) {
        let (prev, next) = {
            let desc = &mut self.descs[idx];
            debug_assert_eq!(desc.state, PageState::Free);
            desc.state = PageState::Allocated;
            (desc.prev.take(), desc.next.take())
        };
        match prev {
            Some(p) => self.descs[p as usize].next = next,
            None => self.free_head = next,
        }
        if let Some(n) = next {
            self.descs[n as usize].prev = prev;
        }
        self.free_count -= 1;
    }
}

/// The allocator core: every zone, sorted ascending by base PFN.
pub(crate) struct PhysMem {
    zones: Vec<Zone>,
}

impl PhysMem {
    /// Builds all zones from the boot memory map. `wired` frame ranges are
    /// marked allocated up front and never appear on a free list.
    pub(crate) fn build(
        memory_map: &[MemoryRegion],
        wired: &[FrameRange],
    ) -> Result<PhysMem, &'static str> {
        let mut pending: Vec<(PhysicalAddress, usize, ZoneFlags)> = Vec::new();
        for region in memory_map {
            if region.length < PAGE_SIZE {
                continue;
            }
            match region.kind {
                MemoryKind::Free => {
                    // Split usable RAM at the low-zone boundary so that
                    // address-constrained callers keep a private pool.
                    let start = region.base.value();
                    let end = start + region.length;
                    let low_flags = ZoneFlags::KERNEL_USABLE
                        | ZoneFlags::ALLOCATABLE
                        | ZoneFlags::NO_GENERIC_ALLOC;
                    let high_flags = ZoneFlags::KERNEL_USABLE | ZoneFlags::ALLOCATABLE;
                    if end <= LOW_ZONE_PHYS_LIMIT {
                        pending.push((region.base, region.length, low_flags));
                    } else if start >= LOW_ZONE_PHYS_LIMIT {
                        pending.push((region.base, region.length, high_flags));
                    } else {
                        pending.push((region.base, LOW_ZONE_PHYS_LIMIT - start, low_flags));
                        pending.push((
                            PhysicalAddress::new_canonical(LOW_ZONE_PHYS_LIMIT),
                            end - LOW_ZONE_PHYS_LIMIT,
                            high_flags,
                        ));
                    }
                }
                MemoryKind::Reserved | MemoryKind::AcpiNvs => {
                    pending.push((region.base, region.length, ZoneFlags::RESERVED));
                }
                MemoryKind::AcpiReclaim | MemoryKind::BootReclaim => {
                    pending.push((
                        region.base,
                        region.length,
                        ZoneFlags::KERNEL_USABLE | ZoneFlags::RECLAIMABLE,
                    ));
                }
            }
        }

        pending.sort_by_key(|&(base, ..)| base);

        // Ensure that no two zones overlap; the map producer is the
        // bootloader, so an overlap means the handoff is corrupt.
        for pair in pending.windows(2) {
            let (a_base, a_len, _) = pair[0];
            let (b_base, ..) = pair[1];
            if a_base.value() + a_len > b_base.value() {
                error!(
                    "frame_allocator: memory map regions at {:#X} and {:#X} overlap",
                    a_base.value(),
                    b_base.value()
                );
                return Err("memory map regions are illegally overlapping");
            }
        }

        let mut zones = Vec::with_capacity(pending.len());
        for (base_addr, len, flags) in pending {
            // A zone covers only the frames fully contained in its region.
            let first = Frame::containing_address(base_addr + (PAGE_SIZE - 1));
            let end_addr = base_addr.value() + len;
            let num_pages = (end_addr / PAGE_SIZE).saturating_sub(first.number());
            if num_pages == 0 {
                continue;
            }

            let mut zone = Zone {
                base: first,
                num_pages,
                flags,
                free_count: 0,
                free_head: None,
                descs: Vec::new(),
            };

            if flags.contains(ZoneFlags::RESERVED) {
                zones.push(zone);
                continue;
            }

            let initial = if flags.contains(ZoneFlags::RECLAIMABLE) {
                // Holds live boot data until explicitly reclaimed.
                PageState::Unusable
            } else {
                PageState::Free
            };
            zone.descs = (0..num_pages).map(|_| PageDesc::new(initial)).collect();

            for range in wired {
                for frame in range.iter() {
                    if zone.contains(frame) {
                        let idx = zone.desc_idx(frame);
                        zone.descs[idx].state = PageState::Allocated;
                    }
                }
            }

            if initial == PageState::Free {
                // Push in ascending order; the head ends up at the highest
                // PFN and allocation proceeds downward, LIFO thereafter.
                for idx in 0..num_pages {
                    if zone.descs[idx].state == PageState::Free {
                        zone.push_free(idx);
                    }
                }
            }
            zones.push(zone);
        }

        Ok(PhysMem { zones })
    }

    fn zone_of(&mut self, frame: Frame) -> Option<(usize, &mut Zone)> {
        let idx = self
            .zones
            .iter()
            .position(|zone| zone.contains(frame))?;
        Some((idx, &mut self.zones[idx]))
    }

    pub(crate) fn alloc_page(&mut self) -> Result<PageFrame, AllocError> {
        // First pass: generic zones only.
        for (zone_idx, zone) in self.zones.iter_mut().enumerate() {
            if !zone.flags.contains(ZoneFlags::ALLOCATABLE)
                || zone.flags.contains(ZoneFlags::NO_GENERIC_ALLOC)
            {
                continue;
            }
            if let Some(idx) = zone.pop_free() {
                return Ok(PageFrame::new(zone.frame_at(idx), zone_idx as u16));
            }
        }
        // Fallback: the constrained zones are better than failing outright.
        for (zone_idx, zone) in self.zones.iter_mut().enumerate() {
            if !zone.flags.contains(ZoneFlags::ALLOCATABLE) {
                continue;
            }
            if let Some(idx) = zone.pop_free() {
                warn!("frame_allocator: generic zones exhausted, allocating from constrained zone");
                return Ok(PageFrame::new(zone.frame_at(idx), zone_idx as u16));
            }
        }
        Err(AllocError::OutOfMemory)
    }

    pub(crate) fn alloc_pages_at(
        &mut self,
        num_frames: usize,
        max_phys: PhysicalAddress,
        align_frames: usize,
    ) -> Result<Vec<PageFrame>, AllocError> {
        if num_frames == 0 {
            return Ok(Vec::new());
        }
        let align = align_frames.max(1);
        for zone_idx in 0..self.zones.len() {
            let zone = &self.zones[zone_idx];
            if !zone.flags.contains(ZoneFlags::ALLOCATABLE) {
                continue;
            }
            // Scan for a run of free descriptors at an aligned start whose
            // last frame still ends below the physical bound.
            let mut start = (zone.base.number() + align - 1) / align * align;
            while start + num_frames <= zone.base.number() + zone.num_pages {
                let end_addr = Frame::from_number(start + num_frames).start_address();
                if end_addr.value() > max_phys.value() {
                    break;
                }
                let first_idx = start - zone.base.number();
                let run_free = (first_idx..first_idx + num_frames)
                    .all(|idx| self.zones[zone_idx].descs[idx].state == PageState::Free);
                if run_free {
                    let zone = &mut self.zones[zone_idx];
                    let mut pages = Vec::with_capacity(num_frames);
                    for idx in first_idx..first_idx + num_frames {
                        zone.unlink_free(idx);
                        pages.push(PageFrame::new(zone.frame_at(idx), zone_idx as u16));
                    }
                    return Ok(pages);
                }
                start += align;
            }
        }
        Err(AllocError::OutOfMemory)
    }

    pub(crate) fn free_page(&mut self, page: PageFrame) {
        let zone_idx = page.zone_idx() as usize;
        if zone_idx >= self.zones.len() || !self.zones[zone_idx].contains(page.frame()) {
            error!("frame_allocator: free of {:?} with a stale zone index", page);
            return;
        }
        let zone = &mut self.zones[zone_idx];
        let idx = zone.desc_idx(page.frame());
        match zone.descs[idx].state {
            PageState::Allocated => {}
            PageState::InObject => {
                warn!("frame_allocator: freeing {:?} still attached to an object", page);
                zone.descs[idx].offset_in_object = 0;
            }
            state => {
                error!("frame_allocator: invalid free of {:?} in state {:?}", page, state);
                return;
            }
        }
        zone.descs[idx].rmap.clear();
        zone.push_free(idx);
    }

    pub(crate) fn find_page_by_pfn(&mut self, pfn: usize) -> Option<PageInfo> {
        let frame = Frame::from_number(pfn);
        let (_, zone) = self.zone_of(frame)?;
        let zone_flags = zone.flags;
        if zone.descs.is_empty() {
            // Reserved/MMIO zone: synthesized descriptor, mappable but
            // never allocatable.
            return Some(PageInfo {
                frame,
                state: PageState::Unusable,
                zone_flags,
                offset_in_object: 0,
            });
        }
        let desc = &zone.descs[zone.desc_idx(frame)];
        Some(PageInfo {
            frame,
            state: desc.state,
            zone_flags,
            offset_in_object: desc.offset_in_object,
        })
    }

    pub(crate) fn set_object_attachment(&mut self, page: &PageFrame, offset: Option<usize>) {
        let frame = page.frame();
        let Some((_, zone)) = self.zone_of(frame) else { return };
        if zone.descs.is_empty() {
            return;
        }
        let idx = zone.desc_idx(frame);
        let desc = &mut zone.descs[idx];
        match offset {
            Some(off) => {
                desc.state = PageState::InObject;
                desc.offset_in_object = off;
            }
            None => {
                desc.state = PageState::Allocated;
                desc.offset_in_object = 0;
            }
        }
    }

    pub(crate) fn rmap_add(&mut self, frame: Frame, space_id: u64, vaddr: VirtualAddress) {
        let Some((_, zone)) = self.zone_of(frame) else { return };
        if zone.descs.is_empty() {
            trace!("frame_allocator: rmap on descriptor-less zone ignored");
            return;
        }
        let idx = zone.desc_idx(frame);
        zone.descs[idx].rmap.push(RmapEntry { space_id, vaddr });
    }

    pub(crate) fn rmap_remove(&mut self, frame: Frame, space_id: u64, vaddr: VirtualAddress) {
        let Some((_, zone)) = self.zone_of(frame) else { return };
        if zone.descs.is_empty() {
            return;
        }
        let idx = zone.desc_idx(frame);
        let rmap = &mut zone.descs[idx].rmap;
        if let Some(pos) = rmap
            .iter()
            .position(|e| e.space_id == space_id && e.vaddr == vaddr)
        {
            rmap.swap_remove(pos);
        }
    }

    pub(crate) fn rmap_take(&mut self, frame: Frame) -> Vec<RmapEntry> {
        match self.zone_of(frame) {
            Some((_, zone)) if !zone.descs.is_empty() => {
                let idx = zone.desc_idx(frame);
                core::mem::take(&mut zone.descs[idx].rmap)
            }
            _ => Vec::new(),
        }
    }

    pub(crate) fn total_free(&self) -> usize {
        self.zones.iter().map(|zone| zone.free_count).sum()
    }

    pub(crate) fn reclaim_boot_regions(&mut self) -> usize {
        let mut reclaimed = 0;
        for zone in self.zones.iter_mut() {
            if !zone.flags.contains(ZoneFlags::RECLAIMABLE) {
                continue;
            }
            for idx in 0..zone.num_pages {
                if zone.descs[idx].state == PageState::Unusable {
                    zone.descs[idx].state = PageState::Free;
                    zone.push_free(idx);
                    reclaimed += 1;
                }
            }
            zone.flags.remove(ZoneFlags::RECLAIMABLE);
            zone.flags.insert(ZoneFlags::ALLOCATABLE);
        }
        reclaimed
    }

    pub(crate) fn zone_stats(&self) -> Vec<ZoneStats> {
        self.zones
            .iter()
            .map(|zone| ZoneStats {
                base: zone.base,
                num_pages: zone.num_pages,
                free_count: zone.free_count,
                flags: zone.flags,
            })
            .collect()
    }
}
