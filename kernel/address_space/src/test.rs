//! Address-space tests: region-list invariants, the hint policy, and the
//! kernel-space helpers, over the simulated physical arena.

extern crate std;

use super::*;
use boot_info::{MemoryKind, MemoryRegion};
use std::alloc::Layout;
use std::sync::Once;
use std::vec::Vec as StdVec;

const ARENA_SIZE: usize = 16 * 1024 * 1024;

static INIT: Once = Once::new();
static DRIVER: mul::IdentityDriver = mul::IdentityDriver::new();

fn setup() {
    INIT.call_once(|| {
        let layout = Layout::from_size_align(ARENA_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) } as usize;
        assert!(base != 0);
        let regions: StdVec<MemoryRegion> = std::vec![MemoryRegion {
            base: PhysicalAddress::new_canonical(base),
            length: ARENA_SIZE,
            kind: MemoryKind::Free,
        }];
        frame_allocator::init(regions.leak(), &[]).unwrap();
        mul::early_init(&DRIVER);
        mul::init().unwrap();
        kernel_init(None).unwrap();
    });
}

fn anon(pages: usize) -> ObjRef {
    MemObject::new_anon(pages, PteFlags::user_data())
}

fn assert_sorted_non_overlapping(space: &AddrSpace) {
    let regions = space.regions_snapshot();
    for pair in regions.windows(2) {
        assert!(pair[0].start() < pair[1].start());
        assert!(pair[0].end() <= pair[1].start());
    }
}

#[test]
fn regions_allocate_in_address_order() {
    setup();
    let space = AddrSpace::new_user().unwrap();
    let a = space.alloc_space(anon(1), VirtualAddress::zero(), 1).unwrap();
    let b = space.alloc_space(anon(1), VirtualAddress::zero(), 1).unwrap();
    let c = space.alloc_space(anon(1), VirtualAddress::zero(), 1).unwrap();

    assert!(a.start() < b.start() && b.start() < c.start());
    assert_eq!(space.num_regions(), 3);
    assert_sorted_non_overlapping(&space);

    // Free the middle one, then ask for exactly that address back.
    let middle = b.start();
    space.free_space(&b).unwrap();
    assert_eq!(space.num_regions(), 2);
    let again = space.alloc_space(anon(1), middle, 1).unwrap();
    assert_eq!(again.start(), middle);
    assert_sorted_non_overlapping(&space);
}

#[test]
fn find_region_covers_every_page() {
    setup();
    let space = AddrSpace::new_user().unwrap();
    let region = space.alloc_space(anon(4), VirtualAddress::zero(), 4).unwrap();

    for i in 0..4 {
        let va = region.start() + i * PAGE_SIZE + 0x10;
        let found = space.find_region(va).expect("address inside the region");
        assert_eq!(found.start(), region.start());
    }
    assert!(space.find_region(region.end()).is_none());
    assert!(space.find_region(region.start() - PAGE_SIZE).is_none());
}

#[test]
fn fault_hint_caches_last_region() {
    setup();
    let space = AddrSpace::new_user().unwrap();
    let a = space.alloc_space(anon(1), VirtualAddress::zero(), 1).unwrap();
    let b = space.alloc_space(anon(1), VirtualAddress::zero(), 1).unwrap();

    let found = space.find_fault_region(a.start()).unwrap();
    assert_eq!(found.start(), a.start());
    // Hit on the hinted region, then a miss that moves the hint.
    assert_eq!(space.find_fault_region(a.start() + 0x80).unwrap().start(), a.start());
    assert_eq!(space.find_fault_region(b.start()).unwrap().start(), b.start());
    assert!(space.find_fault_region(b.end() + PAGE_SIZE).is_none());
}

#[test]
fn hint_walk_restarts_from_bottom() {
    setup();
    let space = AddrSpace::new_user().unwrap();
    // Hint one page under the top of the space: the two-page request
    // cannot fit above the hint, so the walk restarts from the bottom.
    let hint = space.end_addr() - PAGE_SIZE;
    let region = space.alloc_space(anon(2), hint, 2).unwrap();
    assert_eq!(region.start(), space.start_addr());
}

#[test]
fn hinted_alloc_lands_exactly_on_free_gap() {
    setup();
    let space = AddrSpace::new_user().unwrap();
    let first = space.alloc_space(anon(8), VirtualAddress::zero(), 8).unwrap();
    let hole = first.start() + 3 * PAGE_SIZE;
    // A hint in the middle of an occupied region skips past it.
    let next = space.alloc_space(anon(1), hole, 1).unwrap();
    assert_eq!(next.start(), first.end());
}

#[test]
fn kv_region_is_mapped_and_usable() {
    setup();
    let region = alloc_kv_region(2, PteFlags::READ | PteFlags::WRITE).unwrap();
    let space = kernel_space();
    let mul_space = space.mul();

    let (frame, flags) = mul_space.get_mapping(region.start()).unwrap();
    assert!(flags.is_kernel_only() && flags.is_writable());

    // Fresh anonymous KVA reads back zero, and sticks after a write.
    let mut byte = [0xFF];
    mul::read_phys(frame.start_address(), &mut byte);
    assert_eq!(byte[0], 0);
    mul::write_phys(frame.start_address() + 0x40, &[0x5A]);
    mul::read_phys(frame.start_address() + 0x40, &mut byte);
    assert_eq!(byte[0], 0x5A);

    space.free_space(&region).unwrap();
    assert!(mul_space.get_mapping(region.start()).is_none());
}

#[test]
fn protect_region_rewrites_installed_mappings() {
    setup();
    let region = alloc_kv_region(2, PteFlags::READ | PteFlags::WRITE).unwrap();
    let space = kernel_space();
    let (_, flags) = space.mul().get_mapping(region.start()).unwrap();
    assert!(flags.is_writable());

    space
        .protect_region(&region, PteFlags::PRESENT | PteFlags::READ | PteFlags::KERNEL)
        .unwrap();
    for i in 0..2 {
        let (_, flags) = space.mul().get_mapping(region.start() + i * PAGE_SIZE).unwrap();
        assert!(!flags.is_writable(), "every installed mapping was rewritten");
    }
    assert!(!region.object().perm().is_writable());
    space.free_space(&region).unwrap();
}

#[test]
fn kv_mmio_window_maps_given_frames() {
    setup();
    // Stand-in device frames: any distinct physical range works for the
    // window bookkeeping.
    let backing = frame_allocator::alloc_page().unwrap();
    let phys = backing.start_address();
    let region = alloc_kv_mmio(phys, 1, false).unwrap();

    let space = kernel_space();
    let (frame, flags) = space.mul().get_mapping(region.start()).unwrap();
    assert_eq!(frame.start_address(), phys);
    assert!(flags.contains(PteFlags::CACHE_DISABLE));
    assert!(flags.is_kernel_only());

    space.free_space(&region).unwrap();
    frame_allocator::free_page(backing);
}

#[test]
fn user_space_teardown_unmaps_pages() {
    setup();
    let space = AddrSpace::new_user().unwrap();
    let region = space.alloc_space(anon(1), VirtualAddress::zero(), 1).unwrap();
    let object = region.object();
    let frame = object.page_in(0).unwrap();
    space.mul().map(region.start(), frame, object.perm()).unwrap();
    frame_allocator::rmap_add(frame, space.id(), region.start());

    drop(region);
    drop(space);
    // The object survived (we hold a ref), but the back-mapping is gone.
    assert!(frame_allocator::rmap_take(frame).is_empty());
    assert_eq!(object.resident_count(), 1);
}
