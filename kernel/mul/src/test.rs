//! MUL tests, run against a simulated physical arena: a leaked host
//! allocation presented to the frame allocator as the boot memory map,
//! with the identity driver standing in for the hardware MMU.

extern crate std;

use super::*;
use boot_info::{MemoryKind, MemoryRegion};
use std::alloc::Layout;
use std::sync::Once;
use std::vec::Vec as StdVec;

const ARENA_SIZE: usize = 32 * 1024 * 1024;

static INIT: Once = Once::new();
static DRIVER: IdentityDriver = IdentityDriver::new();

/// One-time process-wide bring-up of the frame allocator and the MUL over
/// the arena.
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
        early_init(&DRIVER);
        init().unwrap();
    });
}

fn kva(addr: usize) -> VirtualAddress {
    VirtualAddress::new_canonical(KERNEL_SPACE_START + addr)
}

#[test]
fn phys_window_roundtrip() {
    setup();
    let page = frame_allocator::alloc_page().unwrap();
    zero_frame(page.frame());
    let mut byte = [0xFFu8];
    read_phys(page.start_address() + 0x123, &mut byte);
    assert_eq!(byte[0], 0);

    write_phys(page.start_address() + 0xFFF, &[0xAB]);
    read_phys(page.start_address() + 0xFFF, &mut byte);
    assert_eq!(byte[0], 0xAB);
    frame_allocator::free_page(page);
}

#[test]
fn kernel_space_map_unmap() {
    setup();
    let space = kernel_space();
    let va = kva(0x40_0000);
    let page = frame_allocator::alloc_page().unwrap();
    let frame = page.frame();

    assert_eq!(space.get_mapping(va), None);
    space.map(va, frame, PteFlags::kernel_data()).unwrap();
    let (mapped, flags) = space.get_mapping(va).unwrap();
    assert_eq!(mapped, frame);
    assert!(flags.is_present() && flags.is_writable() && flags.is_kernel_only());

    // Tighten to read-only in place.
    space
        .change_perm(va, PteFlags::PRESENT | PteFlags::READ | PteFlags::KERNEL)
        .unwrap();
    let (_, flags) = space.get_mapping(va).unwrap();
    assert!(!flags.is_writable());

    assert_eq!(space.unmap(va).unwrap(), frame);
    assert_eq!(space.get_mapping(va), None);
    assert_eq!(space.unmap(va), Err(MulError::NotMapped));
    frame_allocator::free_page(page);
}

#[test]
fn user_permissions_rejected_in_kernel_half() {
    setup();
    let page = frame_allocator::alloc_page().unwrap();
    let err = kernel_space().map(kva(0x80_0000), page.frame(), PteFlags::user_data());
    assert_eq!(err, Err(MulError::InvalidMapping));

    // And a user space cannot reach into the kernel half at all.
    let user = MulSpace::new_user().unwrap();
    let err = user.map(kva(0x80_0000), page.frame(), PteFlags::kernel_data());
    assert_eq!(err, Err(MulError::InvalidMapping));
    frame_allocator::free_page(page);
}

#[test]
fn user_space_mappings_and_teardown() {
    setup();
    let user = MulSpace::new_user().unwrap();
    let va = VirtualAddress::new_canonical(0x20_0000);
    let page = frame_allocator::alloc_page().unwrap();
    user.map(va, page.frame(), PteFlags::user_data()).unwrap();
    assert_eq!(user.get_mapping(va).unwrap().0, page.frame());

    // The kernel space never sees user-half mappings.
    assert_eq!(
        kernel_space().map(va, page.frame(), PteFlags::user_data()),
        Err(MulError::InvalidMapping)
    );

    let unmapped = user.unmap(va).unwrap();
    assert_eq!(unmapped, page.frame());
    frame_allocator::free_page(page);
    drop(user);
}

/// The kernel-version shadow protocol and the early map helpers, driven
/// sequentially because both care about which root is active.
#[test]
fn kernel_shadowing_and_early_maps() {
    setup();

    // A fresh user space sees kernel mappings that predate it.
    let k1 = kva(0x1000_0000_0000); // its own top-level slot
    let page1 = frame_allocator::alloc_page().unwrap();
    kernel_space().map(k1, page1.frame(), PteFlags::kernel_data()).unwrap();
    let user = MulSpace::new_user().unwrap();
    assert_eq!(user.get_mapping(k1).unwrap().0, page1.frame());

    // A kernel mapping in a brand-new top-level slot is invisible until
    // the space picks up the new version on switch.
    let k2 = kva(0x2000_0000_0000);
    let page2 = frame_allocator::alloc_page().unwrap();
    kernel_space().map(k2, page2.frame(), PteFlags::kernel_data()).unwrap();
    assert_eq!(user.get_mapping(k2), None);
    user.switch_to();
    assert_eq!(user.get_mapping(k2).unwrap().0, page2.frame());

    // Early helpers walk whatever is active; make that the kernel root.
    kernel_space().switch_to();
    let early_va = kva(0x3000_0000_0000);
    let page3 = frame_allocator::alloc_page().unwrap();
    early_map(early_va, page3.frame(), PteFlags::kernel_data()).unwrap();
    assert_eq!(
        early_get_phys(early_va + 0x42),
        Some(page3.frame().start_address() + 0x42)
    );
    assert_eq!(early_get_phys(kva(0x4000_0000_0000)), None);
}
