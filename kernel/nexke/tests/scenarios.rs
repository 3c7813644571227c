//! End-to-end boot-and-run scenarios: a full `nexke::init` over a
//! simulated physical arena, then the VM and interrupt paths driven the
//! way the trap stubs drive them.

use boot_info::{BootInfo, FirmwareKind, MemoryKind, MemoryRegion};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use kernel_config::memory::PAGE_SIZE;
use memory_structs::{PhysicalAddress, VirtualAddress};
use nexke::interrupt::{self, HwInterrupt, IntContext, IntController, IntMode};
use nexke::Platform;
use pte_flags::PteFlags;
use std::alloc::Layout;

const ARENA_SIZE: usize = 32 * 1024 * 1024;
const EARLY_POOL_SIZE: usize = 64 * 1024;

struct TestClock {
    ticks: AtomicU64,
}
impl time::ClockSource for TestClock {
    fn name(&self) -> &'static str {
        "test-clock"
    }
    fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
    fn precision_ns(&self) -> u64 {
        1_000_000
    }
}

struct TestController {
    connected: AtomicBool,
}
impl IntController for TestController {
    fn name(&self) -> &'static str {
        "test-pic"
    }
    fn begin(&self, ctx: &IntContext) -> u32 {
        ctx.vector
    }
    fn end(&self, _vector: u32) {}
    fn enable(&self, _gsi: u32) {}
    fn disable(&self, _gsi: u32) {}
    fn set_ipl(&self, _ipl: cpu::Ipl) {}
    fn connect(&self, _interrupt: &HwInterrupt) -> Result<(), &'static str> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }
    fn disconnect(&self, _interrupt: &HwInterrupt) {}
}

static DRIVER: mul::IdentityDriver = mul::IdentityDriver::new();
static CLOCK_DEV: TestClock = TestClock { ticks: AtomicU64::new(0) };
static CONTROLLER_DEV: TestController = TestController { connected: AtomicBool::new(false) };

/// Builds a boot handoff over a leaked, page-aligned host arena.
fn fake_boot_info() -> &'static BootInfo {
    let layout = Layout::from_size_align(ARENA_SIZE, PAGE_SIZE).unwrap();
    let base = unsafe { std::alloc::alloc_zeroed(layout) } as usize;
    assert!(base != 0);

    // Bootloader log sitting in "physical" memory, to be relocated.
    let log_msg = b"nexboot: loaded nexke\n";
    unsafe {
        core::ptr::copy_nonoverlapping(log_msg.as_ptr(), (base + 0x800) as *mut u8, log_msg.len())
    };

    let memory_map: Vec<MemoryRegion> = vec![
        MemoryRegion {
            base: PhysicalAddress::new_canonical(base),
            length: ARENA_SIZE,
            kind: MemoryKind::Free,
        },
        // A fabricated firmware hole; never dereferenced.
        MemoryRegion {
            base: PhysicalAddress::new_canonical(0x000A_0000_0000_0000 & 0x000F_FFFF_FFFF_F000),
            length: 0x20000,
            kind: MemoryKind::Reserved,
        },
    ];

    Box::leak(Box::new(BootInfo {
        system_name: "nexnix-test",
        firmware: FirmwareKind::Efi,
        log_buffer: Some((PhysicalAddress::new_canonical(base + 0x800), log_msg.len())),
        memory_map: Box::leak(memory_map.into_boxed_slice()),
        modules: &[],
        // The first chunk of the arena doubles as the boot early pool.
        early_pool: (PhysicalAddress::new_canonical(base), EARLY_POOL_SIZE),
        cmdline: "-loglevel=debug -root=/dev/nd0",
        framebuffer: None,
    }))
}

static HW_FIRED: AtomicBool = AtomicBool::new(false);
fn hw_handler(_interrupt: &HwInterrupt, _ctx: &IntContext) {
    HW_FIRED.store(true, Ordering::Release);
}

fn fault_ctx(vaddr: usize, error_code: u64) -> IntContext {
    IntContext {
        vector: interrupt::PAGE_FAULT_VECTOR,
        error_code,
        fault_addr: vaddr,
        ..Default::default()
    }
}

#[test]
fn boot_and_vm_scenarios() {
    let boot = fake_boot_info();
    let arena_base = boot.memory_map[0].base;

    nexke::init(
        boot,
        Platform {
            mmu: &DRIVER,
            clock: &CLOCK_DEV,
            timer: None,
            int_controller: &CONTROLLER_DEV,
            identity_boot: true,
        },
    )
    .unwrap();

    // --- boot handoff ----------------------------------------------------
    assert_eq!(boot.arg("loglevel"), Some("debug"));
    assert_eq!(boot.arg("root"), Some("/dev/nd0"));
    let mut tail = [0u8; 4096];
    let n = logger::snapshot_tail(&mut tail);
    let text = std::str::from_utf8(&tail[..n]).unwrap();
    assert!(text.contains("nexboot: loaded nexke"), "boot log was relocated");
    assert!(text.contains("core initialized"));

    // --- S1: the frame allocator over the boot map -----------------------
    // 32 MiB of usable RAM minus the wired early pool.
    let expected_free = (ARENA_SIZE - EARLY_POOL_SIZE) / PAGE_SIZE;
    let free_at_boot = frame_allocator::total_free();
    assert!(free_at_boot <= expected_free);
    assert!(free_at_boot >= expected_free - 64, "only init structures may be missing");

    let page = frame_allocator::alloc_page().unwrap();
    let inside_pfn = arena_base.value() / PAGE_SIZE + 1024;
    let info = frame_allocator::find_page_by_pfn(inside_pfn).unwrap();
    assert!(info.zone_flags.contains(frame_allocator::ZoneFlags::KERNEL_USABLE));
    frame_allocator::free_page(page);

    // The fabricated firmware hole resolves as unusable.
    let hole_pfn = boot.memory_map[1].base.value() / PAGE_SIZE;
    let hole = frame_allocator::find_page_by_pfn(hole_pfn).unwrap();
    assert_eq!(hole.state, frame_allocator::PageState::Unusable);

    // --- S2: anonymous memory through the real trap path ------------------
    let space = address_space::AddrSpace::new_user().unwrap();
    let object = memory_object::MemObject::new_anon(4, PteFlags::user_data());
    let region = space
        .alloc_space(object.clone(), VirtualAddress::new_canonical(0x20_0000), 4)
        .unwrap();
    assert_eq!(region.start().value(), 0x20_0000);
    address_space::switch_space(space.clone());

    // Read fault: vector 14, user, not-present.
    assert!(interrupt::dispatch(&fault_ctx(0x20_0000, 0x4)));
    assert_eq!(object.resident_count(), 1);
    let (frame, _) = space.mul().get_mapping(VirtualAddress::new_canonical(0x20_0000)).unwrap();
    let mut byte = [0xFF];
    mul::read_phys(frame.start_address(), &mut byte);
    assert_eq!(byte[0], 0x00, "anonymous pages arrive zeroed");

    // Write through the mapping's frame; the value sticks.
    mul::write_phys(frame.start_address() + 0xFFF, &[0xAB]);
    mul::read_phys(frame.start_address() + 0xFFF, &mut byte);
    assert_eq!(byte[0], 0xAB);

    // Touch the second page by write fault.
    assert!(interrupt::dispatch(&fault_ctx(0x20_1FFF, 0x6)));
    assert_eq!(object.resident_count(), 2);

    // A stray access is refused, not serviced.
    assert!(!interrupt::dispatch(&fault_ctx(0x7F0_0000, 0x4)));

    // --- S3: hint-exact reallocation --------------------------------------
    let anon = |pages| memory_object::MemObject::new_anon(pages, PteFlags::user_data());
    let a = space.alloc_space(anon(1), VirtualAddress::zero(), 1).unwrap();
    let b = space.alloc_space(anon(1), VirtualAddress::zero(), 1).unwrap();
    let c = space.alloc_space(anon(1), VirtualAddress::zero(), 1).unwrap();
    assert!(a.start() < b.start() && b.start() < c.start());
    let middle = b.start();
    space.free_space(&b).unwrap();
    let again = space.alloc_space(anon(1), middle, 1).unwrap();
    assert_eq!(again.start(), middle);

    // --- kernel KVA + MMIO windows ----------------------------------------
    let kv = address_space::alloc_kv_region(2, PteFlags::READ | PteFlags::WRITE).unwrap();
    let kspace = address_space::kernel_space();
    assert!(kspace.mul().get_mapping(kv.start()).is_some());
    kspace.free_space(&kv).unwrap();

    // --- hardware interrupt dispatch --------------------------------------
    let connected = interrupt::connect_interrupt(HwInterrupt {
        vector: 40,
        gsi: 4,
        mode: IntMode::Edge,
        ipl: cpu::Ipl::Timer,
        handler: hw_handler,
    })
    .unwrap();
    assert!(CONTROLLER_DEV.connected.load(Ordering::Acquire));

    let ctx = IntContext { vector: 40, ..Default::default() };
    assert!(interrupt::dispatch(&ctx));
    assert!(HW_FIRED.load(Ordering::Acquire));

    // Double-connecting the vector is refused.
    let dup = interrupt::connect_interrupt(HwInterrupt {
        vector: 40,
        gsi: 4,
        mode: IntMode::Edge,
        ipl: cpu::Ipl::Timer,
        handler: hw_handler,
    });
    assert!(dup.is_err());
    interrupt::disconnect_interrupt(&connected);

    // A stray hardware vector is reported unhandled.
    assert!(!interrupt::dispatch(&IntContext { vector: 41, ..Default::default() }));

    // --- the clock tick drives the timer list ------------------------------
    let fired = std::sync::Arc::new(AtomicBool::new(false));
    let observer = fired.clone();
    let event = time::TimerEvent::new();
    time::register(&event, 3, move || observer.store(true, Ordering::Release));
    CLOCK_DEV.ticks.fetch_add(5, Ordering::Release);
    time::on_timer_expiry();
    assert!(fired.load(Ordering::Acquire));

    // --- teardown frees what the scenario allocated ------------------------
    let before = frame_allocator::total_free();
    drop(region);
    drop(again);
    drop((a, c));
    drop(space);
    drop(object);
    let after = frame_allocator::total_free();
    assert!(after > before, "space teardown returned frames");
}
