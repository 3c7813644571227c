//! The trap/interrupt dispatch contract.
//!
//! The architecture's entry stubs save an [`IntContext`] and call
//! [`dispatch`]. Exceptions route to their fixed handlers (the page
//! fault into the VM system); hardware interrupts route through the
//! platform's [`IntController`] to whatever was connected with
//! [`connect_interrupt`], running at the interrupt's IPL. The exit path
//! settles any preemption the handler requested.

use alloc::sync::Arc;
use alloc::vec::Vec;
use cpu::Ipl;
use memory_structs::VirtualAddress;
use page_fault_handler::FaultKind;
use spin::Once;
use sync_irq::IplMutex;

/// The saved register frame a trap delivers. The arch stub fills it; the
/// core treats everything but `vector` and `error_code` as opaque
/// diagnostics.
#[derive(Clone, Copy, Debug, Default)]
pub struct IntContext {
    pub vector: u32,
    pub error_code: u64,
    /// Faulting/interrupted instruction pointer.
    pub ip: usize,
    pub sp: usize,
    pub flags: usize,
    /// The faulting address for memory exceptions.
    pub fault_addr: usize,
    /// General-purpose registers, in the arch stub's save order.
    pub regs: [usize; 16],
}

/// Trigger mode of a hardware interrupt line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntMode {
    Edge,
    Level,
}

/// A connected hardware interrupt.
pub struct HwInterrupt {
    pub vector: u32,
    /// Global system interrupt number (controller line).
    pub gsi: u32,
    pub mode: IntMode,
    /// The IPL the handler runs at; it may not take locks owned by
    /// lower-IPL code.
    pub ipl: Ipl,
    pub handler: fn(&HwInterrupt, &IntContext),
}

/// The platform interrupt controller abstraction.
pub trait IntController: Send + Sync {
    fn name(&self) -> &'static str;
    /// Acknowledges an interrupt's arrival; returns the vector to
    /// dispatch, if the controller virtualizes them.
    fn begin(&self, ctx: &IntContext) -> u32;
    /// Signals completion (EOI).
    fn end(&self, vector: u32);
    fn enable(&self, gsi: u32);
    fn disable(&self, gsi: u32);
    /// Masks every line whose priority maps below the given IPL.
    fn set_ipl(&self, ipl: Ipl);
    fn connect(&self, interrupt: &HwInterrupt) -> Result<(), &'static str>;
    fn disconnect(&self, interrupt: &HwInterrupt);
}

/// The page-fault exception vector, per the boot stub's table layout.
pub const PAGE_FAULT_VECTOR: u32 = 14;
/// First vector available to hardware interrupts.
pub const FIRST_HW_VECTOR: u32 = 32;
/// Total dispatchable vectors.
pub const NUM_VECTORS: usize = 256;

static CONTROLLER: Once<&'static dyn IntController> = Once::new();

/// Connected hardware interrupts, by vector.
static HW_INTERRUPTS: IplMutex<Vec<Option<Arc<HwInterrupt>>>> = IplMutex::new(Vec::new());

/// Installs the platform controller and wires the IPL mask hook so that
/// raising the IPL masks lower-priority lines in hardware.
pub fn init(controller: &'static dyn IntController) {
    CONTROLLER.call_once(|| controller);
    HW_INTERRUPTS.lock().resize_with(NUM_VECTORS, || None);
    cpu::set_ipl_mask_hook(ipl_mask_hook);
    info!("interrupt: controller '{}'", controller.name());
}

fn ipl_mask_hook(ipl: Ipl) {
    if let Some(controller) = CONTROLLER.get() {
        controller.set_ipl(ipl);
    }
}

fn controller() -> &'static dyn IntController {
    *CONTROLLER.get().expect("interrupt dispatch before init")
}

/// Connects a hardware interrupt: claims its vector, programs the
/// controller, and unmasks the line.
pub fn connect_interrupt(interrupt: HwInterrupt) -> Result<Arc<HwInterrupt>, &'static str> {
    let interrupt = Arc::new(interrupt);
    {
        let mut table = HW_INTERRUPTS.lock();
        let slot = table
            .get_mut(interrupt.vector as usize)
            .ok_or("interrupt vector out of range")?;
        if slot.is_some() {
            error!("interrupt: vector {:#X} already connected", interrupt.vector);
            return Err("interrupt vector already in use");
        }
        *slot = Some(interrupt.clone());
    }
    controller().connect(&interrupt)?;
    controller().enable(interrupt.gsi);
    Ok(interrupt)
}

/// Disconnects a previously-connected interrupt and masks its line.
pub fn disconnect_interrupt(interrupt: &Arc<HwInterrupt>) {
    controller().disable(interrupt.gsi);
    controller().disconnect(interrupt);
    let mut table = HW_INTERRUPTS.lock();
    if let Some(slot) = table.get_mut(interrupt.vector as usize) {
        *slot = None;
    }
}

/// The common dispatch entry, called from every arch trap stub with the
/// saved frame. Returns whether the event was handled; an unhandled
/// exception panics in the caller with the frame's diagnostics.
pub fn dispatch(ctx: &IntContext) -> bool {
    if ctx.vector == PAGE_FAULT_VECTOR {
        return dispatch_page_fault(ctx);
    }
    if ctx.vector < FIRST_HW_VECTOR {
        // Some other CPU exception; nothing in the core handles those.
        return false;
    }

    let vector = controller().begin(ctx);
    let interrupt = HW_INTERRUPTS.lock().get(vector as usize).cloned().flatten();
    let handled = match interrupt {
        Some(interrupt) => {
            // The handler runs at the interrupt's own IPL; it must not
            // take locks owned by lower-IPL code.
            let ipl = cpu::raise_ipl(interrupt.ipl);
            (interrupt.handler)(&interrupt, ctx);
            cpu::lower_ipl(ipl);
            true
        }
        None => {
            warn!("interrupt: stray vector {:#X}", vector);
            false
        }
    };
    controller().end(vector);

    // Interrupt exit: settle a preemption requested while we were
    // elevated (the time-slice tick does exactly this).
    scheduler::preempt_if_requested();
    handled
}

/// Decodes the page-fault frame and walks the VM service path.
fn dispatch_page_fault(ctx: &IntContext) -> bool {
    let vaddr = VirtualAddress::new_canonical(ctx.fault_addr);
    let mut kind = FaultKind::empty();
    // Error-code layout per the boot stub: present, write, user, ifetch.
    if ctx.error_code & 0x1 != 0 {
        kind |= FaultKind::PRESENT;
    }
    if ctx.error_code & 0x2 != 0 {
        kind |= FaultKind::WRITE;
    }
    if ctx.error_code & 0x4 != 0 {
        kind |= FaultKind::USER;
    }
    if ctx.error_code & 0x10 != 0 {
        kind |= FaultKind::EXEC;
    }

    match page_fault_handler::handle_page_fault(vaddr, kind) {
        Ok(()) => true,
        Err(err) => {
            error!(
                "page fault at {} (ip {:#X}, {:?}): {:?}",
                vaddr, ctx.ip, kind, err
            );
            false
        }
    }
}
