//! The kernel panic path: dump diagnostics, then halt.
//!
//! The panic handler itself only exists in freestanding builds; host
//! builds (tests) use std's. The register-dump hook is installed by the
//! arch entry code so a panic from a trap can show the saved frame.

use crate::interrupt::IntContext;
use spin::Once;

/// Arch hook that prints CPU state (the `cpu_print_debug` duty).
static DEBUG_DUMP: Once<fn(Option<&IntContext>)> = Once::new();

/// The frame of the trap being serviced when the panic hit, if any.
static PANIC_FRAME: sync_irq::IplMutex<Option<IntContext>> = sync_irq::IplMutex::new(None);

pub fn install_debug_dump(dump: fn(Option<&IntContext>)) {
    DEBUG_DUMP.call_once(|| dump);
}

/// Records the in-flight trap frame so a panic during its service can
/// include it in the dump.
pub fn set_panic_frame(ctx: Option<IntContext>) {
    *PANIC_FRAME.lock() = ctx;
}

/// Emits the diagnostic dump: the register state (if a dump hook is
/// installed) and the tail of the kernel log.
pub fn dump_diagnostics() {
    if let Some(dump) = DEBUG_DUMP.get() {
        let frame = *PANIC_FRAME.lock();
        dump(frame.as_ref());
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "none", not(test)))] {
        /// The freestanding panic handler: log the reason, dump state,
        /// halt forever.
        #[panic_handler]
        fn panic(info: &core::panic::PanicInfo) -> ! {
            error!("kernel panic: {}", info);
            dump_diagnostics();
            loop {
                core::hint::spin_loop();
            }
        }
    }
}
