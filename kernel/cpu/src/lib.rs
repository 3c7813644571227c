//! The per-CPU control block (CCB) and the interrupt priority level (IPL)
//! discipline built on it.
//!
//! IPL is a totally-ordered per-CPU level: `Low < Timer < High`. Raising
//! the level masks every interrupt whose priority is at or below it;
//! `High` masks even the timer tick, which is what makes it safe to mutate
//! the ready queue, wait queues, and the timer-event list. `raise_ipl`
//! hands back a guard value that restores the previous level when consumed
//! by [`lower_ipl`] (or dropped), so a forgotten lower shows up as a guard
//! living too long rather than a silently wedged CPU.
//!
//! Scheduler-owned per-CPU state (current thread, ready queue, timer list)
//! lives in the crates that own those structures; the CCB proper carries
//! identity, the IPL word, and the preemption counters that everything
//! else keys off.

#![no_std]

use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use log::error;
use spin::Once;

/// Interrupt priority level, ordered `Low < Timer < High`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Ipl {
    /// Normal thread execution; everything can interrupt.
    Low = 0,
    /// Timer tick and below are masked.
    Timer = 1,
    /// All maskable interrupts are masked.
    High = 2,
}

impl Ipl {
    fn from_u8(raw: u8) -> Ipl {
        match raw {
            0 => Ipl::Low,
            1 => Ipl::Timer,
            _ => Ipl::High,
        }
    }
}

/// The per-CPU control block.
///
/// On hardware this is reachable from assembly through a fixed CPU
/// register; the core only ever touches it through [`current_ccb`].
pub struct Ccb {
    pub id: u32,
    current_ipl: AtomicU8,
    preempt_disable: AtomicU32,
    preempt_requested: AtomicBool,
    ints_held: AtomicU32,
    int_requested: AtomicBool,
}

impl Ccb {
    const fn new(id: u32) -> Ccb {
        Ccb {
            id,
            current_ipl: AtomicU8::new(Ipl::Low as u8),
            preempt_disable: AtomicU32::new(0),
            preempt_requested: AtomicBool::new(false),
            ints_held: AtomicU32::new(0),
            int_requested: AtomicBool::new(false),
        }
    }

    pub fn current_ipl(&self) -> Ipl {
        Ipl::from_u8(self.current_ipl.load(Ordering::Relaxed))
    }

    pub fn preempt_disabled(&self) -> bool {
        self.preempt_disable.load(Ordering::Relaxed) > 0
    }

    pub fn preempt_requested(&self) -> bool {
        self.preempt_requested.load(Ordering::Relaxed)
    }

    pub fn set_preempt_requested(&self, requested: bool) {
        self.preempt_requested.store(requested, Ordering::Relaxed);
    }

    /// Records that a masked hardware interrupt arrived while interrupts
    /// were held; the release path replays it.
    pub fn set_int_requested(&self) {
        self.int_requested.store(true, Ordering::Relaxed);
    }

    pub fn ints_held(&self) -> bool {
        self.ints_held.load(Ordering::Relaxed) > 0
    }
}

/// The boot CPU's control block. Single-CPU semantics: there is exactly one.
static BOOT_CCB: Ccb = Ccb::new(0);

/// Returns the control block of the CPU this code is running on.
pub fn current_ccb() -> &'static Ccb {
    &BOOT_CCB
}

/// Hook invoked whenever the IPL actually changes, so the platform
/// interrupt controller can update its hardware priority mask.
static IPL_MASK_HOOK: Once<fn(Ipl)> = Once::new();

/// Hook invoked when preemption is re-enabled with a request pending.
/// Installed by the scheduler at init.
static PREEMPT_HOOK: Once<fn()> = Once::new();

pub fn set_ipl_mask_hook(hook: fn(Ipl)) {
    IPL_MASK_HOOK.call_once(|| hook);
}

pub fn set_preempt_hook(hook: fn()) {
    PREEMPT_HOOK.call_once(|| hook);
}

/// Proof that the current CPU's IPL was raised; restores the saved level
/// when dropped or passed to [`lower_ipl`].
///
/// Not `Send`: the level belongs to the CPU it was raised on.
#[must_use = "dropping an IplGuard immediately lowers the IPL again"]
pub struct IplGuard {
    old: Ipl,
    _not_send: PhantomData<*mut ()>,
}

/// Raises the current CPU's IPL to at least `new`, returning a guard
/// holding the previous level. Raising to a level at or below the current
/// one leaves the level unchanged (the guard still restores correctly).
pub fn raise_ipl(new: Ipl) -> IplGuard {
    let ccb = current_ccb();
    let old = ccb.current_ipl();
    if new > old {
        ccb.current_ipl.store(new as u8, Ordering::Relaxed);
        if let Some(hook) = IPL_MASK_HOOK.get() {
            hook(new);
        }
    }
    IplGuard { old, _not_send: PhantomData }
}

/// Lowers the IPL back to the level saved in `guard`.
pub fn lower_ipl(guard: IplGuard) {
    drop(guard);
}

impl IplGuard {
    /// The level that will be restored.
    pub fn saved(&self) -> Ipl {
        self.old
    }
}

impl Drop for IplGuard {
    fn drop(&mut self) {
        let ccb = current_ccb();
        let cur = ccb.current_ipl();
        if self.old > cur {
            // Guards must unwind in LIFO order; a raise cannot restore upward.
            error!("IPL guard dropped out of order: restoring {:?} over {:?}", self.old, cur);
        }
        ccb.current_ipl.store(self.old as u8, Ordering::Relaxed);
        if let Some(hook) = IPL_MASK_HOOK.get() {
            hook(self.old);
        }
        // Returning to Low settles any preemption deferred while raised,
        // the same way the interrupt-exit path does.
        if self.old == Ipl::Low && ccb.preempt_requested() && !ccb.preempt_disabled() {
            if let Some(hook) = PREEMPT_HOOK.get() {
                hook();
            }
        }
    }
}

/// Forces the IPL to a known level without a guard. Only for context
/// entry paths (a just-switched-in thread, the boot handoff) where the
/// guard that raised the level lives on some other stack.
#[doc(hidden)]
pub fn reset_ipl(new: Ipl) {
    let ccb = current_ccb();
    ccb.current_ipl.store(new as u8, Ordering::Relaxed);
    if let Some(hook) = IPL_MASK_HOOK.get() {
        hook(new);
    }
}

/// Disables preemption on this CPU while the returned guard lives.
/// Re-enabling with a pending request invokes the scheduler's preempt hook.
#[must_use = "dropping a PreemptGuard immediately re-enables preemption"]
pub struct PreemptGuard {
    _not_send: PhantomData<*mut ()>,
}

pub fn hold_preempt() -> PreemptGuard {
    current_ccb().preempt_disable.fetch_add(1, Ordering::Relaxed);
    PreemptGuard { _not_send: PhantomData }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        let ccb = current_ccb();
        let prev = ccb.preempt_disable.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "preempt disable count underflow");
        if prev == 1 && ccb.preempt_requested() {
            ccb.set_preempt_requested(false);
            if let Some(hook) = PREEMPT_HOOK.get() {
                hook();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    // The CCB is per-process state in tests, so everything runs in one test.
    #[test]
    fn ipl_raise_lower_nesting() {
        let ccb = current_ccb();
        assert_eq!(ccb.current_ipl(), Ipl::Low);

        let outer = raise_ipl(Ipl::Timer);
        assert_eq!(ccb.current_ipl(), Ipl::Timer);

        let inner = raise_ipl(Ipl::High);
        assert_eq!(ccb.current_ipl(), Ipl::High);

        // Raising to a lower level keeps the current one.
        let noop = raise_ipl(Ipl::Timer);
        assert_eq!(ccb.current_ipl(), Ipl::High);
        lower_ipl(noop);
        assert_eq!(ccb.current_ipl(), Ipl::High);

        lower_ipl(inner);
        assert_eq!(ccb.current_ipl(), Ipl::Timer);
        lower_ipl(outer);
        assert_eq!(ccb.current_ipl(), Ipl::Low);

        // Preemption counting.
        assert!(!ccb.preempt_disabled());
        {
            let _outer = hold_preempt();
            let _inner = hold_preempt();
            assert!(ccb.preempt_disabled());
        }
        assert!(!ccb.preempt_disabled());
    }
}
