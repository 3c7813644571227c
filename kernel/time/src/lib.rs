//! Time: the clock and timer device abstractions, and the per-CPU list of
//! timer events sorted by deadline.
//!
//! The *clock* answers "what time is it" in ticks; the *timer* is the
//! device that interrupts at (or before) a deadline. Both are chosen by
//! platform init and reached only through these traits. A software/
//! tickless timer means the periodic tick itself drives expiry and the
//! device is never armed.
//!
//! Timer events hang in one list per CPU, sorted ascending by deadline;
//! ties drain in registration order. Every list mutation happens at IPL
//! High (through the list's lock), which excludes the expiry handler.

#![no_std]

extern crate alloc;
#[macro_use]
extern crate log;

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Once;
use sync_irq::IplMutex;


/// Time expressed in clock ticks.
pub type Ticks = u64;

/// A monotonic tick counter.
pub trait ClockSource: Send + Sync {
    fn name(&self) -> &'static str;
    /// The current time in ticks.
    fn now(&self) -> Ticks;
    /// Nanoseconds per tick.
    fn precision_ns(&self) -> u64;
}

/// How the timer device fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// Hardware one-shot: re-armed for each head deadline.
    OneShot,
    /// Hardware periodic: fires at a fixed rate, never re-armed.
    Periodic,
    /// No hardware deadline at all; expiry rides the periodic tick.
    Software,
}

/// The deadline interrupt source.
pub trait TimerDevice: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> TimerKind;
    fn precision_ns(&self) -> u64;
    /// Requests an interrupt `delta` ticks from now. Only meaningful for
    /// one-shot hardware.
    fn arm(&self, delta: Ticks);
}

static CLOCK: Once<&'static dyn ClockSource> = Once::new();
static TIMER: Once<&'static dyn TimerDevice> = Once::new();

/// Installs the platform's clock and timer. The timer is optional: a
/// tickless platform registers none and calls [`on_timer_expiry`] from
/// its periodic interrupt.
pub fn init(clock: &'static dyn ClockSource, timer: Option<&'static dyn TimerDevice>) {
    CLOCK.call_once(|| clock);
    if let Some(timer) = timer {
        TIMER.call_once(|| timer);
    }
    info!(
        "time: clock '{}' ({} ns/tick), timer {}",
        clock.name(),
        clock.precision_ns(),
        timer.map(|t| t.name()).unwrap_or("none")
    );
}

fn clock() -> &'static dyn ClockSource {
    *CLOCK.get().expect("time::init has not run")
}

/// The current time in ticks.
pub fn now() -> Ticks {
    clock().now()
}

/// The current time in ticks, or `None` before [`init`]. Early-boot
/// callers (the scheduler handoff) use this.
pub fn try_now() -> Option<Ticks> {
    CLOCK.get().map(|clock| clock.now())
}

/// Converts a nanosecond interval to ticks, resolved to the coarser of
/// the clock's and timer's precision, and never to zero.
pub fn ns_to_ticks(ns: u64) -> Ticks {
    let clock_p = clock().precision_ns().max(1);
    let timer_p = TIMER.get().map(|t| t.precision_ns()).unwrap_or(0);
    let granule = clock_p.max(timer_p);
    let rounded = ns.div_ceil(granule).max(1) * granule;
    (rounded / clock_p).max(1)
}

/// One deadline with a callback. Created once, registered and
/// deregistered many times; freed by dropping the last reference.
pub struct TimerEvent {
    inner: IplMutex<EventInner>,
    /// Set (before the callback runs) when the event fires. Outside the
    /// lock so waiters can poll it without contending with the list.
    expired: AtomicBool,
}

struct EventInner {
    deadline: Ticks,
    callback: Option<Arc<dyn Fn() + Send + Sync>>,
    registered: bool,
}

/// Shared handle to a timer event.
pub type EventRef = Arc<TimerEvent>;

impl TimerEvent {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> EventRef {
        Arc::new(TimerEvent {
            inner: IplMutex::new(EventInner { deadline: 0, callback: None, registered: false }),
            expired: AtomicBool::new(false),
        })
    }

    /// Whether the event has fired since its last registration.
    pub fn expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    pub fn deadline(&self) -> Ticks {
        self.inner.lock().deadline
    }

    pub fn is_registered(&self) -> bool {
        self.inner.lock().registered
    }
}

/// The per-CPU event list: ascending by deadline, stable for ties.
static TIME_EVENTS: IplMutex<Vec<EventRef>> = IplMutex::new(Vec::new());

/// Registers `event` to fire `delta` ticks from now (a zero delta is
/// bumped to one tick), with `callback` invoked at expiry. If the event
/// becomes the new head and the timer is a hardware one-shot, the device
/// is re-armed.
pub fn register(event: &EventRef, delta: Ticks, callback: impl Fn() + Send + Sync + 'static) {
    event.inner.lock().callback = Some(Arc::new(callback));
    re_register(event, delta);
}

/// Re-arms `event` with its existing callback. This is how periodic
/// consumers (the time-slice tick, timed work queues) rearm themselves
/// from inside their own expiry callback.
pub fn re_register(event: &EventRef, delta: Ticks) {
    let deadline = now() + delta.max(1);
    {
        let mut inner = event.inner.lock();
        if inner.registered {
            warn!("time: registration of a still-registered event, deregistering first");
            drop(inner);
            deregister(event);
            inner = event.inner.lock();
        }
        debug_assert!(inner.callback.is_some(), "timer event armed without a callback");
        inner.deadline = deadline;
        inner.registered = true;
    }
    event.expired.store(false, Ordering::Release);

    let mut events = TIME_EVENTS.lock();
    // Insert after every event with an earlier-or-equal deadline: ties
    // drain in registration order.
    let pos = events.partition_point(|e| e.deadline() <= deadline);
    events.insert(pos, event.clone());
    if pos == 0 {
        arm_for_head(&events);
    }
}

/// Unlinks `event` from the list. If it was the head, the timer is
/// re-armed for the new head.
pub fn deregister(event: &EventRef) {
    let mut events = TIME_EVENTS.lock();
    let pos = match events.iter().position(|e| Arc::ptr_eq(e, event)) {
        Some(pos) => pos,
        None => return,
    };
    events.remove(pos);
    event.inner.lock().registered = false;
    if pos == 0 {
        arm_for_head(&events);
    }
}

fn arm_for_head(events: &[EventRef]) {
    let Some(timer) = TIMER.get() else { return };
    if timer.kind() != TimerKind::OneShot {
        return;
    }
    if let Some(head) = events.first() {
        let delta = head.deadline().saturating_sub(now()).max(1);
        timer.arm(delta);
    }
}

/// The timer interrupt's expiry handler: drains every event whose
/// deadline has passed, in deadline order, marking each expired before
/// its callback runs. With a one-shot device, multiple events sharing a
/// deadline drain in one call.
pub fn on_timer_expiry() {
    let current = now();
    loop {
        let event = {
            let mut events = TIME_EVENTS.lock();
            match events.first() {
                Some(head) if head.deadline() <= current => events.remove(0),
                _ => {
                    arm_for_head(&events);
                    break;
                }
            }
        };
        let callback = {
            let mut inner = event.inner.lock();
            inner.registered = false;
            event.expired.store(true, Ordering::Release);
            inner.callback.clone()
        };
        // Run the callback outside every lock: it may re-register this
        // event or others.
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Count of pending events; diagnostics only.
pub fn pending_events() -> usize {
    TIME_EVENTS.lock().len()
}
