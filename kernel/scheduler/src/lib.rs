//! The scheduler: round-robin over the per-CPU ready queue, with fixed
//! time slices and deferred preemption.
//!
//! Policy in one paragraph: `schedule` pops the head of the ready queue
//! (idle if empty, stay put if the current thread is the only runnable
//! one). A thread preempted with part of its slice left goes back to the
//! *front* of the queue with its remaining quantum intact; every other
//! readying goes to the back with a fresh quantum. The periodic
//! time-slice event burns one tick of the running thread per clock tick
//! and requests preemption when the slice hits zero. Preemption requested
//! while preemption is disabled (or while the IPL is elevated) is
//! deferred: the re-enable path and the interrupt-exit path both settle
//! it with [`preempt_if_requested`].

#![no_std]

extern crate alloc;
#[macro_use]
extern crate log;

use alloc::sync::Arc;
use cpu::Ipl;
use kernel_config::time::TSK_TIMESLICE_LEN;
use runqueue::ready_queue;
use spin::Once;
use sync_irq::IplMutex;
use task::{Thread, ThreadRef, ThreadState};
use time::EventRef;

/// The thread currently executing on this CPU. `None` until the boot
/// handoff in [`set_initial_thread`].
static CURRENT: IplMutex<Option<ThreadRef>> = IplMutex::new(None);

/// This CPU's idle thread.
static IDLE: Once<ThreadRef> = Once::new();

/// The periodic time-slice event.
static TIMESLICE_EVENT: Once<EventRef> = Once::new();

/// Prepares the scheduler: builds the idle thread and hooks the
/// preemption re-enable path. Does not start scheduling anything.
pub fn init() {
    IDLE.call_once(|| {
        let idle = Thread::new_idle(TSK_TIMESLICE_LEN);
        let sp = unsafe {
            context_switch::prepare_stack(idle.stack_top() as *mut u8, idle_entry as usize, 0)
        };
        idle.set_saved_sp(sp);
        idle
    });
    cpu::set_preempt_hook(preempt_if_requested);
}

/// The idle loop: runs whenever the ready queue is empty, and gives the
/// CPU back the moment anything becomes runnable.
extern "C" fn idle_entry() -> ! {
    // First entry arrives from a switch made at IPL High; the raising
    // guard lives on the stack we switched away from.
    cpu::reset_ipl(cpu::Ipl::Low);
    loop {
        if !ready_queue().is_empty() {
            schedule();
        }
        core::hint::spin_loop();
    }
}

/// The thread currently running on this CPU.
pub fn current_thread() -> Option<ThreadRef> {
    CURRENT.lock().clone()
}

/// Makes a thread runnable.
///
/// A preempted thread with quantum remaining returns to the front of the
/// queue and keeps its remaining slice; everything else goes to the back
/// with the quantum reset.
pub fn ready(thread: ThreadRef) {
    let front = thread.was_preempted() && thread.quanta_left() > 0;
    thread.set_preempted(false);
    thread.set_state(ThreadState::Ready);
    if front {
        ready_queue().push_front(thread);
    } else {
        thread.reset_quanta();
        ready_queue().push_back(thread);
    }
}

/// Starts a created thread: readies it and preempts if it is the only
/// runnable work.
pub fn start_thread(thread: ThreadRef) {
    unblock(thread);
}

/// Decides the next thread to run and publishes it as current, without
/// performing the stack switch. Returns `(previous, next)` when a switch
/// is actually needed.
///
/// The split from [`schedule`] exists so the policy is drivable without a
/// live context switch.
#[doc(hidden)]
pub fn pick_next() -> Option<(ThreadRef, ThreadRef)> {
    let mut current = CURRENT.lock();
    let prev = current.clone()?;

    // A still-running previous thread stays runnable: requeue it per the
    // readying policy before picking a successor.
    if prev.state() == ThreadState::Running && !prev.is_idle() {
        ready(prev.clone());
    }

    let next = match ready_queue().pop() {
        Some(next) => next,
        None => match IDLE.get() {
            Some(idle) => idle.clone(),
            None => {
                // Nothing runnable and no idle thread (early boot): the
                // previous thread keeps the CPU.
                error!("schedule with an empty queue and no idle thread");
                prev.set_state(ThreadState::Running);
                return None;
            }
        },
    };

    if Arc::ptr_eq(&next, &prev) {
        next.set_state(ThreadState::Running);
        return None;
    }
    next.set_state(ThreadState::Running);
    next.set_last_schedule_tick(time::try_now().unwrap_or(0));
    *current = Some(next.clone());
    Some((prev, next))
}

/// Switches to the next runnable thread (or idle). Returns in the
/// context of the calling thread whenever it is next scheduled.
pub fn schedule() {
    let ipl = cpu::raise_ipl(Ipl::High);
    if let Some((prev, next)) = pick_next() {
        let prev_sp = prev.saved_sp_slot();
        let next_sp = next.saved_sp();
        drop((prev, next));
        unsafe { context_switch::switch_context(prev_sp, next_sp) };
    }
    // Resumed (or no switch was needed): restore the caller's IPL.
    cpu::lower_ipl(ipl);
}

/// Marks the current thread preempted and reschedules, deferring if
/// preemption is disabled or the IPL is elevated.
pub fn preempt() {
    let ccb = cpu::current_ccb();
    if let Some(current) = current_thread() {
        current.set_preempted(true);
    }
    if ccb.preempt_disabled() || ccb.current_ipl() != Ipl::Low {
        ccb.set_preempt_requested(true);
    } else {
        schedule();
    }
}

/// Settles a deferred preemption request. Called when preemption is
/// re-enabled and on the interrupt-exit path.
pub fn preempt_if_requested() {
    let ccb = cpu::current_ccb();
    if ccb.preempt_requested() && !ccb.preempt_disabled() && ccb.current_ipl() == Ipl::Low {
        ccb.set_preempt_requested(false);
        schedule();
    }
}

/// Blocks the current thread: it leaves the CPU until something readies
/// it again.
pub fn block() {
    let Some(current) = current_thread() else {
        error!("block with no current thread");
        return;
    };
    current.set_state(ThreadState::Waiting);
    schedule();
}

/// Yields the rest of the current slice voluntarily.
pub fn yield_now() {
    if let Some(current) = current_thread() {
        current.set_preempted(false);
    }
    schedule();
}

/// Makes a blocked (or created) thread runnable again. If the queue was
/// empty it preempts the current thread, so a lone waker runs promptly.
pub fn unblock(thread: ThreadRef) {
    if thread.state() == ThreadState::Ready {
        // A wake racing a timeout already readied it; queueing twice
        // would put the thread on two lists.
        return;
    }
    let was_empty = ready_queue().is_empty();
    ready(thread);
    if was_empty {
        preempt();
    }
}

/// Adopts `thread` as the context already executing on this CPU, without
/// any stack switch. This is the other boot-time bootstrap shape: instead
/// of switching away from the entry context ([`set_initial_thread`]), the
/// entry context itself is wrapped in a thread so blocking primitives have
/// a current thread to account to.
pub fn adopt_current(thread: ThreadRef) {
    thread.set_state(ThreadState::Running);
    thread.set_last_schedule_tick(time::try_now().unwrap_or(0));
    *CURRENT.lock() = Some(thread);
}

/// Boot-time handoff: switches the CPU into its first real thread. The
/// boot context's registers go into a dead slot that nothing ever
/// resumes.
pub fn set_initial_thread(thread: ThreadRef) -> ! {
    thread.set_state(ThreadState::Running);
    thread.set_last_schedule_tick(time::try_now().unwrap_or(0));
    *CURRENT.lock() = Some(thread.clone());
    let mut dead_slot: usize = 0;
    let next_sp = thread.saved_sp();
    drop(thread);
    unsafe { context_switch::switch_context(&mut dead_slot as *mut usize, next_sp) };
    unreachable!("the boot context was resumed after handoff");
}

/// Arms the periodic time-slice event: every clock tick it burns one
/// quantum tick of the running thread and preempts at zero.
pub fn start_timeslice_timer() {
    let event = TIMESLICE_EVENT.call_once(time::TimerEvent::new).clone();
    let rearm = event.clone();
    time::register(&event, 1, move || {
        timeslice_tick();
        time::re_register(&rearm, 1);
    });
}

/// One tick of time-slice accounting.
fn timeslice_tick() {
    let Some(current) = current_thread() else { return };
    if current.is_idle() || current.state() != ThreadState::Running {
        return;
    }
    if current.consume_tick() == 0 {
        preempt();
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use alloc::boxed::Box;
    use alloc::string::String;

    fn thread(name: &str) -> ThreadRef {
        let t = Thread::new(String::from(name), 3, Box::new(|| {}));
        task::unregister_thread(t.tid());
        t
    }

    /// The global queue and current-thread slot make this one sequential
    /// scenario.
    #[test]
    fn round_robin_policy() {
        init();

        // Readying policy: back-inserts reset the quantum, front-inserts
        // (preempted with slice remaining) keep it.
        let a = thread("a");
        let b = thread("b");
        a.consume_tick();
        ready(a.clone());
        assert_eq!(a.quanta_left(), 3, "back-insert refills the slice");
        assert_eq!(a.state(), ThreadState::Ready);

        b.set_preempted(true);
        b.consume_tick();
        ready(b.clone());
        assert_eq!(b.quanta_left(), 2, "front-insert keeps the slice");
        assert_eq!(ready_queue().snapshot_tids(), std::vec![b.tid(), a.tid()]);

        // Drain for the next phase.
        ready_queue().pop().unwrap();
        ready_queue().pop().unwrap();

        // Round-robin alternation: T1 and T2, equal quanta, each slice
        // expiry requeues the runner at the back.
        let t1 = thread("t1");
        let t2 = thread("t2");
        t1.set_state(ThreadState::Running);
        *CURRENT.lock() = Some(t1.clone());
        ready(t2.clone());

        let mut order = std::vec::Vec::new();
        for _ in 0..10 {
            // Burn the whole slice of whoever is running.
            let running = current_thread().unwrap();
            while running.consume_tick() > 0 {}
            let (prev, next) = pick_next().expect("two runnable threads must alternate");
            assert_eq!(prev.state(), ThreadState::Ready);
            assert_eq!(next.state(), ThreadState::Running);
            order.push(next.tid());
        }
        let expect: std::vec::Vec<u64> =
            (0..10).map(|i| if i % 2 == 0 { t2.tid() } else { t1.tid() }).collect();
        assert_eq!(order, expect, "FCFS alternation after slice expiry");

        // A preempted thread with slice remaining runs before anything
        // added behind it: it front-inserts and wins the very next pick.
        let runner = current_thread().unwrap();
        let other = if Arc::ptr_eq(&runner, &t1) { t2.clone() } else { t1.clone() };
        runner.set_preempted(true);
        runner.reset_quanta();
        runner.consume_tick(); // one tick burned, slice not exhausted
        let latecomer = thread("late");
        ready(latecomer.clone());
        assert!(
            pick_next().is_none(),
            "the preempted runner front-inserts and immediately wins the pick"
        );
        assert!(Arc::ptr_eq(&current_thread().unwrap(), &runner));
        assert_eq!(runner.state(), ThreadState::Running);
        assert_eq!(
            ready_queue().snapshot_tids(),
            std::vec![other.tid(), latecomer.tid()],
            "the latecomer stays behind work queued before the preemption"
        );

        // Blocked threads never requeue themselves; unblock on an empty
        // queue requests preemption.
        while ready_queue().pop().is_some() {}
        let ccb = cpu::current_ccb();
        let waiter = thread("waiter");
        waiter.set_state(ThreadState::Waiting);
        let _hold = cpu::hold_preempt();
        unblock(waiter.clone());
        assert_eq!(waiter.state(), ThreadState::Ready);
        assert!(ccb.preempt_requested(), "unblock into an empty queue preempts");
        ccb.set_preempt_requested(false);
        while ready_queue().pop().is_some() {}

        // The time-slice tick never burns the idle thread's quantum.
        let idle = IDLE.get().unwrap().clone();
        let before = idle.quanta_left();
        *CURRENT.lock() = Some(idle.clone());
        timeslice_tick();
        assert_eq!(idle.quanta_left(), before, "idle burns no quantum");

        *CURRENT.lock() = None;
        timeslice_tick(); // and no current thread is a no-op
    }
}
