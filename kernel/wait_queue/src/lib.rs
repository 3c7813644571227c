//! Wait queues: the single primitive under every blocking operation.
//!
//! The canonical shape is assert-then-block: [`WaitQueue::assert_wait`]
//! raises the IPL, marks the caller `Waiting`, and arms the optional
//! timeout, then returns with the IPL still raised so the caller can
//! re-check its predicate race-free. If the predicate turned true in the
//! meantime the caller *deasserts*; otherwise it commits with
//! [`WaitAssert::block`], which enqueues, lowers the IPL, and leaves the
//! CPU. The wake cause comes back as the wait's return value: `Ok` for a
//! signal, `Timeout` when the armed deadline readied the thread first,
//! `Closed` when the queue was torn down underneath the waiter.
//!
//! Queues hold non-owning (refcount-cloned) thread handles; membership
//! never determines a thread's lifetime, and entries are cleared at wake
//! or close. A waiter readied by its timeout may linger in the list until
//! it removes itself; wake paths skip such entries rather than burn a
//! wake on them.

#![no_std]

extern crate alloc;
#[macro_use]
extern crate log;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use cpu::{Ipl, IplGuard};
use sync_irq::IplMutex;
use task::{ThreadRef, ThreadState};
use time::Ticks;

/// Why a wait (or wake) did not succeed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitError {
    /// The timeout fired before any signal.
    Timeout,
    /// The queue was closed while (or before) waiting.
    Closed,
    /// A non-blocking attempt would have had to block.
    WouldBlock,
    /// A wake found no waiter.
    Empty,
}

struct WaitQueueInner {
    waiters: VecDeque<ThreadRef>,
    closed: bool,
}

/// A list of threads blocked on a shared condition.
pub struct WaitQueue {
    inner: IplMutex<WaitQueueInner>,
}

/// An asserted-but-not-committed wait. Holds the raised IPL; consuming it
/// either commits the block or deasserts.
#[must_use = "an asserted wait must be committed with block() or undone with deassert()"]
pub struct WaitAssert<'q> {
    queue: &'q WaitQueue,
    thread: ThreadRef,
    ipl: Option<IplGuard>,
}

impl WaitQueue {
    pub const fn new() -> WaitQueue {
        WaitQueue { inner: IplMutex::new(WaitQueueInner { waiters: VecDeque::new(), closed: false }) }
    }

    /// First half of a blocking wait: raises the IPL, marks the current
    /// thread `Waiting`, and arms the timeout (in ticks) if given.
    /// Returns with the IPL raised for the caller's predicate re-check.
    pub fn assert_wait(&self, timeout: Option<Ticks>) -> Result<WaitAssert<'_>, WaitError> {
        let thread = scheduler::current_thread().ok_or(WaitError::WouldBlock)?;
        let ipl = cpu::raise_ipl(Ipl::High);
        if self.inner.lock().closed {
            return Err(WaitError::Closed);
        }
        thread.set_state(ThreadState::Waiting);
        thread.set_wait_asserted(true);
        if let Some(ticks) = timeout {
            let event = time::TimerEvent::new();
            let waker = thread.clone();
            thread.set_timeout_event(event.clone());
            time::register(&event, ticks, move || {
                waker.mark_timed_out();
                scheduler::unblock(waker.clone());
            });
        }
        Ok(WaitAssert { queue: self, thread, ipl: Some(ipl) })
    }

    /// Blocks on the queue until woken. Returns the wake cause.
    pub fn wait(&self) -> Result<(), WaitError> {
        self.assert_wait(None)?.block()
    }

    /// Blocks with a timeout in ticks.
    pub fn wait_timeout(&self, ticks: Ticks) -> Result<(), WaitError> {
        self.assert_wait(Some(ticks))?.block()
    }

    /// Wakes the first live waiter. `Err(Empty)` if nobody is waiting.
    pub fn wake_one(&self) -> Result<(), WaitError> {
        let mut inner = self.inner.lock();
        while let Some(thread) = inner.waiters.pop_front() {
            // A waiter whose timeout already fired is awake on its own
            // power; don't burn the wake on it.
            if thread.timed_out() {
                continue;
            }
            cancel_timeout(&thread);
            scheduler::unblock(thread);
            return Ok(());
        }
        Err(WaitError::Empty)
    }

    /// Wakes every waiter present.
    pub fn wake_all(&self) {
        let mut inner = self.inner.lock();
        while let Some(thread) = inner.waiters.pop_front() {
            if thread.timed_out() {
                continue;
            }
            cancel_timeout(&thread);
            scheduler::unblock(thread);
        }
    }

    /// Closes the queue: every current waiter wakes with `Closed`, and
    /// every later wait is refused with `Closed` until [`reopen`].
    ///
    /// [`reopen`]: WaitQueue::reopen
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        while let Some(thread) = inner.waiters.pop_front() {
            if thread.timed_out() {
                continue;
            }
            cancel_timeout(&thread);
            thread.mark_wait_closed();
            scheduler::unblock(thread);
        }
    }

    /// Accepts waiters again after a [`close`](WaitQueue::close). The
    /// condition-variable broadcast uses close-then-reopen to guarantee
    /// no stale waiter survives.
    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Count of enqueued waiters (including ones awoken by timeout that
    /// have not yet removed themselves).
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Directly enqueues a thread already marked `Waiting`. The internal
    /// second half of `block`, also used by the tests to stage waiters.
    #[doc(hidden)]
    pub fn enqueue_waiter(&self, thread: ThreadRef) {
        self.inner.lock().waiters.push_back(thread);
    }

    fn remove_waiter(&self, thread: &ThreadRef) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.waiters.iter().position(|t| Arc::ptr_eq(t, thread)) {
            inner.waiters.remove(pos);
        }
    }
}

impl Default for WaitQueue {
    fn default() -> WaitQueue {
        WaitQueue::new()
    }
}

impl<'q> WaitAssert<'q> {
    /// The asserted thread.
    pub fn thread(&self) -> &ThreadRef {
        &self.thread
    }

    /// Undoes the assert: the predicate turned true before the block was
    /// committed. Cancels the timeout and restores the thread to Running.
    pub fn deassert(mut self) {
        cancel_timeout(&self.thread);
        self.thread.take_timed_out();
        self.thread.set_wait_asserted(false);
        self.thread.set_state(ThreadState::Running);
        if let Some(ipl) = self.ipl.take() {
            cpu::lower_ipl(ipl);
        }
    }

    /// Commits the wait: enqueues and blocks until a wake, timeout, or
    /// close. The raised IPL is held until the thread is actually off the
    /// CPU; lowering first would open a window where a wake (from the
    /// timer path) lands before the block and is then overwritten by it.
    pub fn block(mut self) -> Result<(), WaitError> {
        let thread = self.thread.clone();
        self.queue.enqueue_waiter(thread.clone());
        thread.set_wait_asserted(false);
        scheduler::block();
        if let Some(ipl) = self.ipl.take() {
            cpu::lower_ipl(ipl);
        }

        // Awake again; settle the cause.
        if thread.take_wait_closed() {
            cancel_timeout(&thread);
            return Err(WaitError::Closed);
        }
        if thread.take_timed_out() {
            // The timer readied us; the queue may still list us.
            self.queue.remove_waiter(&thread);
            thread.take_timeout_event();
            return Err(WaitError::Timeout);
        }
        cancel_timeout(&thread);
        // A normal wake already popped us, so this is usually a no-op; a
        // spurious return must never leave a stale entry behind.
        self.queue.remove_waiter(&thread);
        Ok(())
    }
}

impl<'q> Drop for WaitAssert<'q> {
    fn drop(&mut self) {
        if let Some(ipl) = self.ipl.take() {
            // Dropped without block() or deassert(): treat as a deassert
            // so the thread is not left marked Waiting.
            warn!("wait assert dropped without commit; deasserting");
            cancel_timeout(&self.thread);
            self.thread.set_wait_asserted(false);
            self.thread.set_state(ThreadState::Running);
            cpu::lower_ipl(ipl);
        }
    }
}

/// Disarms and detaches a thread's pending wait timeout, if any.
fn cancel_timeout(thread: &ThreadRef) {
    if let Some(event) = thread.take_timeout_event() {
        time::deregister(&event);
    }
}

/// Puts the current thread to sleep for at least `ticks` clock ticks.
/// Built on a private queue nothing ever signals, so the timeout is the
/// only way out.
pub fn sleep_ticks(ticks: Ticks) {
    let queue = WaitQueue::new();
    match queue.wait_timeout(ticks) {
        Err(WaitError::Timeout) => {}
        Err(WaitError::WouldBlock) => warn!("sleep_ticks outside a thread context"),
        other => warn!("sleep woke for an unexpected reason: {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use alloc::boxed::Box;
    use alloc::string::String;
    use core::sync::atomic::{AtomicU64, Ordering};

    struct TestClock {
        ticks: AtomicU64,
    }
    impl time::ClockSource for TestClock {
        fn name(&self) -> &'static str {
            "test-clock"
        }
        fn now(&self) -> Ticks {
            self.ticks.load(Ordering::Acquire)
        }
        fn precision_ns(&self) -> u64 {
            1_000_000
        }
    }
    static CLOCK_DEV: TestClock = TestClock { ticks: AtomicU64::new(0) };

    fn waiting_thread(name: &str) -> ThreadRef {
        let t = task::Thread::new(String::from(name), 10, Box::new(|| {}));
        task::unregister_thread(t.tid());
        t.set_state(ThreadState::Waiting);
        t
    }

    fn drain_ready_queue() {
        while runqueue::ready_queue().pop().is_some() {}
    }

    /// Sequential scenario: the ready queue and clock are process-global.
    #[test]
    fn wake_close_and_timeout_machinery() {
        time::init(&CLOCK_DEV, None);
        scheduler::init();
        drain_ready_queue();

        // FIFO wake order, one thread per wake, Empty when drained.
        let queue = WaitQueue::new();
        let a = waiting_thread("a");
        let b = waiting_thread("b");
        queue.enqueue_waiter(a.clone());
        queue.enqueue_waiter(b.clone());
        assert_eq!(queue.waiter_count(), 2);

        queue.wake_one().unwrap();
        assert_eq!(a.state(), ThreadState::Ready);
        assert_eq!(b.state(), ThreadState::Waiting);
        queue.wake_one().unwrap();
        assert_eq!(b.state(), ThreadState::Ready);
        assert_eq!(queue.wake_one(), Err(WaitError::Empty));
        drain_ready_queue();

        // Broadcast wakes everyone present.
        let c = waiting_thread("c");
        let d = waiting_thread("d");
        queue.enqueue_waiter(c.clone());
        queue.enqueue_waiter(d.clone());
        queue.wake_all();
        assert_eq!(c.state(), ThreadState::Ready);
        assert_eq!(d.state(), ThreadState::Ready);
        assert_eq!(queue.waiter_count(), 0);
        drain_ready_queue();

        // Close wakes with the closed cause and rejects future waits.
        let e = waiting_thread("e");
        queue.enqueue_waiter(e.clone());
        queue.close();
        assert_eq!(e.state(), ThreadState::Ready);
        assert!(e.take_wait_closed());
        assert!(queue.is_closed());
        queue.reopen();
        assert!(!queue.is_closed());
        drain_ready_queue();

        // A timeout readies the waiter and marks the cause; a later wake
        // skips the stale entry instead of consuming the wake.
        let f = waiting_thread("f");
        let g = waiting_thread("g");
        queue.enqueue_waiter(f.clone());
        queue.enqueue_waiter(g.clone());
        let event = time::TimerEvent::new();
        let waker = f.clone();
        f.set_timeout_event(event.clone());
        time::register(&event, 5, move || {
            waker.mark_timed_out();
            scheduler::unblock(waker.clone());
        });
        CLOCK_DEV.ticks.fetch_add(6, Ordering::Release);
        time::on_timer_expiry();
        assert_eq!(f.state(), ThreadState::Ready);
        assert!(f.timed_out());

        // f is still listed but expired; the wake goes to g.
        queue.wake_one().unwrap();
        assert_eq!(g.state(), ThreadState::Ready);
        assert_eq!(queue.wake_one(), Err(WaitError::Empty));
        assert!(f.take_timed_out());
        drain_ready_queue();
    }
}
