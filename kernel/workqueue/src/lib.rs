//! Work queues: each queue owns a dedicated scheduler thread that drains
//! a shared item list, then sleeps on a condition variable until the next
//! trigger.
//!
//! Demand queues signal the worker when a submit brings the pending count
//! to the threshold (every later submit signals too; a wakeup with work
//! already drained is harmless). Timed queues signal from a timer event,
//! one-shot or periodic. Either way the worker drains *everything*
//! pending per wakeup, not just the threshold's worth.

#![no_std]

extern crate alloc;
#[macro_use]
extern crate log;

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use sync_block::{Condvar, Mutex};
use sync_irq::IplMutex;
use task::ThreadRef;
use time::{EventRef, Ticks};

/// What triggers the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkQueueKind {
    /// Submissions reaching the threshold wake the worker.
    Demand,
    /// A timer event wakes the worker.
    Timed,
}

/// Behavior flags for a work queue.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkFlags {
    /// Timed queues only: the armed timer re-arms itself each expiry.
    pub periodic: bool,
}

/// An opaque unit of work handed to the queue's callback.
pub type WorkPayload = usize;

struct WorkInner {
    name: String,
    kind: WorkQueueKind,
    flags: WorkFlags,
    threshold: usize,
    callback: fn(WorkPayload),
    items: IplMutex<VecDeque<WorkPayload>>,
    mutex: Mutex,
    cond: Condvar,
    destroyed: AtomicBool,
    /// Wakeups delivered to the worker; drives tests and diagnostics.
    signals: AtomicUsize,
    timer_event: EventRef,
    /// Timer period while armed, for periodic re-arm.
    timer_delta: IplMutex<Option<Ticks>>,
}

/// A work queue handle. Cloned freely; [`destroy`](WorkQueue::destroy)
/// tears the worker down.
pub struct WorkQueue {
    inner: Arc<WorkInner>,
    worker: IplMutex<Option<ThreadRef>>,
}

impl WorkQueue {
    /// Creates the queue and spawns its worker thread. `threshold` only
    /// matters for Demand queues; Timed queues run off [`arm_timer`]
    /// (`WorkQueue::arm_timer`).
    pub fn new(
        name: &str,
        callback: fn(WorkPayload),
        kind: WorkQueueKind,
        flags: WorkFlags,
        threshold: usize,
    ) -> WorkQueue {
        let inner = Arc::new(WorkInner {
            name: String::from(name),
            kind,
            flags,
            threshold: threshold.max(1),
            callback,
            items: IplMutex::new(VecDeque::new()),
            mutex: Mutex::new(),
            cond: Condvar::new(),
            destroyed: AtomicBool::new(false),
            signals: AtomicUsize::new(0),
            timer_event: time::TimerEvent::new(),
            timer_delta: IplMutex::new(None),
        });
        let worker_inner = inner.clone();
        let worker = spawn::spawn(name, move || worker_loop(worker_inner));
        WorkQueue { inner, worker: IplMutex::new(Some(worker)) }
    }

    /// Queues one item. On a Demand queue, reaching the threshold wakes
    /// the worker.
    pub fn submit(&self, data: WorkPayload) {
        let pending = {
            let mut items = self.inner.items.lock();
            items.push_back(data);
            items.len()
        };
        if self.inner.kind == WorkQueueKind::Demand && pending >= self.inner.threshold {
            self.inner.signal();
        }
    }

    /// Withdraws the first pending item equal to `data`. Returns whether
    /// one was found; items already handed to the callback are gone.
    pub fn cancel(&self, data: WorkPayload) -> bool {
        let mut items = self.inner.items.lock();
        match items.iter().position(|&item| item == data) {
            Some(pos) => {
                items.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Arms the trigger timer of a Timed queue, `delta` ticks out. With
    /// the periodic flag, expiry re-arms itself at the same period.
    pub fn arm_timer(&self, delta: Ticks) {
        if self.inner.kind != WorkQueueKind::Timed {
            warn!("work queue '{}': arm_timer on a demand queue", self.inner.name);
            return;
        }
        *self.inner.timer_delta.lock() = Some(delta);
        let inner = self.inner.clone();
        time::register(&self.inner.timer_event, delta, move || {
            inner.signal();
            if inner.flags.periodic && !inner.destroyed.load(Ordering::Acquire) {
                let delta = inner.timer_delta.lock().unwrap_or(1);
                time::re_register(&inner.timer_event, delta);
            }
        });
    }

    /// Pending (not yet drained) item count.
    pub fn pending(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// Wakeups delivered to the worker so far.
    pub fn signal_count(&self) -> usize {
        self.inner.signals.load(Ordering::Relaxed)
    }

    /// Stops the worker: pending items are still drained, then the
    /// thread exits and is joined.
    pub fn destroy(self) {
        self.inner.destroyed.store(true, Ordering::Release);
        time::deregister(&self.inner.timer_event);
        self.inner.signal();
        if let Some(worker) = self.worker.lock().take() {
            let _ = spawn::join(worker.tid());
        }
    }
}

impl WorkInner {
    fn signal(&self) {
        self.signals.fetch_add(1, Ordering::Relaxed);
        self.cond.signal();
    }

    /// Takes every pending item at once.
    fn take_batch(&self) -> Vec<WorkPayload> {
        let mut items = self.items.lock();
        items.drain(..).collect()
    }
}

/// The dedicated worker: drain everything, then sleep until signalled.
fn worker_loop(inner: Arc<WorkInner>) {
    loop {
        let batch = inner.take_batch();
        for item in batch {
            (inner.callback)(item);
        }
        if inner.destroyed.load(Ordering::Acquire) {
            // One final drain so destroy never strands items.
            for item in inner.take_batch() {
                (inner.callback)(item);
            }
            break;
        }
        if inner.mutex.lock().is_err() {
            break;
        }
        let wait = if inner.items.lock().is_empty() {
            inner.cond.wait(&inner.mutex)
        } else {
            Ok(())
        };
        inner.mutex.unlock();
        if wait.is_err() {
            break;
        }
    }
    trace!("work queue '{}' worker exiting", inner.name);
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use core::sync::atomic::AtomicU64;
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec as StdVec;

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

    static CONSUMED: StdMutex<StdVec<WorkPayload>> = StdMutex::new(StdVec::new());
    fn consume(item: WorkPayload) {
        CONSUMED.lock().unwrap().push(item);
    }

    #[test]
    fn demand_threshold_signals_and_batch_drains_all() {
        time::init(&CLOCK_DEV, None);
        scheduler::init();

        let queue = WorkQueue::new("test-wq", consume, WorkQueueKind::Demand, WorkFlags::default(), 3);
        queue.submit(1);
        queue.submit(2);
        assert_eq!(queue.signal_count(), 0, "below threshold: no wakeup");
        queue.submit(3);
        assert_eq!(queue.signal_count(), 1, "threshold reached");
        queue.submit(4);
        queue.submit(5);

        // The worker drains everything pending in one batch, threshold
        // or not.
        let batch = queue.inner.take_batch();
        assert_eq!(batch, std::vec![1, 2, 3, 4, 5]);
        for item in batch {
            (queue.inner.callback)(item);
        }
        assert_eq!(*CONSUMED.lock().unwrap(), std::vec![1, 2, 3, 4, 5]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn cancel_withdraws_pending_items() {
        time::init(&CLOCK_DEV, None);
        scheduler::init();

        let queue =
            WorkQueue::new("cancel-wq", consume, WorkQueueKind::Demand, WorkFlags::default(), 100);
        queue.submit(10);
        queue.submit(11);
        assert!(queue.cancel(10));
        assert!(!queue.cancel(10), "already withdrawn");
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.inner.take_batch(), std::vec![11]);
    }

    #[test]
    fn timed_queue_signals_from_timer() {
        time::init(&CLOCK_DEV, None);
        scheduler::init();

        let queue = WorkQueue::new(
            "timed-wq",
            consume,
            WorkQueueKind::Timed,
            WorkFlags { periodic: true },
            1,
        );
        queue.submit(42);
        assert_eq!(queue.signal_count(), 0, "timed queues ignore the threshold");

        queue.arm_timer(4);
        CLOCK_DEV.ticks.fetch_add(5, Ordering::Release);
        time::on_timer_expiry();
        assert_eq!(queue.signal_count(), 1);

        // Periodic: the event re-armed itself.
        CLOCK_DEV.ticks.fetch_add(5, Ordering::Release);
        time::on_timer_expiry();
        assert_eq!(queue.signal_count(), 2);
    }
}
