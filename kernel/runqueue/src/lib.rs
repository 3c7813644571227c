//! The ready queue: one FIFO of runnable threads per CPU.
//!
//! The head is the next thread to run. Normal readying goes to the back;
//! a thread preempted with part of its quantum left goes to the front so
//! that brief preemption does not reorder work. Removing a thread that is
//! not on the queue is an explicit, tolerated no-op (`remove` returns
//! `false`); callers on the wake paths race benignly with expiry.

#![no_std]

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use sync_irq::IplMutex;
use task::ThreadRef;

/// A FIFO of runnable threads.
pub struct RunQueue {
    queue: IplMutex<VecDeque<ThreadRef>>,
}

impl RunQueue {
    pub const fn new() -> RunQueue {
        RunQueue { queue: IplMutex::new(VecDeque::new()) }
    }

    /// Appends a thread; it runs after everything already queued.
    pub fn push_back(&self, thread: ThreadRef) {
        self.queue.lock().push_back(thread);
    }

    /// Prepends a thread; it runs next.
    pub fn push_front(&self, thread: ThreadRef) {
        self.queue.lock().push_front(thread);
    }

    /// Takes the next thread to run.
    pub fn pop(&self) -> Option<ThreadRef> {
        self.queue.lock().pop_front()
    }

    /// Unlinks the given thread wherever it sits. Returns whether it was
    /// actually queued.
    pub fn remove(&self, thread: &ThreadRef) -> bool {
        let mut queue = self.queue.lock();
        match queue.iter().position(|t| Arc::ptr_eq(t, thread)) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// The queued tids in run order; diagnostics and tests.
    pub fn snapshot_tids(&self) -> Vec<u64> {
        self.queue.lock().iter().map(|t| t.tid()).collect()
    }
}

/// The boot CPU's ready queue.
static READY_QUEUE: RunQueue = RunQueue::new();

/// The ready queue of the CPU this code runs on.
pub fn ready_queue() -> &'static RunQueue {
    &READY_QUEUE
}
