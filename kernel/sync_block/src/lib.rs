//! Blocking synchronization primitives, all expressed over the wait
//! queue: counted semaphores, sleeping mutexes, and condition variables.
//!
//! Every acquire follows the assert-then-check pattern: assert the wait
//! (IPL raised), re-check the predicate race-free, then either deassert
//! (the predicate held) or commit the block. That window is what makes
//! the lost-wakeup impossible: a release cannot slip between the check
//! and the enqueue.

#![no_std]

#[macro_use]
extern crate log;

use sync_irq::IplMutex;
use time::Ticks;
use wait_queue::{WaitError, WaitQueue};

/// A counted semaphore.
pub struct Semaphore {
    count: IplMutex<i64>,
    queue: WaitQueue,
}

impl Semaphore {
    pub const fn new(count: i64) -> Semaphore {
        Semaphore { count: IplMutex::new(count), queue: WaitQueue::new() }
    }

    /// Takes one unit, blocking while the count is exhausted.
    pub fn acquire(&self) -> Result<(), WaitError> {
        self.acquire_inner(None)
    }

    /// Takes one unit, giving up after `ticks` with `Timeout`.
    pub fn acquire_timeout(&self, ticks: Ticks) -> Result<(), WaitError> {
        self.acquire_inner(Some(ticks))
    }

    fn acquire_inner(&self, timeout: Option<Ticks>) -> Result<(), WaitError> {
        loop {
            let assert = self.queue.assert_wait(timeout)?;
            {
                let mut count = self.count.lock();
                if *count > 0 {
                    *count -= 1;
                    assert.deassert();
                    return Ok(());
                }
            }
            assert.block()?;
        }
    }

    /// Takes one unit only if that needs no blocking.
    pub fn try_acquire(&self) -> Result<(), WaitError> {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            Ok(())
        } else {
            Err(WaitError::WouldBlock)
        }
    }

    /// Returns one unit, waking a waiter if the count became available.
    pub fn release(&self) {
        let mut count = self.count.lock();
        *count += 1;
        if *count > 0 {
            let _ = self.queue.wake_one();
        }
    }

    pub fn count(&self) -> i64 {
        *self.count.lock()
    }
}

/// A sleeping mutual-exclusion lock.
///
/// Deliberately ownerless: no recursion, no priority inheritance. The
/// caller is trusted to pair lock and unlock.
pub struct Mutex {
    locked: IplMutex<bool>,
    queue: WaitQueue,
}

impl Mutex {
    pub const fn new() -> Mutex {
        Mutex { locked: IplMutex::new(false), queue: WaitQueue::new() }
    }

    /// Acquires the lock, sleeping while someone else holds it.
    pub fn lock(&self) -> Result<(), WaitError> {
        self.lock_inner(None)
    }

    /// Acquires with a timeout in ticks.
    pub fn lock_timeout(&self, ticks: Ticks) -> Result<(), WaitError> {
        self.lock_inner(Some(ticks))
    }

    fn lock_inner(&self, timeout: Option<Ticks>) -> Result<(), WaitError> {
        loop {
            let assert = self.queue.assert_wait(timeout)?;
            {
                let mut locked = self.locked.lock();
                if !*locked {
                    *locked = true;
                    assert.deassert();
                    return Ok(());
                }
            }
            assert.block()?;
        }
    }

    pub fn try_lock(&self) -> Result<(), WaitError> {
        let mut locked = self.locked.lock();
        if *locked {
            Err(WaitError::WouldBlock)
        } else {
            *locked = true;
            Ok(())
        }
    }

    /// Releases the lock and wakes one waiter.
    pub fn unlock(&self) {
        {
            let mut locked = self.locked.lock();
            if !*locked {
                warn!("unlock of an unheld mutex");
            }
            *locked = false;
        }
        let _ = self.queue.wake_one();
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.lock()
    }

    /// How many threads are sleeping for this lock.
    pub fn queue_len(&self) -> usize {
        self.queue.waiter_count()
    }
}

impl Default for Mutex {
    fn default() -> Mutex {
        Mutex::new()
    }
}

/// A condition variable, always used with a [`Mutex`].
pub struct Condvar {
    queue: WaitQueue,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar { queue: WaitQueue::new() }
    }

    /// Atomically releases `mutex` and blocks until signalled. The mutex
    /// is reacquired before returning, whatever the wake cause was.
    ///
    /// The assert happens *before* the release: a signal arriving between
    /// the two finds the waiter already asserted, which is the canonical
    /// lost-wakeup prevention.
    pub fn wait(&self, mutex: &Mutex) -> Result<(), WaitError> {
        self.wait_inner(mutex, None)
    }

    /// [`wait`](Condvar::wait) with a timeout in ticks.
    pub fn wait_timeout(&self, mutex: &Mutex, ticks: Ticks) -> Result<(), WaitError> {
        self.wait_inner(mutex, Some(ticks))
    }

    fn wait_inner(&self, mutex: &Mutex, timeout: Option<Ticks>) -> Result<(), WaitError> {
        let assert = self.queue.assert_wait(timeout)?;
        mutex.unlock();
        let outcome = match assert.block() {
            // Broadcast empties the queue by closing it; that is a
            // normal wake for a condition waiter.
            Err(WaitError::Closed) => Ok(()),
            other => other,
        };
        let relock = mutex.lock();
        outcome.and(relock)
    }

    /// Wakes one waiter. A signal with nobody waiting is lost by design.
    pub fn signal(&self) {
        let _ = self.queue.wake_one();
    }

    /// Wakes every waiter present at broadcast time, then cycles the
    /// queue closed-and-open so no stale waiter can remain enqueued.
    pub fn broadcast(&self) {
        self.queue.wake_all();
        self.queue.close();
        self.queue.reopen();
    }

    pub fn waiter_count(&self) -> usize {
        self.queue.waiter_count()
    }
}

impl Default for Condvar {
    fn default() -> Condvar {
        Condvar::new()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::boxed::Box;
    use std::string::String;
    use std::sync::Arc as StdArc;

    struct TestClock {
        ticks: AtomicU64,
    }
    impl time::ClockSource for TestClock {
        fn name(&self) -> &'static str {
            "test-clock"
        }
        fn now(&self) -> time::Ticks {
            self.ticks.load(Ordering::Acquire)
        }
        fn precision_ns(&self) -> u64 {
            1_000_000
        }
    }
    static CLOCK_DEV: TestClock = TestClock { ticks: AtomicU64::new(0) };

    fn thread(name: &str) -> task::ThreadRef {
        let t = task::Thread::new(String::from(name), 10, Box::new(|| {}));
        task::unregister_thread(t.tid());
        t
    }

    /// Thread A holds the mutex past B's timeout: B's acquire comes back
    /// `Timeout`, and A's eventual release wakes nobody.
    ///
    /// The blocking path runs for real: a thread is adopted as the current
    /// context, and a helper (host) thread stands in for the timer
    /// interrupt, advancing the clock and draining expiry until B's
    /// timeout lands. With no idle thread in this process, `schedule`
    /// keeps the blocked context on the CPU, so the acquire loop spins
    /// through its assert/block/re-check cycle until the timeout cause
    /// arrives.
    #[test]
    fn mutex_timeout_while_held() {
        time::init(&CLOCK_DEV, None);

        let m = Mutex::new();
        let a = thread("holder");
        let b = thread("contender");

        // A takes the lock uncontended (the deassert path).
        scheduler::adopt_current(a.clone());
        m.lock().unwrap();
        assert!(m.is_locked());

        // B contends with a timeout while a helper drives time forward.
        scheduler::adopt_current(b.clone());
        let done = StdArc::new(AtomicBool::new(false));
        let tick_source = done.clone();
        let ticker = std::thread::spawn(move || {
            while !tick_source.load(Ordering::Acquire) {
                CLOCK_DEV.ticks.fetch_add(1000, Ordering::Release);
                time::on_timer_expiry();
                std::thread::yield_now();
            }
        });
        let result = m.lock_timeout(100);
        done.store(true, Ordering::Release);
        ticker.join().unwrap();

        assert_eq!(result, Err(WaitError::Timeout));
        assert!(m.is_locked(), "the holder still owns the lock");
        assert_eq!(m.queue_len(), 0, "the timed-out waiter left the queue");
        b.take_timed_out(); // a late second expiry may have re-marked it

        // The timeout wake may have parked B on the ready queue; clear it
        // so the release's effect is observable in isolation.
        while runqueue::ready_queue().pop().is_some() {}

        // A releases; with no waiter left there is nobody to wake.
        m.unlock();
        assert!(!m.is_locked());
        assert_eq!(runqueue::ready_queue().len(), 0, "release woke no thread");

        // The lock is free again for anyone, B included.
        m.try_lock().unwrap();
        m.unlock();
    }

    #[test]
    fn semaphore_counting() {
        let sem = Semaphore::new(2);
        sem.try_acquire().unwrap();
        sem.try_acquire().unwrap();
        assert_eq!(sem.try_acquire(), Err(WaitError::WouldBlock));
        sem.release();
        sem.try_acquire().unwrap();
        assert_eq!(sem.count(), 0);
        sem.release();
        sem.release();
        sem.release();
        assert_eq!(sem.count(), 3);
    }

    #[test]
    fn binary_semaphore_exclusion() {
        // At most one try_acquire succeeds between paired releases.
        let sem = Semaphore::new(1);
        sem.try_acquire().unwrap();
        assert_eq!(sem.try_acquire(), Err(WaitError::WouldBlock));
        assert_eq!(sem.try_acquire(), Err(WaitError::WouldBlock));
        sem.release();
        sem.try_acquire().unwrap();
        assert_eq!(sem.try_acquire(), Err(WaitError::WouldBlock));
        sem.release();
    }

    #[test]
    fn mutex_state_machine() {
        let mutex = Mutex::new();
        assert!(!mutex.is_locked());
        mutex.try_lock().unwrap();
        assert!(mutex.is_locked());
        assert_eq!(mutex.try_lock(), Err(WaitError::WouldBlock));
        mutex.unlock();
        assert!(!mutex.is_locked());
        mutex.try_lock().unwrap();
        mutex.unlock();
        assert_eq!(mutex.queue_len(), 0);
    }

    #[test]
    fn condvar_signals_with_no_waiters_are_lost() {
        let cv = Condvar::new();
        cv.signal();
        cv.broadcast();
        assert_eq!(cv.waiter_count(), 0);
    }
}
