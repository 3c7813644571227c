//! `IplMutex`: a spinlock whose acquisition raises the IPL to `High` and
//! disables preemption, as one operation.
//!
//! Every structure that an interrupt path can touch (ready queues, wait
//! queues, timer-event lists, address spaces, zone free lists) is guarded
//! by one of these. On a single CPU the spin body never actually contends;
//! the IPL raise and the preemption hold are the part that matters, and
//! they are kept even there so the discipline extends to SMP unchanged.
//!
//! Lock order: the IPL is raised *before* the lock word is touched, so an
//! interrupt handler that needs the same lock can never fire while the
//! holder is mid-acquisition on its own CPU.

#![no_std]

use core::ops::{Deref, DerefMut};
use cpu::{hold_preempt, raise_ipl, Ipl, IplGuard, PreemptGuard};
use spin::{mutex::SpinMutex, mutex::SpinMutexGuard};

/// A spinlock that raises the IPL to [`Ipl::High`] for as long as it is held.
pub struct IplMutex<T: ?Sized> {
    inner: SpinMutex<T>,
}

/// The guard for an [`IplMutex`]. Releases the lock, the preemption hold,
/// and the IPL raise, in that order, when dropped.
pub struct IplMutexGuard<'a, T: ?Sized> {
    // Field order is drop order: lock first, then preemption, then IPL.
    guard: SpinMutexGuard<'a, T>,
    _preempt: PreemptGuard,
    _ipl: IplGuard,
}

impl<T> IplMutex<T> {
    pub const fn new(value: T) -> IplMutex<T> {
        IplMutex { inner: SpinMutex::new(value) }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> IplMutex<T> {
    /// Acquires the lock, raising the IPL to `High` first.
    pub fn lock(&self) -> IplMutexGuard<T> {
        let ipl = raise_ipl(Ipl::High);
        let preempt = hold_preempt();
        let guard = self.inner.lock();
        IplMutexGuard { guard, _preempt: preempt, _ipl: ipl }
    }

    /// Attempts the acquisition without spinning. The IPL raise is undone
    /// if the lock is unavailable.
    pub fn try_lock(&self) -> Option<IplMutexGuard<T>> {
        let ipl = raise_ipl(Ipl::High);
        let preempt = hold_preempt();
        match self.inner.try_lock() {
            Some(guard) => Some(IplMutexGuard { guard, _preempt: preempt, _ipl: ipl }),
            None => None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T> IplMutex<T> {
    /// Access without locking. Only sound where mutual exclusion is
    /// established externally (e.g. single-threaded boot).
    pub unsafe fn force_get_mut(&self) -> &mut T {
        unsafe { &mut *self.inner.as_mut_ptr() }
    }
}

// Same bounds as the underlying spin mutex.
unsafe impl<T: ?Sized + Send> Send for IplMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for IplMutex<T> {}

impl<'a, T: ?Sized> Deref for IplMutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T: ?Sized> DerefMut for IplMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: Default> Default for IplMutex<T> {
    fn default() -> IplMutex<T> {
        IplMutex::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn lock_raises_and_restores_ipl() {
        let m = IplMutex::new(5usize);
        {
            let mut g = m.lock();
            *g += 1;
            assert_eq!(cpu::current_ccb().current_ipl(), Ipl::High);
            assert!(cpu::current_ccb().preempt_disabled());
            assert!(m.try_lock().is_none());
        }
        assert_eq!(cpu::current_ccb().current_ipl(), Ipl::Low);
        assert_eq!(*m.lock(), 6);
    }
}
