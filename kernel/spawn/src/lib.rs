//! Thread creation and destruction: the builder, the entry trampoline,
//! `exit`, `join`, and the reaper handoff.
//!
//! A thread must never free its own stack: `exit` marks the thread
//! `Terminating`, broadcasts and closes its join queue, hands the final
//! reference to the reaper (the Terminator work queue, installed at
//! init), and schedules away forever. The reaper drops that reference
//! from a safe context, which is what actually frees the stack.

#![no_std]

extern crate alloc;
#[macro_use]
extern crate log;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use kernel_config::time::TSK_TIMESLICE_LEN;
use spin::Once;
use sync_irq::IplMutex;
use task::{Thread, ThreadRef, ThreadState};
use wait_queue::{WaitError, WaitQueue};

/// Per-thread join queues, broadcast and closed at exit.
static JOIN_QUEUES: IplMutex<Option<HashMap<u64, Arc<WaitQueue>>>> = IplMutex::new(None);

/// Exit codes of threads that have terminated.
static EXIT_CODES: IplMutex<Option<HashMap<u64, usize>>> = IplMutex::new(None);

/// Where terminated threads go to be destroyed. Installed by init once
/// the Terminator work queue exists.
static REAPER: Once<fn(ThreadRef)> = Once::new();

/// Terminated threads awaiting a reaper, for the window before one is
/// installed.
static ZOMBIES: IplMutex<Vec<ThreadRef>> = IplMutex::new(Vec::new());

/// Builds a kernel thread around `entry`, ready to be started with
/// [`start`]. The stack is seeded so the first switch-in lands in the
/// entry trampoline.
pub fn new_thread(name: &str, entry: impl FnOnce() + Send + 'static) -> ThreadRef {
    let thread = Thread::new(String::from(name), TSK_TIMESLICE_LEN, Box::new(entry));
    let sp = unsafe {
        context_switch::prepare_stack(
            thread.stack_top() as *mut u8,
            thread_entry_trampoline as usize,
            0,
        )
    };
    thread.set_saved_sp(sp);
    JOIN_QUEUES
        .lock()
        .get_or_insert_with(HashMap::new)
        .insert(thread.tid(), Arc::new(WaitQueue::new()));
    trace!("spawned thread {} '{}'", thread.tid(), name);
    thread
}

/// Makes a created thread runnable.
pub fn start(thread: &ThreadRef) {
    scheduler::start_thread(thread.clone());
}

/// Convenience: build and immediately start.
pub fn spawn(name: &str, entry: impl FnOnce() + Send + 'static) -> ThreadRef {
    let thread = new_thread(name, entry);
    start(&thread);
    thread
}

/// Every new thread begins here after its first switch-in.
extern "C" fn thread_entry_trampoline() -> ! {
    // The switch into this thread happened at IPL High on the scheduler
    // path; the guard that raised it lives on the previous thread's
    // stack, so settle the level by hand before running anything.
    cpu::reset_ipl(cpu::Ipl::Low);
    scheduler::preempt_if_requested();

    let thread = scheduler::current_thread().expect("trampoline with no current thread");
    match thread.take_entry() {
        Some(entry) => entry(),
        None => error!("thread {} started with no body", thread.tid()),
    }
    drop(thread);
    exit(0)
}

/// Terminates the calling thread with `code`. Never returns.
pub fn exit(code: usize) -> ! {
    let thread = scheduler::current_thread().expect("exit with no current thread");
    let tid = thread.tid();
    trace!("thread {} exiting with code {}", tid, code);
    thread.set_exit_code(code);
    thread.set_state(ThreadState::Terminating);

    EXIT_CODES.lock().get_or_insert_with(HashMap::new).insert(tid, code);

    // Joiners wake with the closed cause and find the exit code above.
    if let Some(queue) = JOIN_QUEUES.lock().as_mut().and_then(|queues| queues.remove(&tid)) {
        queue.close();
    }

    // The registry's reference dies now; the reaper gets the last one
    // and frees the stack from its own context.
    task::unregister_thread(tid);
    match REAPER.get() {
        Some(reaper) => reaper(thread),
        None => ZOMBIES.lock().push(thread),
    }

    scheduler::schedule();
    unreachable!("terminated thread was scheduled again")
}

/// Blocks until the thread with `tid` terminates, returning its exit
/// code. Returns immediately if it already has.
pub fn join(tid: u64) -> Option<usize> {
    loop {
        let queue = JOIN_QUEUES.lock().as_ref().and_then(|queues| queues.get(&tid).cloned());
        match queue {
            None => break,
            Some(queue) => match queue.wait() {
                Err(WaitError::Closed) | Ok(()) => break,
                Err(WaitError::WouldBlock) => return None,
                Err(other) => {
                    warn!("join on thread {} woke oddly: {:?}", tid, other);
                    break;
                }
            },
        }
    }
    EXIT_CODES.lock().as_ref().and_then(|codes| codes.get(&tid).copied())
}

/// Installs the reaper and flushes any zombies that accumulated before
/// it existed.
pub fn set_reaper(reaper: fn(ThreadRef)) {
    REAPER.call_once(|| reaper);
    let zombies: Vec<ThreadRef> = core::mem::take(&mut *ZOMBIES.lock());
    for zombie in zombies {
        reaper(zombie);
    }
}

/// Count of unreaped terminated threads.
pub fn zombie_count() -> usize {
    ZOMBIES.lock().len()
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn new_thread_is_switch_ready() {
        let thread = new_thread("t", || {});
        assert_eq!(thread.state(), ThreadState::Created);
        let sp = thread.saved_sp();
        assert_ne!(sp, 0);
        assert_eq!(sp % 16, 0);
        assert!(sp < thread.stack_top());
        // Registered for lookup and joinable.
        assert!(task::lookup_thread(thread.tid()).is_some());
        assert!(JOIN_QUEUES.lock().as_ref().unwrap().contains_key(&thread.tid()));
        task::unregister_thread(thread.tid());
    }

    #[test]
    fn reaper_receives_zombies() {
        static REAPED: AtomicUsize = AtomicUsize::new(0);
        fn reaper(_thread: ThreadRef) {
            REAPED.fetch_add(1, Ordering::Relaxed);
        }

        // Terminations before the reaper exists park in the zombie list.
        let early = new_thread("early", || {});
        early.set_state(ThreadState::Terminating);
        task::unregister_thread(early.tid());
        ZOMBIES.lock().push(early);
        assert_eq!(zombie_count(), 1);

        set_reaper(reaper);
        assert_eq!(zombie_count(), 0);
        assert_eq!(REAPED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn join_returns_code_of_finished_thread() {
        let thread = new_thread("gone", || {});
        let tid = thread.tid();
        // Simulate the exit bookkeeping for an already-finished thread.
        EXIT_CODES.lock().get_or_insert_with(HashMap::new).insert(tid, 7);
        if let Some(queue) = JOIN_QUEUES.lock().as_mut().and_then(|q| q.remove(&tid)) {
            queue.close();
        }
        task::unregister_thread(tid);
        assert_eq!(join(tid), Some(7));
    }
}
