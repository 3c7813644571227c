//! Thread control blocks.
//!
//! A [`Thread`] is shared by `Arc`: the scheduler's queues, wait queues,
//! and the registry all hold clones, and the thread is destroyed only
//! when the last one drops (after termination, from the reaper's safe
//! context, never from its own stack).
//!
//! State machine: `Created → Ready → Running → {Ready, Waiting,
//! Terminating}`; `Waiting → Ready`; `Terminating` is final. A Running
//! thread is never on the ready queue; a Waiting thread sits on exactly
//! one wait queue.

#![no_std]

extern crate alloc;
#[macro_use]
extern crate log;

use alloc::{boxed::Box, string::String, sync::Arc, vec};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use hashbrown::HashMap;
use kernel_config::memory::{KERNEL_STACK_SIZE_IN_PAGES, PAGE_SIZE};
use sync_irq::IplMutex;
use time::{EventRef, Ticks};

/// Shared handle to a thread.
pub type ThreadRef = Arc<Thread>;

/// The thread lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Built but never started.
    Created = 0,
    /// On a ready queue, runnable.
    Ready = 1,
    /// Executing on a CPU.
    Running = 2,
    /// Blocked on a wait queue (or asserting a wait).
    Waiting = 3,
    /// Exiting; queued for asynchronous destruction.
    Terminating = 4,
}

impl ThreadState {
    fn from_u8(raw: u8) -> ThreadState {
        match raw {
            0 => ThreadState::Created,
            1 => ThreadState::Ready,
            2 => ThreadState::Running,
            3 => ThreadState::Waiting,
            _ => ThreadState::Terminating,
        }
    }
}

/// A kernel thread's stack. Owning it keeps the memory alive until the
/// reaper drops the final `ThreadRef`.
struct Stack {
    storage: Box<[u8]>,
}

impl Stack {
    fn new(size_in_pages: usize) -> Stack {
        Stack { storage: vec![0u8; size_in_pages * PAGE_SIZE].into_boxed_slice() }
    }

    /// Exclusive top of the stack.
    fn top(&self) -> usize {
        self.storage.as_ptr() as usize + self.storage.len()
    }
}

/// One thread of execution.
pub struct Thread {
    tid: u64,
    name: String,
    is_idle: bool,
    state: AtomicU8,
    /// Saved stack pointer while not Running.
    saved_sp: AtomicUsize,
    stack: Stack,
    /// The thread's body, taken exactly once by the entry trampoline.
    entry: IplMutex<Option<Box<dyn FnOnce() + Send>>>,

    /// Ticks per time slice.
    quantum: u64,
    /// Ticks remaining in the current slice.
    quanta_left: AtomicU64,
    /// Tick at which the thread last started running.
    last_schedule_tick: AtomicU64,
    /// Total ticks spent running.
    runtime: AtomicU64,
    /// Set when the thread was preempted rather than having yielded.
    preempted: AtomicBool,

    /// Set between assert_wait and the enqueue/block.
    wait_asserted: AtomicBool,
    /// The pending wait timed out.
    timed_out: AtomicBool,
    /// The wait queue closed underneath the waiter.
    wait_closed: AtomicBool,
    /// The timeout event armed for the current wait, if any.
    timeout_event: IplMutex<Option<EventRef>>,

    exit_code: AtomicUsize,
}

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

impl Thread {
    /// Builds a thread in the `Created` state with a fresh kernel stack.
    /// It does not run until the scheduler readies it.
    pub fn new(name: String, quantum: u64, entry: Box<dyn FnOnce() + Send>) -> ThreadRef {
        let thread = Arc::new(Thread {
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            name,
            is_idle: false,
            state: AtomicU8::new(ThreadState::Created as u8),
            saved_sp: AtomicUsize::new(0),
            stack: Stack::new(KERNEL_STACK_SIZE_IN_PAGES),
            entry: IplMutex::new(Some(entry)),
            quantum,
            quanta_left: AtomicU64::new(quantum),
            last_schedule_tick: AtomicU64::new(0),
            runtime: AtomicU64::new(0),
            preempted: AtomicBool::new(false),
            wait_asserted: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            wait_closed: AtomicBool::new(false),
            timeout_event: IplMutex::new(None),
            exit_code: AtomicUsize::new(0),
        });
        register_thread(&thread);
        thread
    }

    /// Builds the per-CPU idle thread. It never appears on a ready queue
    /// and never terminates.
    pub fn new_idle(quantum: u64) -> ThreadRef {
        Arc::new(Thread {
            tid: 0,
            name: String::from("idle"),
            is_idle: true,
            state: AtomicU8::new(ThreadState::Ready as u8),
            saved_sp: AtomicUsize::new(0),
            stack: Stack::new(KERNEL_STACK_SIZE_IN_PAGES),
            entry: IplMutex::new(None),
            quantum,
            quanta_left: AtomicU64::new(quantum),
            last_schedule_tick: AtomicU64::new(0),
            runtime: AtomicU64::new(0),
            preempted: AtomicBool::new(false),
            wait_asserted: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            wait_closed: AtomicBool::new(false),
            timeout_event: IplMutex::new(None),
            exit_code: AtomicUsize::new(0),
        })
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_idle(&self) -> bool {
        self.is_idle
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Takes the thread body for its first (and only) run.
    pub fn take_entry(&self) -> Option<Box<dyn FnOnce() + Send>> {
        self.entry.lock().take()
    }

    /// Pointer to the saved-stack-pointer slot, for the switch routine.
    pub fn saved_sp_slot(&self) -> *mut usize {
        self.saved_sp.as_ptr()
    }

    pub fn saved_sp(&self) -> usize {
        self.saved_sp.load(Ordering::Acquire)
    }

    pub fn set_saved_sp(&self, sp: usize) {
        self.saved_sp.store(sp, Ordering::Release);
    }

    /// Exclusive top of this thread's kernel stack.
    pub fn stack_top(&self) -> usize {
        self.stack.top()
    }

    // --- quantum accounting -------------------------------------------------

    pub fn quantum(&self) -> u64 {
        self.quantum
    }

    pub fn quanta_left(&self) -> u64 {
        self.quanta_left.load(Ordering::Relaxed)
    }

    pub fn reset_quanta(&self) {
        self.quanta_left.store(self.quantum, Ordering::Relaxed);
    }

    /// Burns one tick of the current slice, returning what remains.
    pub fn consume_tick(&self) -> u64 {
        self.runtime.fetch_add(1, Ordering::Relaxed);
        let left = self.quanta_left.load(Ordering::Relaxed).saturating_sub(1);
        self.quanta_left.store(left, Ordering::Relaxed);
        left
    }

    pub fn runtime(&self) -> Ticks {
        self.runtime.load(Ordering::Relaxed)
    }

    pub fn set_last_schedule_tick(&self, tick: Ticks) {
        self.last_schedule_tick.store(tick, Ordering::Relaxed);
    }

    pub fn last_schedule_tick(&self) -> Ticks {
        self.last_schedule_tick.load(Ordering::Relaxed)
    }

    pub fn set_preempted(&self, preempted: bool) {
        self.preempted.store(preempted, Ordering::Relaxed);
    }

    pub fn was_preempted(&self) -> bool {
        self.preempted.load(Ordering::Relaxed)
    }

    // --- wait bookkeeping ---------------------------------------------------

    pub fn set_wait_asserted(&self, asserted: bool) {
        self.wait_asserted.store(asserted, Ordering::Release);
    }

    pub fn wait_asserted(&self) -> bool {
        self.wait_asserted.load(Ordering::Acquire)
    }

    pub fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::Release);
    }

    /// Non-consuming view of the timed-out flag, for wake paths that must
    /// skip already-expired waiters without eating their wake cause.
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    /// Reads and clears the timed-out flag.
    pub fn take_timed_out(&self) -> bool {
        self.timed_out.swap(false, Ordering::AcqRel)
    }

    pub fn mark_wait_closed(&self) {
        self.wait_closed.store(true, Ordering::Release);
    }

    pub fn take_wait_closed(&self) -> bool {
        self.wait_closed.swap(false, Ordering::AcqRel)
    }

    pub fn set_timeout_event(&self, event: EventRef) {
        *self.timeout_event.lock() = Some(event);
    }

    pub fn take_timeout_event(&self) -> Option<EventRef> {
        self.timeout_event.lock().take()
    }

    // --- termination --------------------------------------------------------

    pub fn set_exit_code(&self, code: usize) {
        self.exit_code.store(code, Ordering::Release);
    }

    pub fn exit_code(&self) -> usize {
        self.exit_code.load(Ordering::Acquire)
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        trace!("thread {} '{}' destroyed", self.tid, self.name);
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "Thread({} '{}' {:?})", self.tid, self.name, self.state())
    }
}

/// All live threads, by tid. The idle threads are per-CPU and excluded.
static THREADS: IplMutex<Option<HashMap<u64, ThreadRef>>> = IplMutex::new(None);

fn register_thread(thread: &ThreadRef) {
    let mut threads = THREADS.lock();
    threads
        .get_or_insert_with(HashMap::new)
        .insert(thread.tid(), thread.clone());
}

/// Looks a live thread up by tid.
pub fn lookup_thread(tid: u64) -> Option<ThreadRef> {
    THREADS.lock().as_ref().and_then(|threads| threads.get(&tid).cloned())
}

/// Drops the registry's reference, normally as part of termination.
pub fn unregister_thread(tid: u64) -> Option<ThreadRef> {
    THREADS.lock().as_mut().and_then(|threads| threads.remove(&tid))
}

/// Count of registered live threads.
pub fn live_threads() -> usize {
    THREADS.lock().as_ref().map(|threads| threads.len()).unwrap_or(0)
}
