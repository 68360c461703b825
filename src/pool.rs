//! Worker hosting.
//!
//! Actions run either on a fresh thread per action (the builtin policy) or on
//! a fixed-size [`ThreadPool`] of reusable workers with FIFO dispatch. A pool
//! request is a one-way state machine: `Enqueued` accumulates signals,
//! `Running` forwards them to the worker, `Finished` drains late ones
//! silently. The reserved abort signal stops one request's work, never the
//! worker thread hosting it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::action::{Signal, SignalCell};
use crate::event_loop;
use crate::registry;
use crate::value::Value;

/// Work item: receives the signal cell the host assigned to it.
pub(crate) type WorkFn = Box<dyn FnOnce(&Arc<SignalCell>) + Send + 'static>;

/// Simple open-once latch for dedicated worker termination.
pub(crate) struct DoneLatch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl DoneLatch {
    pub fn new() -> Arc<DoneLatch> {
        Arc::new(DoneLatch {
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub fn open(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}

/// Per-action facade over whichever host runs the body.
pub(crate) enum Worker {
    Dedicated {
        signals: Arc<SignalCell>,
        latch: Arc<DoneLatch>,
    },
    Pooled(PoolTicket),
}

impl Worker {
    pub fn signal(&self, signal: Signal) {
        match self {
            Worker::Dedicated { signals, .. } => signals.send(signal),
            Worker::Pooled(ticket) => ticket.signal(signal),
        }
    }

    pub fn join(&self) {
        match self {
            Worker::Dedicated { latch, .. } => latch.wait(),
            Worker::Pooled(ticket) => ticket.join(),
        }
    }

    #[cfg(test)]
    pub fn test_stub() -> Worker {
        let latch = DoneLatch::new();
        latch.open();
        Worker::Dedicated {
            signals: SignalCell::new(),
            latch,
        }
    }
}

/// How an event loop hosts its actions.
#[derive(Clone, Default)]
pub enum ThreadPolicy {
    /// One new thread per action.
    #[default]
    SpawnThread,
    /// A shared fixed-size pool.
    Pool(ThreadPool),
}

impl ThreadPolicy {
    pub(crate) fn start(&self, name: &str, work: WorkFn) -> Worker {
        match self {
            ThreadPolicy::SpawnThread => {
                let signals = SignalCell::new();
                let latch = DoneLatch::new();
                let thread_signals = signals.clone();
                let thread_latch = latch.clone();
                thread::Builder::new()
                    .name(format!("eventbox-action-{name}"))
                    .spawn(move || {
                        work(&thread_signals);
                        thread_latch.open();
                    })
                    .expect("failed to spawn action thread");
                Worker::Dedicated { signals, latch }
            }
            ThreadPolicy::Pool(pool) => Worker::Pooled(pool.submit(name, work)),
        }
    }
}

impl std::fmt::Debug for ThreadPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadPolicy::SpawnThread => write!(f, "SpawnThread"),
            ThreadPolicy::Pool(pool) => write!(f, "Pool(size: {})", pool.size()),
        }
    }
}

enum RequestState {
    Enqueued { work: WorkFn, pending: Vec<Signal> },
    Running { signals: Arc<SignalCell>, token: u64 },
    Finished,
}

pub(crate) struct PoolRequest {
    name: Arc<str>,
    state: Mutex<RequestState>,
    cond: Condvar,
}

/// Per-request handle: raise, current-thread test, join and terminate.
#[derive(Clone)]
pub struct PoolTicket {
    request: Arc<PoolRequest>,
}

impl PoolTicket {
    /// Queues a user exception for the request's worker.
    pub fn raise(&self, error: impl Into<Value>) {
        self.signal(Signal::User(error.into()));
    }

    /// Aborts the request: cancels it while enqueued, interrupts its current
    /// work while running, and is a no-op once finished.
    pub fn terminate(&self) {
        self.signal(Signal::Abort);
    }

    /// True when called from the thread currently running this request.
    pub fn is_current(&self) -> bool {
        match &*self.request.state.lock() {
            RequestState::Running { token, .. } => *token == event_loop::current_thread_token(),
            _ => false,
        }
    }

    /// Blocks until the request has finished (or was cancelled).
    pub fn join(&self) {
        let mut state = self.request.state.lock();
        while !matches!(*state, RequestState::Finished) {
            self.request.cond.wait(&mut state);
        }
    }

    pub(crate) fn signal(&self, signal: Signal) {
        let mut state = self.request.state.lock();
        match &mut *state {
            RequestState::Enqueued { pending, .. } => match signal {
                // abort before dispatch: Enqueued -> Finished, work dropped
                Signal::Abort => {
                    *state = RequestState::Finished;
                    self.request.cond.notify_all();
                }
                user @ Signal::User(_) => pending.push(user),
            },
            RequestState::Running { signals, .. } => signals.send(signal),
            // late interrupts are drained silently
            RequestState::Finished => {}
        }
    }
}

struct PoolInner {
    tx: Mutex<Option<Sender<Arc<PoolRequest>>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    size: usize,
    busy: AtomicUsize,
    run_gc_when_busy: bool,
    gc_armed: AtomicBool,
}

/// Pool construction options.
#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    /// Trigger one registry sweep when work queues behind busy workers.
    pub run_gc_when_busy: bool,
}

/// Fixed-size pool of reusable worker threads with FIFO request ordering.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    pub fn new(size: usize) -> ThreadPool {
        ThreadPool::with_options(size, PoolOptions::default())
    }

    /// Pool sized to the number of logical CPUs.
    pub fn with_default_size() -> ThreadPool {
        ThreadPool::new(num_cpus::get())
    }

    pub fn with_options(size: usize, options: PoolOptions) -> ThreadPool {
        assert!(size > 0, "thread pool needs at least one worker");
        let (tx, rx) = channel::unbounded::<Arc<PoolRequest>>();
        let inner = Arc::new(PoolInner {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::with_capacity(size)),
            size,
            busy: AtomicUsize::new(0),
            run_gc_when_busy: options.run_gc_when_busy,
            gc_armed: AtomicBool::new(true),
        });

        let mut workers = inner.workers.lock();
        for idx in 0..size {
            let rx = rx.clone();
            let weak = Arc::downgrade(&inner);
            let handle = thread::Builder::new()
                .name(format!("eventbox-pool-{idx}"))
                .spawn(move || worker_loop(rx, weak))
                .expect("failed to spawn pool worker");
            workers.push(handle);
        }
        drop(workers);

        ThreadPool { inner }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Enqueues arbitrary work; returns the per-request handle.
    pub fn new_request<F>(&self, work: F) -> PoolTicket
    where
        F: FnOnce(&Arc<SignalCell>) + Send + 'static,
    {
        self.submit("request", Box::new(work))
    }

    pub(crate) fn submit(&self, name: &str, work: WorkFn) -> PoolTicket {
        let request = Arc::new(PoolRequest {
            name: Arc::from(name),
            state: Mutex::new(RequestState::Enqueued {
                work,
                pending: Vec::new(),
            }),
            cond: Condvar::new(),
        });

        self.maybe_trigger_gc();

        let delivered = match &*self.inner.tx.lock() {
            Some(tx) => tx.send(request.clone()).is_ok(),
            None => false,
        };
        if !delivered {
            tracing::warn!(request = %request.name, "request submitted to a terminated pool");
            let mut state = request.state.lock();
            *state = RequestState::Finished;
            request.cond.notify_all();
        }

        PoolTicket { request }
    }

    /// One-shot GC hint: when every worker is busy, sweep the object registry
    /// once, re-arming after the sweep completes.
    fn maybe_trigger_gc(&self) {
        if !self.inner.run_gc_when_busy {
            return;
        }
        if self.inner.busy.load(Ordering::SeqCst) < self.inner.size {
            return;
        }
        if !self.inner.gc_armed.swap(false, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name("eventbox-pool-gc".to_string())
            .spawn(move || {
                let dropped = registry::sweep();
                tracing::debug!(dropped, "gc-when-busy sweep finished");
                inner.gc_armed.store(true, Ordering::SeqCst);
            });
        if spawned.is_err() {
            self.inner.gc_armed.store(true, Ordering::SeqCst);
        }
    }

    /// Closes the queue and joins every worker after it drains.
    pub fn shutdown(&self) {
        self.inner.tx.lock().take();
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ThreadPool(size: {}, busy: {})",
            self.inner.size,
            self.inner.busy.load(Ordering::SeqCst)
        )
    }
}

fn worker_loop(rx: Receiver<Arc<PoolRequest>>, inner: Weak<PoolInner>) {
    while let Ok(request) = rx.recv() {
        // dispatch: Enqueued -> Running, flushing accumulated signals in order
        let dispatched = {
            let mut state = request.state.lock();
            match std::mem::replace(&mut *state, RequestState::Finished) {
                RequestState::Enqueued { work, pending } => {
                    let signals = SignalCell::new();
                    for signal in pending {
                        signals.send(signal);
                    }
                    *state = RequestState::Running {
                        signals: signals.clone(),
                        token: event_loop::current_thread_token(),
                    };
                    Some((work, signals))
                }
                // cancelled while queued
                RequestState::Finished => {
                    request.cond.notify_all();
                    None
                }
                running @ RequestState::Running { .. } => {
                    *state = running;
                    None
                }
            }
        };

        let Some((work, signals)) = dispatched else {
            continue;
        };

        if let Some(pool) = inner.upgrade() {
            pool.busy.fetch_add(1, Ordering::SeqCst);
        }

        if catch_unwind(AssertUnwindSafe(|| work(&signals))).is_err() {
            tracing::error!(request = %request.name, "pool work panicked");
        }

        {
            let mut state = request.state.lock();
            *state = RequestState::Finished;
            request.cond.notify_all();
        }
        // late interrupts that raced the finish line
        signals.drain();

        if let Some(pool) = inner.upgrade() {
            pool.busy.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // closing the channel lets idle workers exit on their own
        self.tx.lock().take();
    }
}
