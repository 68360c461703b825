//! Actions: long-running or blocking work on dedicated threads.
//!
//! An action is started by dispatching an action-kind operation. Its body
//! runs outside the event scope with sanitised arguments and only a weak way
//! back to the instance. Interruption is cooperative: the reserved abort
//! signal penetrates every library blocking helper, while user exceptions
//! queued through [`Action::raise`] are delivered only at interruption points
//! the body opts into.

use std::cell::Cell as StdCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::boxable::ActionBody;
use crate::error::{Error, Result};
use crate::event_loop::{self, LoopShared};
use crate::eventbox::Eventbox;
use crate::pool::Worker;
use crate::value::Value;

/// A signal aimed at a running or queued worker.
pub(crate) enum Signal {
    /// Reserved sentinel; stops the worker's current task.
    Abort,
    /// User exception, delivered at explicit interruption points.
    User(Value),
}

struct SignalState {
    pending: VecDeque<Value>,
    aborted: bool,
}

/// Per-worker mailbox for interruption signals.
pub(crate) struct SignalCell {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl SignalCell {
    pub fn new() -> Arc<SignalCell> {
        Arc::new(SignalCell {
            state: Mutex::new(SignalState {
                pending: VecDeque::new(),
                aborted: false,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn send(&self, signal: Signal) {
        let mut state = self.state.lock();
        match signal {
            Signal::Abort => state.aborted = true,
            Signal::User(v) => state.pending.push_back(v),
        }
        self.cond.notify_all();
    }

    /// Discards everything still queued (late interrupts after the work
    /// already ended).
    pub fn drain(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.aborted = false;
    }

    /// Non-blocking delivery check. Abort always fires; user signals only
    /// when an interruption window is open.
    fn poll(&self, window: bool) -> Option<Error> {
        let mut state = self.state.lock();
        if state.aborted {
            return Some(Error::AbortAction);
        }
        if window {
            if let Some(v) = state.pending.pop_front() {
                return Some(Error::Raised(v));
            }
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn wait_abort_for_tests(&self) -> Result<()> {
        self.wait(false, None)
    }

    #[cfg(test)]
    pub(crate) fn take_user_for_tests(&self) -> Option<Value> {
        self.state.lock().pending.pop_front()
    }

    /// Blocks until a deliverable signal arrives or the timeout elapses.
    fn wait(&self, window: bool, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return Err(Error::AbortAction);
            }
            if window {
                if let Some(v) = state.pending.pop_front() {
                    return Err(Error::Raised(v));
                }
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(());
                    }
                    self.cond.wait_until(&mut state, deadline);
                }
                None => self.cond.wait(&mut state),
            }
        }
    }
}

pub(crate) struct ActionInner {
    name: Arc<str>,
    worker: Worker,
    event_loop: Weak<LoopShared>,
    /// Token of the thread running the body; 0 until started.
    thread_token: AtomicU64,
    /// Arena slot in the owning loop's running set.
    slot: AtomicUsize,
}

/// Handle to a running action.
#[derive(Clone)]
pub struct Action {
    pub(crate) inner: Arc<ActionInner>,
}

impl Action {
    pub(crate) fn new(name: Arc<str>, worker: Worker, event_loop: Weak<LoopShared>) -> Action {
        Action {
            inner: Arc::new(ActionInner {
                name,
                worker,
                event_loop,
                thread_token: AtomicU64::new(0),
                slot: AtomicUsize::new(usize::MAX),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queues a user exception for delivery at the action's next
    /// interruption point. The reserved abort sentinel cannot travel this
    /// way; use [`Action::abort`].
    pub fn raise(&self, error: impl Into<Value>) {
        self.inner.worker.signal(Signal::User(error.into()));
    }

    /// Sends the reserved abort signal, which penetrates the library's
    /// blocking helpers regardless of interruption windows.
    pub fn abort(&self) {
        self.inner.worker.signal(Signal::Abort);
    }

    /// True when called from this action's worker thread.
    pub fn is_current(&self) -> bool {
        self.inner.thread_token.load(Ordering::SeqCst) == event_loop::current_thread_token()
    }

    /// Blocks until the worker has terminated.
    pub fn join(&self) {
        self.inner.worker.join();
    }

    pub(crate) fn set_slot(&self, slot: usize) {
        self.inner.slot.store(slot, Ordering::SeqCst);
    }

    pub(crate) fn slot(&self) -> usize {
        self.inner.slot.load(Ordering::SeqCst)
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Action {}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Action({})", self.name())
    }
}

/// Context handed to an action body on its worker thread.
///
/// Holds the interruption machinery and the weak way back to the instance;
/// the instance's mutable state is reachable only through its public
/// operations.
pub struct ActionScope {
    action: Action,
    signals: Arc<SignalCell>,
    window: StdCell<bool>,
}

impl ActionScope {
    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn name(&self) -> &str {
        self.action.name()
    }

    /// Upgrades the weak back-reference. When the instance has been
    /// finalised the borrow fails and the action aborts.
    pub fn eventbox(&self) -> Result<Eventbox> {
        self.action
            .inner
            .event_loop
            .upgrade()
            .map(Eventbox::from_shared)
            .ok_or(Error::AbortAction)
    }

    /// Explicit interruption point.
    pub fn checkpoint(&self) -> Result<()> {
        match self.signals.poll(self.window.get()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Sleeps, waking early when a deliverable signal arrives.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.signals.wait(self.window.get(), Some(duration))
    }

    /// Parks until a deliverable signal arrives; always returns the signal
    /// as an error.
    pub fn park(&self) -> Result<()> {
        self.signals.wait(self.window.get(), None)
    }

    /// Opens an interruption window: inside `f`, queued user exceptions are
    /// delivered at every interruption point, pending ones immediately.
    pub fn interruptible<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let prev = self.window.replace(true);
        let result = match self.checkpoint() {
            Err(e) => Err(e),
            Ok(()) => f(),
        };
        self.window.set(prev);
        result
    }
}

/// Worker-side wrapper around an action body: runs it, logs its fate, and
/// finalises the running-set membership.
pub(crate) fn run_action(action: Action, signals: Arc<SignalCell>, body: ActionBody) {
    action
        .inner
        .thread_token
        .store(event_loop::current_thread_token(), Ordering::SeqCst);

    let scope = ActionScope {
        action: action.clone(),
        signals,
        window: StdCell::new(false),
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| body(&scope)));
    match outcome {
        Ok(Ok(())) => tracing::trace!(action = %action.name(), "action finished"),
        Ok(Err(Error::AbortAction)) => {
            tracing::debug!(action = %action.name(), "action aborted")
        }
        Ok(Err(e)) => {
            tracing::error!(action = %action.name(), error = %e, "action died with error")
        }
        Err(_) => tracing::error!(action = %action.name(), "action panicked"),
    }

    if let Some(shared) = action.inner.event_loop.upgrade() {
        event_loop::finalize_action(&shared, &action);
    }
}

/// Index arena for the running-actions set: the loop refers to actions by
/// slot, actions refer back weakly, and no strong cycle exists.
pub(crate) struct ActionArena {
    slots: Vec<Option<Action>>,
    free: Vec<usize>,
    len: usize,
}

impl ActionArena {
    pub fn new() -> Self {
        ActionArena {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn insert(&mut self, action: Action) -> usize {
        self.len += 1;
        match self.free.pop() {
            Some(slot) => {
                action.set_slot(slot);
                self.slots[slot] = Some(action);
                slot
            }
            None => {
                let slot = self.slots.len();
                action.set_slot(slot);
                self.slots.push(Some(action));
                slot
            }
        }
    }

    pub fn remove(&mut self, slot: usize) -> Option<Action> {
        let taken = self.slots.get_mut(slot)?.take();
        if taken.is_some() {
            self.free.push(slot);
            self.len -= 1;
        }
        taken
    }

    /// Removes `action` only if it still occupies its recorded slot; a freed
    /// and reused slot is left alone.
    pub fn remove_action(&mut self, action: &Action) -> Option<Action> {
        let slot = action.slot();
        match self.slots.get(slot) {
            Some(Some(existing)) if existing == action => self.remove(slot),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, action: &Action) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|a| a == action)
    }

    pub fn snapshot(&self) -> Vec<Action> {
        self.slots.iter().flatten().cloned().collect()
    }
}
