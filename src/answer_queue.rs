//! Answer queues.
//!
//! A suspended sync/yield caller blocks on an answer queue; the event scope
//! feeds it callback requests and finally exactly one terminal item (a result
//! or a wrapped exception). Closure is a state bit so that "queue closed but
//! not empty" stays diagnosable.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::procs::NativeFn;
use crate::registry::LoopId;
use crate::value::Value;

/// What a callback request asks the waiting external thread to do.
pub(crate) enum CallbackTarget {
    /// Invoke a plain external callable.
    Proc(NativeFn),
    /// Invoke `method` on an external object's payload.
    Send { object: Value, method: Arc<str> },
}

/// A request for the waiting external thread, executed outside any mutex.
pub(crate) struct CallbackRequest {
    pub target: CallbackTarget,
    pub args: Vec<Value>,
    pub kwargs: Vec<(Arc<str>, Value)>,
    /// Sanitised proc to re-enter the loop with the callback's result.
    pub completion: Option<Value>,
}

pub(crate) enum AnswerItem {
    Result(Value),
    Exception(Error),
    Callback(CallbackRequest),
}

impl AnswerItem {
    fn is_terminal(&self) -> bool {
        matches!(self, AnswerItem::Result(_) | AnswerItem::Exception(_))
    }
}

struct Inner {
    items: VecDeque<AnswerItem>,
    closed: bool,
    terminal_pushed: bool,
}

/// Bounded-none blocking FIFO transporting callbacks and the final result
/// between a suspended external caller and the event loop.
pub(crate) struct AnswerQueue {
    name: Arc<str>,
    loop_id: LoopId,
    inner: Mutex<Inner>,
    cond: Condvar,
}

pub(crate) type AnswerQueueRef = Arc<AnswerQueue>;

impl AnswerQueue {
    pub fn new(name: Arc<str>, loop_id: LoopId) -> AnswerQueueRef {
        Arc::new(AnswerQueue {
            name,
            loop_id,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
                terminal_pushed: false,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn loop_id(&self) -> LoopId {
        self.loop_id
    }

    pub fn is_open(&self) -> bool {
        !self.inner.lock().closed
    }

    pub fn push_callback(&self, request: CallbackRequest) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::invalid_access(format!(
                "`{}' already returned",
                self.name
            )));
        }
        inner.items.push_back(AnswerItem::Callback(request));
        self.cond.notify_one();
        Ok(())
    }

    /// Pushes the single terminal item. A second terminal push is the
    /// `MultipleResults` failure.
    pub fn push_terminal(&self, item: AnswerItem) -> Result<()> {
        debug_assert!(item.is_terminal());
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::multiple_results(format!(
                "`{}' already returned",
                self.name
            )));
        }
        if inner.terminal_pushed {
            return Err(Error::multiple_results(format!(
                "second result for `{}'",
                self.name
            )));
        }
        inner.terminal_pushed = true;
        inner.items.push_back(item);
        self.cond.notify_one();
        Ok(())
    }

    /// Blocks until an item is available.
    pub fn pop_blocking(&self) -> AnswerItem {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return item;
            }
            if inner.closed {
                return AnswerItem::Exception(Error::invalid_access(format!(
                    "`{}' was closed while a caller was waiting",
                    self.name
                )));
            }
            self.cond.wait(&mut inner);
        }
    }

    /// Waits up to `timeout` for an item; `None` on timeout or closure.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<AnswerItem> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            if self.cond.wait_for(&mut inner, timeout).timed_out() {
                return inner.items.pop_front();
            }
        }
    }

    /// Closes the queue and drains whatever is still queued.
    pub fn close(&self) -> Vec<AnswerItem> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let leftovers = inner.items.drain(..).collect();
        self.cond.notify_all();
        leftovers
    }
}

/// Diagnoses items found on a queue after its terminal result was consumed.
pub(crate) fn diagnose_leftovers(name: &str, leftovers: Vec<AnswerItem>) {
    for item in leftovers {
        match item {
            AnswerItem::Callback(_) => {
                tracing::error!(call = name, "callback requested after `{name}' returned");
            }
            AnswerItem::Result(v) => {
                tracing::error!(call = name, value = ?v, "multiple results for `{name}'");
            }
            AnswerItem::Exception(e) => {
                tracing::error!(call = name, error = %e, "late exception for `{name}'");
            }
        }
    }
}
