//! Named answer-queue contexts.
//!
//! A call context lets one worker thread drive a series of external calls
//! requested by the event scope without a sync/yield call being in flight:
//! `send`s routed at the context are executed by whichever thread processes
//! it. Closing the context diagnoses whatever was still queued.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::answer_queue::{diagnose_leftovers, AnswerItem, AnswerQueue, AnswerQueueRef};
use crate::error::Result;
use crate::event_loop::{self, LoopShared};
use crate::registry::{self, ScopeId};
use crate::value::Value;
use crate::wrapped::ExternalObject;

/// An explicit routing target for event-scope callbacks.
pub struct CallContext {
    name: Arc<str>,
    queue: AnswerQueueRef,
}

impl CallContext {
    pub(crate) fn new(shared: &Arc<LoopShared>, name: Option<&str>) -> CallContext {
        let name: Arc<str> = match name {
            Some(n) => Arc::from(n),
            None => Arc::from(format!("$ctx-{}", Uuid::new_v4().simple()).as_str()),
        };
        CallContext {
            queue: AnswerQueue::new(name.clone(), shared.id()),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.queue.is_open()
    }

    /// Wraps an external value as an external object whose `send`s fall back
    /// to this context when no sync/yield call is being serviced.
    ///
    /// The value is marked shared by the external scope and crosses by
    /// reference; the thread driving this context executes the callbacks.
    pub fn wrap(&self, value: &Value) -> Result<Value> {
        registry::mark(value, ScopeId::External)?;
        let name = match value {
            Value::Opaque(o) => o.name().map(Arc::from),
            _ => None,
        };
        Ok(Value::External(ExternalObject::new(
            value.clone(),
            self.queue.loop_id(),
            Some(self.queue.clone()),
            name,
        )))
    }

    /// Executes the next queued callback on the current thread. Returns
    /// `false` when nothing arrived within `timeout` or the context is
    /// closed.
    pub fn process_one(&self, timeout: Duration) -> bool {
        match self.queue.pop_timeout(timeout) {
            Some(AnswerItem::Callback(request)) => {
                event_loop::execute_callback(request);
                true
            }
            Some(other) => {
                diagnose_leftovers(&self.name, vec![other]);
                false
            }
            None => false,
        }
    }

    /// Executes callbacks until the context is closed.
    pub fn drive(&self) {
        loop {
            match self.queue.pop_blocking() {
                AnswerItem::Callback(request) => event_loop::execute_callback(request),
                // contexts never carry terminal results; anything else means
                // the queue was closed under us
                _ => break,
            }
        }
    }

    /// Closes the context; later routing attempts fall through to the next
    /// fallback or fail.
    pub fn close(&self) {
        let leftovers = self.queue.close();
        diagnose_leftovers(&self.name, leftovers);
    }
}

impl Drop for CallContext {
    fn drop(&mut self) {
        if self.queue.is_open() {
            self.close();
        }
    }
}
