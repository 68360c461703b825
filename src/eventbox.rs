//! The public call surface.
//!
//! An [`Eventbox`] is a cloneable, thread-safe handle to one confined
//! instance: a user state value implementing [`Boxable`] plus the event loop
//! that serialises every operation on it. All handles are equal peers; the
//! instance is finalised when the last one is dropped, aborting whatever
//! actions are still running.

use std::fmt;
use std::sync::Arc;

use crate::action::Action;
use crate::boxable::{Boxable, CallArgs, CallKind};
use crate::call_context::CallContext;
use crate::error::Result;
use crate::event_loop::{self, GuardTime, LoopShared};
use crate::pool::ThreadPolicy;
use crate::registry::{self, ScopeId};
use crate::value::Value;

/// Construction options.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// How actions are hosted: one new thread each, or a shared pool.
    pub threadpool: ThreadPolicy,
    /// Diagnostic on event-scope execution time.
    pub guard_time: GuardTime,
    /// Advisory hint: sweep the object registry when workers queue up.
    pub gc_actions: bool,
    /// Instance name used in diagnostics; derived from the state type when
    /// absent.
    pub name: Option<String>,
}

/// Result of a kind-dispatched [`Eventbox::call`].
pub enum Reply {
    /// Async calls return the instance.
    Instance(Eventbox),
    /// Sync and yield calls return a sanitised value.
    Value(Value),
    /// Action calls return the action handle.
    Action(Action),
}

impl Reply {
    /// The returned value, `Nil` for the other reply kinds.
    pub fn into_value(self) -> Value {
        match self {
            Reply::Value(v) => v,
            Reply::Instance(_) | Reply::Action(_) => Value::Nil,
        }
    }
}

/// Thread-safe handle to a confined instance.
#[derive(Clone)]
pub struct Eventbox {
    shared: Arc<LoopShared>,
}

impl Eventbox {
    pub fn new<T: Boxable>(state: T) -> Eventbox {
        Eventbox::with_options(state, Options::default())
    }

    pub fn with_options<T: Boxable>(state: T, options: Options) -> Eventbox {
        let name = options
            .name
            .unwrap_or_else(|| short_type_name::<T>().to_string());
        Eventbox {
            shared: LoopShared::new(
                state,
                Arc::from(name.as_str()),
                options.guard_time,
                options.threadpool,
                options.gc_actions,
            ),
        }
    }

    pub(crate) fn from_shared(shared: Arc<LoopShared>) -> Eventbox {
        Eventbox { shared }
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub(crate) fn id_ptr(&self) -> usize {
        Arc::as_ptr(&self.shared) as *const () as usize
    }

    /// True when the current thread is executing inside this instance's
    /// event scope.
    pub fn in_event_scope(&self) -> bool {
        self.shared.is_event_scope()
    }

    /// Number of actions currently running.
    pub fn running_actions(&self) -> usize {
        self.shared.running_count()
    }

    /// Invokes `name` through whichever kind it was declared with.
    pub fn call(&self, name: &str, args: CallArgs) -> Result<Reply> {
        match event_loop::registered_kind(&self.shared, name)? {
            CallKind::Async => {
                event_loop::call_async(&self.shared, Arc::from(name), args)?;
                Ok(Reply::Instance(self.clone()))
            }
            CallKind::Sync => {
                event_loop::call_sync(&self.shared, Arc::from(name), args).map(Reply::Value)
            }
            CallKind::Yield => {
                event_loop::call_yield(&self.shared, Arc::from(name), args).map(Reply::Value)
            }
            CallKind::Action => {
                event_loop::start_action(&self.shared, Arc::from(name), args).map(Reply::Action)
            }
        }
    }

    /// Async entry point: the body runs in event scope, the caller gets the
    /// instance back immediately.
    pub fn call_async(&self, name: &str, args: CallArgs) -> Result<Eventbox> {
        event_loop::call_async(&self.shared, Arc::from(name), args)?;
        Ok(self.clone())
    }

    /// Sync entry point: blocks until the body returns its sanitised result.
    pub fn call_sync(&self, name: &str, args: CallArgs) -> Result<Value> {
        event_loop::call_sync(&self.shared, Arc::from(name), args)
    }

    /// Yield entry point: blocks until the body's completion handle fires.
    pub fn call_yield(&self, name: &str, args: CallArgs) -> Result<Value> {
        event_loop::call_yield(&self.shared, Arc::from(name), args)
    }

    /// Starts an action-kind operation on a worker thread.
    pub fn start_action(&self, name: &str, args: CallArgs) -> Result<Action> {
        event_loop::start_action(&self.shared, Arc::from(name), args)
    }

    /// Marks `value` as shared by the external scope: it crosses into event
    /// scopes by reference, wrapped as an external object there.
    pub fn shared_object(&self, value: &Value) -> Result<Value> {
        registry::mark(value, ScopeId::External)?;
        Ok(value.clone())
    }

    /// Blocks until every running action has terminated, aborting them
    /// first. Must be called from outside the event scope; in-scope code
    /// uses [`crate::EventScope::shutdown`].
    pub fn shutdown_and_wait(&self) -> Result<()> {
        event_loop::shutdown_and_wait(&self.shared)
    }

    /// Opens a named answer-queue context for driving external calls on the
    /// current thread.
    pub fn new_call_context(&self, name: Option<&str>) -> CallContext {
        CallContext::new(&self.shared, name)
    }
}

impl PartialEq for Eventbox {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Eventbox {}

impl fmt::Debug for Eventbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Eventbox")
            .field("name", &self.name())
            .field("running_actions", &self.running_actions())
            .finish()
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
