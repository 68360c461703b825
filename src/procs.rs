//! The proc taxonomy.
//!
//! Internal procs (`async`/`sync`/`yield`) are created inside an event scope
//! and stay bound to their loop: invoked from outside they behave exactly
//! like the call kind of the same name. The completion proc is the one-shot
//! handle of a yield call. External procs wrap a plain callable handed into
//! the event scope; invoking one there enqueues a callback request so the
//! callable runs on the thread that owns it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::answer_queue::{AnswerItem, AnswerQueueRef};
use crate::boxable::{Boxable, CallArgs};
use crate::error::{Error, Result};
use crate::event_loop::{self, EventScope, LoopShared};
use crate::registry::LoopId;
use crate::value::Value;

/// A plain callable: what external code passes across the boundary.
pub type NativeFn = Arc<dyn Fn(CallArgs) -> Result<Value> + Send + Sync>;

/// Body of an internal proc. Runs in event scope; the state is handed in as
/// `&mut dyn Boxable` and downcast by the body.
pub type ScopeFn =
    Arc<dyn Fn(&mut dyn Boxable, &mut EventScope<'_>, ProcArgs) -> Result<Value> + Send + Sync>;

/// Argument bundle delivered to proc bodies.
pub struct ProcArgs {
    pub args: Vec<Value>,
    pub kwargs: Vec<(Arc<str>, Value)>,
    pub block: Option<Value>,
    /// Present for yield procs and yield calls.
    pub completion: Option<Completion>,
}

impl ProcArgs {
    pub fn new(args: Vec<Value>) -> Self {
        ProcArgs {
            args,
            kwargs: Vec::new(),
            block: None,
            completion: None,
        }
    }

    /// Positional argument by index, `Nil` when absent.
    pub fn arg(&self, index: usize) -> Value {
        self.args.get(index).cloned().unwrap_or(Value::Nil)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs
            .iter()
            .find(|(n, _)| n.as_ref() == name)
            .map(|(_, v)| v)
    }
}

/// Kind of an internal proc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcKind {
    Async,
    Sync,
    Yield,
}

pub(crate) struct InternalProc {
    pub kind: ProcKind,
    pub name: Arc<str>,
    pub body: ScopeFn,
    pub event_loop: Weak<LoopShared>,
    pub loop_id: LoopId,
}

pub(crate) struct ExternalProcInner {
    pub native: NativeFn,
    pub name: Arc<str>,
    /// The one event scope this wrapper may be invoked from.
    pub for_loop: LoopId,
}

#[derive(Clone)]
pub(crate) enum ProcInner {
    /// Plain callable in external scope.
    Native(NativeFn),
    Internal(Arc<InternalProc>),
    Completion(Completion),
    External(Arc<ExternalProcInner>),
}

/// A callable value.
#[derive(Clone)]
pub struct Proc {
    pub(crate) inner: ProcInner,
}

impl Proc {
    /// Wraps a plain Rust closure as an external-scope callable.
    pub fn native<F>(f: F) -> Proc
    where
        F: Fn(CallArgs) -> Result<Value> + Send + Sync + 'static,
    {
        Proc {
            inner: ProcInner::Native(Arc::new(f)),
        }
    }

    pub(crate) fn from_native_fn(f: NativeFn) -> Proc {
        Proc {
            inner: ProcInner::Native(f),
        }
    }

    pub(crate) fn internal(p: Arc<InternalProc>) -> Proc {
        Proc {
            inner: ProcInner::Internal(p),
        }
    }

    pub(crate) fn external(p: Arc<ExternalProcInner>) -> Proc {
        Proc {
            inner: ProcInner::External(p),
        }
    }

    pub fn completion(c: Completion) -> Proc {
        Proc {
            inner: ProcInner::Completion(c),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.inner {
            ProcInner::Native(_) => "proc",
            ProcInner::Internal(p) => match p.kind {
                ProcKind::Async => "async-proc",
                ProcKind::Sync => "sync-proc",
                ProcKind::Yield => "yield-proc",
            },
            ProcInner::Completion(_) => "completion-proc",
            ProcInner::External(_) => "external-proc",
        }
    }

    pub(crate) fn id(&self) -> usize {
        match &self.inner {
            ProcInner::Native(f) => Arc::as_ptr(f) as *const () as usize,
            ProcInner::Internal(p) => Arc::as_ptr(p) as *const () as usize,
            ProcInner::Completion(c) => Arc::as_ptr(&c.inner) as *const () as usize,
            ProcInner::External(p) => Arc::as_ptr(p) as *const () as usize,
        }
    }

    /// Invokes the proc from external scope.
    ///
    /// Async procs return the owning instance, sync procs the sanitised body
    /// result, yield procs suspend the caller until completion. Invoking a
    /// proc inside the event scope it belongs to is an `InvalidAccess`;
    /// in-scope code uses [`Proc::invoke_in_scope`] or
    /// [`EventScope::call_external`] instead.
    pub fn call(&self, args: CallArgs) -> Result<Value> {
        match &self.inner {
            ProcInner::Native(f) => f(args),
            ProcInner::Internal(p) => {
                if let Some(shared) = p.event_loop.upgrade() {
                    if shared.is_event_scope() {
                        return Err(Error::invalid_access(format!(
                            "proc `{}' invoked through the external surface inside \
                             its own event scope; use invoke_in_scope",
                            p.name
                        )));
                    }
                }
                event_loop::call_internal_proc(p, args)
            }
            ProcInner::Completion(c) => {
                let value = args.args.into_iter().next().unwrap_or(Value::Nil);
                c.complete(value)?;
                Ok(Value::Nil)
            }
            ProcInner::External(p) => match event_loop::current_scope() {
                Some(id) if id == p.for_loop => Err(Error::invalid_access(format!(
                    "external proc `{}' must be routed with call_external inside \
                     the event scope",
                    p.name
                ))),
                Some(_) => Err(Error::invalid_access(format!(
                    "external proc `{}' invoked inside a different event scope",
                    p.name
                ))),
                None => (p.native)(args),
            },
        }
    }

    /// Runs an internal proc directly on the current event-scope stack.
    ///
    /// Yield procs need a completion supplied by the caller through `args`.
    pub fn invoke_in_scope(
        &self,
        state: &mut dyn Boxable,
        scope: &mut EventScope<'_>,
        mut args: ProcArgs,
    ) -> Result<Value> {
        match &self.inner {
            ProcInner::Internal(p) => {
                if p.loop_id != scope.loop_id() {
                    return Err(Error::invalid_access(format!(
                        "proc `{}' belongs to a different event scope",
                        p.name
                    )));
                }
                if p.kind == ProcKind::Yield && args.completion.is_none() {
                    return Err(Error::invalid_access(format!(
                        "yield proc `{}' invoked in scope without a completion",
                        p.name
                    )));
                }
                (p.body)(state, scope, args)
            }
            ProcInner::Completion(c) => {
                let value = args.args.drain(..).next().unwrap_or(Value::Nil);
                c.complete(value)?;
                Ok(Value::Nil)
            }
            ProcInner::External(_) | ProcInner::Native(_) => Err(Error::invalid_access(
                "external callables must be routed with call_external",
            )),
        }
    }
}

impl fmt::Debug for Proc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<{}>", self.kind_name())
    }
}

pub(crate) struct CompletionInner {
    pub name: Arc<str>,
    pub queue: AnswerQueueRef,
    pub event_loop: Weak<LoopShared>,
    fired: AtomicBool,
}

/// One-shot completion handle of a yield call.
///
/// `complete` delivers the result, `raise` delivers an exception; either way
/// the handle becomes inert and a second use is the `MultipleResults`
/// failure. Dropping an unfired handle delivers a diagnostic exception so the
/// suspended caller cannot hang.
#[derive(Clone)]
pub struct Completion {
    pub(crate) inner: Arc<CompletionInner>,
}

impl Completion {
    pub(crate) fn new(
        name: Arc<str>,
        queue: AnswerQueueRef,
        event_loop: Weak<LoopShared>,
    ) -> Completion {
        Completion {
            inner: Arc::new(CompletionInner {
                name,
                queue,
                event_loop,
                fired: AtomicBool::new(false),
            }),
        }
    }

    pub fn complete(&self, value: Value) -> Result<()> {
        self.fire(AnswerItem::Result(value))
    }

    /// Delivers a user exception to the suspended caller.
    pub fn raise(&self, error: impl Into<Value>) -> Result<()> {
        self.fire(AnswerItem::Exception(Error::Raised(error.into())))
    }

    pub(crate) fn raise_error(&self, error: Error) -> Result<()> {
        self.fire(AnswerItem::Exception(error))
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    fn fire(&self, item: AnswerItem) -> Result<()> {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return Err(Error::multiple_results(format!(
                "completion of `{}' invoked twice",
                self.inner.name
            )));
        }
        event_loop::deliver_completion(&self.inner, item)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Completion({}, fired: {})",
            self.inner.name,
            self.is_fired()
        )
    }
}

impl Drop for CompletionInner {
    fn drop(&mut self) {
        if !self.fired.load(Ordering::SeqCst) && self.queue.is_open() {
            let _ = self.queue.push_terminal(AnswerItem::Exception(
                Error::invalid_access(format!(
                    "yield call `{}' abandoned before completion",
                    self.name
                )),
            ));
        }
    }
}
