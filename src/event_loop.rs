//! The event-loop dispatcher.
//!
//! One mutex per instance establishes the event scope: holding it is the
//! authoritative answer to "am I in event scope". Every operation body runs
//! on the caller's thread under that mutex; suspended sync/yield callers
//! drive a callback loop on their answer queue; completions fired while the
//! mutex is held become observable at its release.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::action::{run_action, Action, ActionArena};
use crate::answer_queue::{
    diagnose_leftovers, AnswerItem, AnswerQueue, AnswerQueueRef, CallbackRequest, CallbackTarget,
};
use crate::boxable::{ActionBody, Boxable, CallArgs, CallKind, Dispatch, Interface, MethodCall};
use crate::error::{Error, Result};
use crate::eventbox::Eventbox;
use crate::pool::{ThreadPolicy, WorkFn};
use crate::procs::{
    Completion, CompletionInner, InternalProc, Proc, ProcArgs, ProcInner, ProcKind, ScopeFn,
};
use crate::registry::{self, LoopId, ScopeId};
use crate::sanitizer;
use crate::value::Value;
use crate::wrapped;

// ---------------------------------------------------------------------------
// thread identity and per-thread call context

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    /// Loops whose mutex this thread currently holds, innermost last.
    static SCOPE_STACK: RefCell<Vec<LoopId>> = const { RefCell::new(Vec::new()) };
    /// Answer queues this thread is currently driving a callback loop for.
    static OPEN_QUEUES: RefCell<Vec<AnswerQueueRef>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

/// Innermost event scope the current thread is executing in, if any.
pub(crate) fn current_scope() -> Option<LoopId> {
    SCOPE_STACK.with(|s| s.borrow().last().copied())
}

/// The open answer queue a re-entering call may inherit: the innermost queue
/// this thread is driving that belongs to `loop_id` and has not delivered its
/// result yet.
fn inherited_open_queue(loop_id: LoopId) -> Option<AnswerQueueRef> {
    OPEN_QUEUES.with(|qs| {
        qs.borrow()
            .iter()
            .rev()
            .find(|q| q.loop_id() == loop_id && q.is_open())
            .cloned()
    })
}

struct OpenQueueGuard;

impl OpenQueueGuard {
    fn push(queue: AnswerQueueRef) -> OpenQueueGuard {
        OPEN_QUEUES.with(|qs| qs.borrow_mut().push(queue));
        OpenQueueGuard
    }
}

impl Drop for OpenQueueGuard {
    fn drop(&mut self) {
        OPEN_QUEUES.with(|qs| {
            qs.borrow_mut().pop();
        });
    }
}

// ---------------------------------------------------------------------------
// guard time

/// Diagnostic on the wall-clock duration of event-scope executions.
#[derive(Clone)]
pub enum GuardTime {
    Off,
    /// Warn when a body exceeds the threshold.
    Threshold(Duration),
    /// Arbitrary observer called with (elapsed, operation name).
    Observer(Arc<dyn Fn(Duration, &str) + Send + Sync>),
}

impl Default for GuardTime {
    fn default() -> Self {
        GuardTime::Threshold(Duration::from_millis(500))
    }
}

impl GuardTime {
    pub fn observer<F>(f: F) -> GuardTime
    where
        F: Fn(Duration, &str) + Send + Sync + 'static,
    {
        GuardTime::Observer(Arc::new(f))
    }

    fn observe(&self, elapsed: Duration, name: &str) {
        match self {
            GuardTime::Off => {}
            GuardTime::Threshold(limit) => {
                if elapsed > *limit {
                    tracing::warn!(
                        operation = name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        limit_ms = limit.as_millis() as u64,
                        "event scope exceeded guard time; \
                         move blocking work into an action"
                    );
                }
            }
            GuardTime::Observer(f) => f(elapsed, name),
        }
    }
}

impl std::fmt::Debug for GuardTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardTime::Off => write!(f, "Off"),
            GuardTime::Threshold(d) => write!(f, "Threshold({d:?})"),
            GuardTime::Observer(_) => write!(f, "Observer"),
        }
    }
}

// ---------------------------------------------------------------------------
// loop state

pub(crate) struct LatestCall {
    pub queue: Option<AnswerQueueRef>,
    pub name: Arc<str>,
}

pub(crate) struct Core {
    state: Box<dyn Boxable>,
    latest: Option<LatestCall>,
    actions: ActionArena,
    shutdown_waiters: Vec<Value>,
}

pub(crate) struct LoopShared {
    id: LoopId,
    name: Arc<str>,
    interface: Interface,
    core: Mutex<Core>,
    /// Thread token of the mutex holder; 0 when free.
    owner: AtomicU64,
    /// Completion deliveries waiting for the mutex release.
    deferred: Mutex<Vec<(AnswerQueueRef, AnswerItem)>>,
    /// Read-only running-actions snapshot for paths that must not take the
    /// core mutex (finalisers).
    snapshot: Mutex<Arc<Vec<Action>>>,
    guard: GuardTime,
    pool: ThreadPolicy,
    pub(crate) gc_actions: bool,
    shutdown: AtomicBool,
}

impl LoopShared {
    pub fn new<T: Boxable>(
        state: T,
        name: Arc<str>,
        guard: GuardTime,
        pool: ThreadPolicy,
        gc_actions: bool,
    ) -> Arc<LoopShared> {
        Arc::new(LoopShared {
            id: LoopId::next(),
            name,
            interface: T::interface(),
            core: Mutex::new(Core {
                state: Box::new(state),
                latest: None,
                actions: ActionArena::new(),
                shutdown_waiters: Vec::new(),
            }),
            owner: AtomicU64::new(0),
            deferred: Mutex::new(Vec::new()),
            snapshot: Mutex::new(Arc::new(Vec::new())),
            guard,
            pool,
            gc_actions,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> LoopId {
        self.id
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// The event-scope predicate: does the current thread hold the mutex.
    pub fn is_event_scope(&self) -> bool {
        self.owner.load(Ordering::SeqCst) == current_thread_token()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn running_count(&self) -> usize {
        self.snapshot.lock().len()
    }
}

impl Drop for LoopShared {
    fn drop(&mut self) {
        // finaliser path: abort outstanding actions from the read-only
        // snapshot, never touching the core mutex
        self.shutdown.store(true, Ordering::SeqCst);
        let snapshot = self.snapshot.lock().clone();
        for action in snapshot.iter() {
            action.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// event scope

/// Execution context of a body running inside the event scope.
pub struct EventScope<'a> {
    shared: &'a Arc<LoopShared>,
    latest: &'a mut Option<LatestCall>,
    actions: &'a mut ActionArena,
    shutdown_waiters: &'a mut Vec<Value>,
}

impl<'a> EventScope<'a> {
    pub(crate) fn shared(&self) -> &Arc<LoopShared> {
        self.shared
    }

    pub fn loop_id(&self) -> LoopId {
        self.shared.id
    }

    /// Handle to the instance this scope belongs to.
    pub fn eventbox(&self) -> Eventbox {
        Eventbox::from_shared(self.shared.clone())
    }

    /// Name of the external call currently being serviced, if any.
    pub fn latest_call_name(&self) -> Option<Arc<str>> {
        self.latest.as_ref().map(|l| l.name.clone())
    }

    /// Marks `value` as shared by this event scope: it will cross boundaries
    /// by reference, wrapped and inaccessible on the far side.
    pub fn shared_object(&self, value: &Value) -> Result<Value> {
        registry::mark(value, ScopeId::Loop(self.shared.id))?;
        Ok(value.clone())
    }

    /// Builds an async proc bound to this scope.
    pub fn async_proc<F>(&self, body: F) -> Proc
    where
        F: Fn(&mut dyn Boxable, &mut EventScope<'_>, ProcArgs) -> Result<Value>
            + Send
            + Sync
            + 'static,
    {
        self.new_proc(ProcKind::Async, Arc::new(body))
    }

    /// Builds a sync proc bound to this scope.
    pub fn sync_proc<F>(&self, body: F) -> Proc
    where
        F: Fn(&mut dyn Boxable, &mut EventScope<'_>, ProcArgs) -> Result<Value>
            + Send
            + Sync
            + 'static,
    {
        self.new_proc(ProcKind::Sync, Arc::new(body))
    }

    /// Builds a yield proc bound to this scope.
    pub fn yield_proc<F>(&self, body: F) -> Proc
    where
        F: Fn(&mut dyn Boxable, &mut EventScope<'_>, ProcArgs) -> Result<Value>
            + Send
            + Sync
            + 'static,
    {
        self.new_proc(ProcKind::Yield, Arc::new(body))
    }

    fn new_proc(&self, kind: ProcKind, body: ScopeFn) -> Proc {
        let name = format!("$proc-{}", uuid::Uuid::new_v4().simple());
        Proc::internal(Arc::new(InternalProc {
            kind,
            name: Arc::from(name.as_str()),
            body,
            event_loop: Arc::downgrade(self.shared),
            loop_id: self.shared.id,
        }))
    }

    /// Invokes an external callable from the event scope.
    ///
    /// The call is enqueued for the waiting external thread and executed
    /// there, outside the mutex; `completion`, when given, is invoked back in
    /// the event scope with the callable's result.
    pub fn call_external(
        &mut self,
        callable: &Value,
        args: CallArgs,
        completion: Option<Value>,
    ) -> Result<()> {
        let proc = match callable {
            Value::Proc(p) => p,
            Value::External(x) => {
                return Err(Error::invalid_access(format!(
                    "external object `{}' is invoked with send, not call_external",
                    x.name().unwrap_or("?")
                )))
            }
            other => {
                return Err(Error::invalid_access(format!(
                    "{} value is not callable",
                    other.kind_name()
                )))
            }
        };
        let native = match &proc.inner {
            ProcInner::External(x) => {
                if x.for_loop != self.shared.id {
                    return Err(Error::invalid_access(format!(
                        "external proc `{}' belongs to a different event scope",
                        x.name
                    )));
                }
                x.native.clone()
            }
            ProcInner::Native(_) => {
                return Err(Error::invalid_access(
                    "plain block must be wrapped before it can leave the event scope",
                ))
            }
            ProcInner::Internal(_) | ProcInner::Completion(_) => {
                return Err(Error::invalid_access(
                    "proc is event-scope-bound; use invoke_in_scope",
                ))
            }
        };
        let request = wrapped::build_callback_request(
            self,
            CallbackTarget::Proc(native),
            args,
            completion,
        )?;
        self.route_callback(request, None)
    }

    /// Routes a callback request to the thread that will execute it: the
    /// latest answer queue if one is being serviced, else the fallback queue
    /// (an external object's creation queue or call context) if still open.
    pub(crate) fn route_callback(
        &mut self,
        request: CallbackRequest,
        fallback: Option<&AnswerQueueRef>,
    ) -> Result<()> {
        if let Some(LatestCall {
            queue: Some(queue), ..
        }) = self.latest.as_ref()
        {
            if queue.is_open() {
                return queue.push_callback(request);
            }
        }
        if let Some(queue) = fallback {
            if queue.is_open() {
                return queue.push_callback(request);
            }
        }
        Err(Error::invalid_access(
            "no external thread is waiting to execute the callback",
        ))
    }

    /// Non-blocking shutdown from inside the event scope. Outstanding
    /// actions are aborted; `completion`, when given, fires after all of
    /// them have terminated.
    pub fn shutdown(&mut self, completion: Option<Value>) -> Result<()> {
        if let Some(c) = &completion {
            if !matches!(c, Value::Proc(_)) {
                return Err(Error::invalid_access(
                    "shutdown completion must be a proc",
                ));
            }
        }
        self.shared.shutdown.store(true, Ordering::SeqCst);
        for action in self.actions.snapshot() {
            action.abort();
        }
        if let Some(c) = completion {
            if self.actions.is_empty() {
                // still inside the scope: fire from an external thread
                std::thread::spawn(move || fire_shutdown_waiters(vec![c]));
            } else {
                self.shutdown_waiters.push(c);
            }
        }
        Ok(())
    }

    /// Starts a worker for an action body and registers it in the running
    /// set.
    pub(crate) fn spawn_action(&mut self, name: Arc<str>, body: ActionBody) -> Action {
        if self.shared.gc_actions {
            // advisory hint: drop dead shared-object tags before taking on
            // more workers
            registry::sweep();
        }
        let (handoff_tx, handoff_rx) = crossbeam::channel::bounded::<Action>(1);
        let work: WorkFn = Box::new(move |signals| {
            if let Ok(action) = handoff_rx.recv() {
                run_action(action, signals.clone(), body);
            }
        });
        let worker = self.shared.pool.start(&name, work);
        let action = Action::new(name, worker, Arc::downgrade(self.shared));
        self.actions.insert(action.clone());
        *self.shared.snapshot.lock() = Arc::new(self.actions.snapshot());
        let _ = handoff_tx.send(action.clone());
        action
    }
}

// ---------------------------------------------------------------------------
// scope entry

/// Runs `f` inside the event scope of `shared`.
///
/// Acquires the mutex, stamps the clock, installs (queue, name) as the
/// latest call, and on the way out restores the previous latest call,
/// releases the mutex, flushes deferred completion deliveries and invokes
/// the guard-time observer.
fn enter<R>(
    shared: &Arc<LoopShared>,
    call_name: &Arc<str>,
    queue: Option<AnswerQueueRef>,
    f: impl FnOnce(&mut dyn Boxable, &mut EventScope<'_>) -> Result<R>,
) -> Result<R> {
    if shared.is_event_scope() {
        return Err(Error::invalid_access(format!(
            "`{}' called through the external surface from its own event scope; \
             event-scope code calls its methods directly",
            call_name
        )));
    }

    // an async call re-entering from an open callback loop donates that
    // call's queue, so its body can still reach external procs
    let latest_queue = match queue {
        Some(q) => Some(q),
        None => inherited_open_queue(shared.id),
    };

    let elapsed;
    let result;
    let deferred: Vec<(AnswerQueueRef, AnswerItem)>;
    {
        let mut guard = shared.core.lock();
        shared
            .owner
            .store(current_thread_token(), Ordering::SeqCst);
        SCOPE_STACK.with(|s| s.borrow_mut().push(shared.id));
        let start = Instant::now();
        let prev_latest = guard.latest.replace(LatestCall {
            queue: latest_queue,
            name: call_name.clone(),
        });

        result = {
            let core = &mut *guard;
            let mut scope = EventScope {
                shared,
                latest: &mut core.latest,
                actions: &mut core.actions,
                shutdown_waiters: &mut core.shutdown_waiters,
            };
            f(core.state.as_mut(), &mut scope)
        };

        guard.latest = prev_latest;
        elapsed = start.elapsed();
        // snapshot this execution's deferred deliveries before the next
        // entrant can add its own
        deferred = shared.deferred.lock().drain(..).collect();
        SCOPE_STACK.with(|s| {
            s.borrow_mut().pop();
        });
        shared.owner.store(0, Ordering::SeqCst);
    }

    // completions become observable only now, at the mutex release
    for (queue, item) in deferred {
        if let Err(e) = queue.push_terminal(item) {
            tracing::error!(
                queue = %queue.name(),
                error = %e,
                "deferred completion could not be delivered"
            );
        }
    }
    shared.guard.observe(elapsed, call_name);
    result
}

// ---------------------------------------------------------------------------
// argument sanitisation

type SanitizedArgs = (Vec<Value>, Vec<(Arc<str>, Value)>, Option<Value>);

fn sanitize_call_args(
    shared: &Arc<LoopShared>,
    plan: &crate::boxable::ArgPlan,
    args: CallArgs,
    queue: Option<&AnswerQueueRef>,
) -> Result<SanitizedArgs> {
    let mut positional = Vec::with_capacity(args.args.len());
    for (index, value) in args.args.iter().enumerate() {
        positional.push(if plan.arg_is_shared(index) {
            sanitizer::sanitize_shared_in(value, shared, queue)?
        } else {
            sanitizer::sanitize_in(value, shared, queue)?
        });
    }
    let mut kwargs = Vec::with_capacity(args.kwargs.len());
    for (name, value) in args.kwargs.iter() {
        let v = if plan.kwarg_is_shared(name) {
            sanitizer::sanitize_shared_in(value, shared, queue)?
        } else {
            sanitizer::sanitize_in(value, shared, queue)?
        };
        kwargs.push((name.clone(), v));
    }
    let block = match &args.block {
        Some(b) if plan.block_is_shared() => Some(sanitizer::sanitize_shared_in(b, shared, queue)?),
        Some(b) => Some(sanitizer::sanitize_in(b, shared, queue)?),
        None => None,
    };
    Ok((positional, kwargs, block))
}

fn sanitize_proc_args(
    shared: &Arc<LoopShared>,
    args: CallArgs,
    queue: Option<&AnswerQueueRef>,
) -> Result<SanitizedArgs> {
    let plan = crate::boxable::ArgPlan::default();
    sanitize_call_args(shared, &plan, args, queue)
}

/// Sanitises a user exception payload on its way out of the scope.
fn sanitize_error_out(error: Error, shared: &Arc<LoopShared>) -> Error {
    match error {
        Error::Raised(v) => match sanitizer::sanitize_out(&v, shared) {
            Ok(v) => Error::Raised(v),
            Err(e) => e,
        },
        other => other,
    }
}

// ---------------------------------------------------------------------------
// external call paths

fn find_kind(shared: &Arc<LoopShared>, name: &str, kind: CallKind) -> Result<crate::boxable::ArgPlan> {
    let op = shared.interface.find(name).ok_or_else(|| {
        Error::invalid_access(format!("`{name}' is not a declared operation"))
    })?;
    if op.kind != kind {
        return Err(Error::invalid_access(format!(
            "`{name}' is declared {:?}, not {:?}",
            op.kind, kind
        )));
    }
    Ok(op.plan.clone())
}

pub(crate) fn registered_kind(shared: &Arc<LoopShared>, name: &str) -> Result<CallKind> {
    shared
        .interface
        .find(name)
        .map(|op| op.kind)
        .ok_or_else(|| Error::invalid_access(format!("`{name}' is not a declared operation")))
}

/// Async external call: the body runs under the mutex on this thread, the
/// result is discarded.
pub(crate) fn call_async(shared: &Arc<LoopShared>, name: Arc<str>, args: CallArgs) -> Result<()> {
    let plan = find_kind(shared, &name, CallKind::Async)?;
    enter(shared, &name, None, |state, scope| {
        let queue = scope.latest.as_ref().and_then(|l| l.queue.clone());
        let (a, k, b) = sanitize_call_args(scope.shared(), &plan, args, queue.as_ref())?;
        let call = MethodCall {
            name: name.clone(),
            args: a,
            kwargs: k,
            block: b,
            completion: None,
        };
        match state.dispatch(scope, call)? {
            Dispatch::Value(_) => Ok(()),
            Dispatch::Pending => Err(Error::invalid_access(format!(
                "async operation `{name}' returned Pending"
            ))),
            Dispatch::Action(_) => Err(Error::invalid_access(format!(
                "async operation `{name}' produced an action body"
            ))),
        }
    })
}

/// Sync external call: blocks the caller on the answer queue until the body
/// returns; the result crosses the boundary sanitised.
pub(crate) fn call_sync(shared: &Arc<LoopShared>, name: Arc<str>, args: CallArgs) -> Result<Value> {
    let plan = find_kind(shared, &name, CallKind::Sync)?;
    let queue = AnswerQueue::new(name.clone(), shared.id);
    let entered = enter(shared, &name, Some(queue.clone()), |state, scope| {
        let (a, k, b) = sanitize_call_args(scope.shared(), &plan, args, Some(&queue))?;
        let call = MethodCall {
            name: name.clone(),
            args: a,
            kwargs: k,
            block: b,
            completion: None,
        };
        match state.dispatch(scope, call) {
            Ok(Dispatch::Value(v)) => {
                let out = sanitizer::sanitize_out(&v, scope.shared())?;
                queue.push_terminal(AnswerItem::Result(out))
            }
            Ok(Dispatch::Pending) => Err(Error::invalid_access(format!(
                "sync operation `{name}' returned Pending"
            ))),
            Ok(Dispatch::Action(_)) => Err(Error::invalid_access(format!(
                "sync operation `{name}' produced an action body"
            ))),
            Err(e) => {
                let e = sanitize_error_out(e, scope.shared());
                queue.push_terminal(AnswerItem::Exception(e))
            }
        }
    });
    entered?;
    callback_loop(&queue)
}

/// Yield external call: blocks the caller until the completion handle fires.
pub(crate) fn call_yield(shared: &Arc<LoopShared>, name: Arc<str>, args: CallArgs) -> Result<Value> {
    let plan = find_kind(shared, &name, CallKind::Yield)?;
    let queue = AnswerQueue::new(name.clone(), shared.id);
    let completion = Completion::new(name.clone(), queue.clone(), Arc::downgrade(shared));

    // the closure owns its completion and queue clones, so that when the
    // body neither fires nor stores the handle, the last clone dies with the
    // closure and the abandoned-call diagnostic reaches the caller instead
    // of a hang
    let body_completion = completion.clone();
    let body_queue = queue.clone();
    let call_name = name.clone();
    let entered = enter(shared, &name, Some(queue.clone()), move |state, scope| {
        let (a, k, b) = sanitize_call_args(scope.shared(), &plan, args, Some(&body_queue))?;
        let call = MethodCall {
            name: call_name.clone(),
            args: a,
            kwargs: k,
            block: b,
            completion: Some(body_completion.clone()),
        };
        match state.dispatch(scope, call) {
            // the yield body's own return value is discarded
            Ok(Dispatch::Value(_)) | Ok(Dispatch::Pending) => Ok(()),
            Ok(Dispatch::Action(_)) => Err(Error::invalid_access(format!(
                "yield operation `{call_name}' produced an action body"
            ))),
            Err(e) => {
                if body_completion.is_fired() {
                    tracing::error!(
                        operation = %call_name,
                        error = %e,
                        "yield body failed after completing"
                    );
                    Ok(())
                } else {
                    let e = sanitize_error_out(e, scope.shared());
                    body_completion.raise_error(e)
                }
            }
        }
    });
    drop(completion);
    entered?;
    callback_loop(&queue)
}

/// Action external call: the body built by dispatch is started on a worker.
pub(crate) fn start_action(
    shared: &Arc<LoopShared>,
    name: Arc<str>,
    args: CallArgs,
) -> Result<Action> {
    let plan = find_kind(shared, &name, CallKind::Action)?;
    enter(shared, &name, None, |state, scope| {
        if scope.shared().is_shutdown() {
            return Err(Error::invalid_access(format!(
                "cannot start action `{name}' during shutdown"
            )));
        }
        let queue = scope.latest.as_ref().and_then(|l| l.queue.clone());
        let (a, k, b) = sanitize_call_args(scope.shared(), &plan, args, queue.as_ref())?;
        let call = MethodCall {
            name: name.clone(),
            args: a,
            kwargs: k,
            block: b,
            completion: None,
        };
        match state.dispatch(scope, call)? {
            Dispatch::Action(body) => Ok(scope.spawn_action(name.clone(), body)),
            Dispatch::Value(_) | Dispatch::Pending => Err(Error::invalid_access(format!(
                "action operation `{name}' must produce an action body"
            ))),
        }
    })
}

/// External invocation of an internal proc: behaves like the call kind of
/// the same name.
pub(crate) fn call_internal_proc(p: &Arc<InternalProc>, args: CallArgs) -> Result<Value> {
    let shared = p
        .event_loop
        .upgrade()
        .ok_or_else(|| Error::invalid_access("the proc's event loop has been finalised"))?;
    match p.kind {
        ProcKind::Async => {
            let body = p.body.clone();
            enter(&shared, &p.name, None, |state, scope| {
                let queue = scope.latest.as_ref().and_then(|l| l.queue.clone());
                let (a, k, b) = sanitize_proc_args(scope.shared(), args, queue.as_ref())?;
                body(
                    state,
                    scope,
                    ProcArgs {
                        args: a,
                        kwargs: k,
                        block: b,
                        completion: None,
                    },
                )
                .map(|_| ())
            })?;
            Ok(Value::Instance(Eventbox::from_shared(shared)))
        }
        ProcKind::Sync => {
            let queue = AnswerQueue::new(p.name.clone(), shared.id);
            let body = p.body.clone();
            let entered = enter(&shared, &p.name, Some(queue.clone()), |state, scope| {
                let (a, k, b) = sanitize_proc_args(scope.shared(), args, Some(&queue))?;
                let result = body(
                    state,
                    scope,
                    ProcArgs {
                        args: a,
                        kwargs: k,
                        block: b,
                        completion: None,
                    },
                );
                match result {
                    Ok(v) => {
                        let out = sanitizer::sanitize_out(&v, scope.shared())?;
                        queue.push_terminal(AnswerItem::Result(out))
                    }
                    Err(e) => {
                        let e = sanitize_error_out(e, scope.shared());
                        queue.push_terminal(AnswerItem::Exception(e))
                    }
                }
            });
            entered?;
            callback_loop(&queue)
        }
        ProcKind::Yield => {
            let queue = AnswerQueue::new(p.name.clone(), shared.id);
            let completion = Completion::new(p.name.clone(), queue.clone(), Arc::downgrade(&shared));
            let body_completion = completion.clone();
            let body_queue = queue.clone();
            let body = p.body.clone();
            let name = p.name.clone();
            let entered = enter(&shared, &p.name, Some(queue.clone()), move |state, scope| {
                let (a, k, b) = sanitize_proc_args(scope.shared(), args, Some(&body_queue))?;
                let result = body(
                    state,
                    scope,
                    ProcArgs {
                        args: a,
                        kwargs: k,
                        block: b,
                        completion: Some(body_completion.clone()),
                    },
                );
                match result {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        if body_completion.is_fired() {
                            tracing::error!(
                                proc = %name,
                                error = %e,
                                "yield proc failed after completing"
                            );
                            Ok(())
                        } else {
                            let e = sanitize_error_out(e, scope.shared());
                            body_completion.raise_error(e).map(|_| ())
                        }
                    }
                }
            });
            drop(completion);
            entered?;
            callback_loop(&queue)
        }
    }
}

// ---------------------------------------------------------------------------
// completion delivery

/// Delivers a completion result to its answer queue.
///
/// Fired inside the owning event scope, delivery is deferred to the mutex
/// release; fired anywhere else, the payload makes the same inward/outward
/// crossing an async invocation would have given it.
pub(crate) fn deliver_completion(inner: &CompletionInner, item: AnswerItem) -> Result<()> {
    match inner.event_loop.upgrade() {
        Some(shared) => {
            if shared.is_event_scope() {
                let item = sanitize_item_out(item, &shared)?;
                shared.deferred.lock().push((inner.queue.clone(), item));
                Ok(())
            } else {
                let item = match item {
                    AnswerItem::Result(v) => {
                        let v = sanitizer::sanitize_in(&v, &shared, Some(&inner.queue))?;
                        AnswerItem::Result(sanitizer::sanitize_out(&v, &shared)?)
                    }
                    AnswerItem::Exception(Error::Raised(v)) => {
                        let v = sanitizer::sanitize_in(&v, &shared, Some(&inner.queue))?;
                        AnswerItem::Exception(Error::Raised(sanitizer::sanitize_out(
                            &v, &shared,
                        )?))
                    }
                    other => other,
                };
                inner.queue.push_terminal(item)
            }
        }
        None => inner.queue.push_terminal(item),
    }
}

fn sanitize_item_out(item: AnswerItem, shared: &Arc<LoopShared>) -> Result<AnswerItem> {
    Ok(match item {
        AnswerItem::Result(v) => AnswerItem::Result(sanitizer::sanitize_out(&v, shared)?),
        AnswerItem::Exception(e) => AnswerItem::Exception(sanitize_error_out(e, shared)),
        callback @ AnswerItem::Callback(_) => callback,
    })
}

// ---------------------------------------------------------------------------
// callback loop

/// Drives the answer queue of a suspended sync/yield call: executes callback
/// requests outside any mutex and returns on the terminal item.
pub(crate) fn callback_loop(queue: &AnswerQueueRef) -> Result<Value> {
    let _open = OpenQueueGuard::push(queue.clone());
    loop {
        match queue.pop_blocking() {
            AnswerItem::Callback(request) => execute_callback(request),
            AnswerItem::Result(v) => {
                let leftovers = queue.close();
                diagnose_leftovers(queue.name(), leftovers);
                return Ok(v);
            }
            AnswerItem::Exception(e) => {
                let leftovers = queue.close();
                diagnose_leftovers(queue.name(), leftovers);
                return Err(e);
            }
        }
    }
}

/// Executes one callback request on the current (external) thread.
pub(crate) fn execute_callback(request: CallbackRequest) {
    let CallbackRequest {
        target,
        args,
        kwargs,
        completion,
    } = request;
    let result = match target {
        CallbackTarget::Proc(native) => native(CallArgs {
            args,
            kwargs,
            block: None,
        }),
        CallbackTarget::Send { object, method } => {
            wrapped::external_send(&object, &method, &args)
        }
    };
    match (result, completion) {
        (Ok(value), Some(Value::Proc(p))) => {
            // re-enter the loop with the result; the proc runs in event scope
            if let Err(e) = p.call(CallArgs::positional(vec![value])) {
                tracing::error!(error = %e, "callback completion failed");
            }
        }
        (Ok(_), _) => {}
        (Err(e), _) => {
            tracing::error!(error = %e, "external callback failed");
        }
    }
}

/// Removes a terminated action from the running set and fires shutdown
/// completions once the set drains.
pub(crate) fn finalize_action(shared: &Arc<LoopShared>, action: &Action) {
    let waiters = {
        let mut core = shared.core.lock();
        core.actions.remove_action(action);
        *shared.snapshot.lock() = Arc::new(core.actions.snapshot());
        if core.actions.is_empty() {
            std::mem::take(&mut core.shutdown_waiters)
        } else {
            Vec::new()
        }
    };
    fire_shutdown_waiters(waiters);
}

fn fire_shutdown_waiters(waiters: Vec<Value>) {
    for waiter in waiters {
        if let Value::Proc(p) = waiter {
            if let Err(e) = p.call(CallArgs::new()) {
                tracing::error!(error = %e, "shutdown completion failed");
            }
        }
    }
}

/// External blocking shutdown: aborts every running action and joins them.
pub(crate) fn shutdown_and_wait(shared: &Arc<LoopShared>) -> Result<()> {
    if shared.is_event_scope() {
        return Err(Error::invalid_access(
            "blocking shutdown from the event scope; use EventScope::shutdown",
        ));
    }
    let snapshot = {
        let core = shared.core.lock();
        shared.shutdown.store(true, Ordering::SeqCst);
        core.actions.snapshot()
    };
    for action in &snapshot {
        action.abort();
    }
    for action in &snapshot {
        action.join();
    }
    Ok(())
}
