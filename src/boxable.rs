//! Operation declaration and call dispatch.
//!
//! A user type becomes thread-safe by implementing [`Boxable`]: it declares
//! each public operation as async, sync, yield or action in its
//! [`Interface`], and routes invocations through `dispatch`, which only ever
//! runs inside the event scope. Argument positions that should cross the
//! boundary by reference instead of by copy are declared in the operation's
//! [`ArgPlan`].

use std::any::Any;
use std::sync::Arc;

use crate::action::ActionScope;
use crate::error::Result;
use crate::event_loop::EventScope;
use crate::procs::Completion;
use crate::value::Value;

/// The call-kind taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Returns the instance immediately; the body's result is discarded.
    Async,
    /// The caller blocks until the body returns; the result crosses back.
    Sync,
    /// The caller blocks until the body's completion handle is invoked.
    Yield,
    /// The body runs on a worker thread; the caller gets an [`crate::Action`].
    Action,
}

/// Which argument slots are shared-object-wrapped on entry instead of being
/// sanitised by copy.
#[derive(Debug, Clone, Default)]
pub struct ArgPlan {
    shared_args: Vec<usize>,
    shared_rest_from: Option<usize>,
    shared_kwargs: Vec<&'static str>,
    shared_kwargs_rest: bool,
    shared_block: bool,
}

impl ArgPlan {
    pub fn new() -> Self {
        ArgPlan::default()
    }

    /// Marks one positional slot.
    pub fn shared_arg(mut self, index: usize) -> Self {
        self.shared_args.push(index);
        self
    }

    /// Marks every positional slot starting at `from` (variadic tail).
    pub fn shared_rest(mut self, from: usize) -> Self {
        self.shared_rest_from = Some(from);
        self
    }

    pub fn shared_kwarg(mut self, name: &'static str) -> Self {
        self.shared_kwargs.push(name);
        self
    }

    /// Marks every keyword argument not named explicitly.
    pub fn shared_kwargs_rest(mut self) -> Self {
        self.shared_kwargs_rest = true;
        self
    }

    pub fn shared_block(mut self) -> Self {
        self.shared_block = true;
        self
    }

    pub(crate) fn arg_is_shared(&self, index: usize) -> bool {
        self.shared_args.contains(&index)
            || self.shared_rest_from.map_or(false, |from| index >= from)
    }

    pub(crate) fn kwarg_is_shared(&self, name: &str) -> bool {
        self.shared_kwargs_rest || self.shared_kwargs.iter().any(|n| *n == name)
    }

    pub(crate) fn block_is_shared(&self) -> bool {
        self.shared_block
    }
}

/// One declared operation.
#[derive(Debug, Clone)]
pub struct OperationDef {
    pub name: &'static str,
    pub kind: CallKind,
    pub plan: ArgPlan,
}

impl OperationDef {
    pub fn async_call(name: &'static str) -> Self {
        OperationDef {
            name,
            kind: CallKind::Async,
            plan: ArgPlan::default(),
        }
    }

    pub fn sync_call(name: &'static str) -> Self {
        OperationDef {
            name,
            kind: CallKind::Sync,
            plan: ArgPlan::default(),
        }
    }

    pub fn yield_call(name: &'static str) -> Self {
        OperationDef {
            name,
            kind: CallKind::Yield,
            plan: ArgPlan::default(),
        }
    }

    pub fn action(name: &'static str) -> Self {
        OperationDef {
            name,
            kind: CallKind::Action,
            plan: ArgPlan::default(),
        }
    }

    pub fn with_plan(mut self, plan: ArgPlan) -> Self {
        self.plan = plan;
        self
    }
}

/// The declared public surface of a boxable type.
#[derive(Debug, Clone, Default)]
pub struct Interface {
    ops: Vec<OperationDef>,
}

impl Interface {
    pub fn new() -> Self {
        Interface { ops: Vec::new() }
    }

    /// Adds one operation. Duplicate names are a declaration error.
    pub fn op(mut self, def: OperationDef) -> Self {
        assert!(
            self.ops.iter().all(|o| o.name != def.name),
            "operation `{}' declared twice",
            def.name
        );
        self.ops.push(def);
        self
    }

    pub fn find(&self, name: &str) -> Option<&OperationDef> {
        self.ops.iter().find(|o| o.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.ops.iter().map(|o| o.name)
    }
}

/// Argument bundle for the external call surface.
#[derive(Default)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: Vec<(Arc<str>, Value)>,
    pub block: Option<Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        CallArgs::default()
    }

    pub fn positional(args: Vec<Value>) -> Self {
        CallArgs {
            args,
            kwargs: Vec::new(),
            block: None,
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<Arc<str>>, value: impl Into<Value>) -> Self {
        self.kwargs.push((name.into(), value.into()));
        self
    }

    pub fn block(mut self, block: impl Into<Value>) -> Self {
        self.block = Some(block.into());
        self
    }
}

/// A dispatched invocation as seen by the body, with every value already
/// sanitised into the event scope.
pub struct MethodCall {
    pub name: Arc<str>,
    pub args: Vec<Value>,
    pub kwargs: Vec<(Arc<str>, Value)>,
    pub block: Option<Value>,
    /// The completion handle of a yield call.
    pub completion: Option<Completion>,
}

impl MethodCall {
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

    /// Takes the completion handle out of the call.
    pub fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }
}

/// Body of an action, run on a worker thread outside the event scope.
///
/// The closure is built inside `dispatch`, so it can capture sanitised
/// argument values, but never `&mut` state: the only way back to the
/// instance is through `ActionScope::eventbox` and the public call surface.
pub type ActionBody = Box<dyn FnOnce(&ActionScope) -> Result<()> + Send + 'static>;

/// Outcome of one dispatched body.
pub enum Dispatch {
    /// Sync result / ignored async result.
    Value(Value),
    /// Yield body returned; the completion handle will deliver.
    Pending,
    /// Action body to start on a worker.
    Action(ActionBody),
}

impl Dispatch {
    pub fn value(v: impl Into<Value>) -> Self {
        Dispatch::Value(v.into())
    }

    pub fn nil() -> Self {
        Dispatch::Value(Value::Nil)
    }

    pub fn action<F>(body: F) -> Self
    where
        F: FnOnce(&ActionScope) -> Result<()> + Send + 'static,
    {
        Dispatch::Action(Box::new(body))
    }
}

/// A user type whose state is confined to one event scope.
///
/// All mutable state lives in the implementing type; `dispatch` is only ever
/// invoked while the current thread holds the instance's event-loop mutex.
pub trait Boxable: Any + Send + 'static {
    /// Declares the public operations. Invoking an undeclared name, or a
    /// declared name through the wrong entry point, fails with
    /// `InvalidAccess` before `dispatch` is reached.
    fn interface() -> Interface
    where
        Self: Sized;

    /// Runs one operation body in event scope.
    fn dispatch(&mut self, scope: &mut EventScope<'_>, call: MethodCall) -> Result<Dispatch>;
}

impl dyn Boxable {
    /// Downcast access for proc bodies.
    pub fn downcast_mut<T: Boxable>(&mut self) -> Option<&mut T> {
        let any: &mut dyn Any = self;
        any.downcast_mut::<T>()
    }

    pub fn downcast_ref<T: Boxable>(&self) -> Option<&T> {
        let any: &dyn Any = self;
        any.downcast_ref::<T>()
    }
}
