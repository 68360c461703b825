#![forbid(unsafe_code)]

//! Thread-safe objects by event-scope confinement.
//!
//! An eventbox confines all mutable state and event-handling code of one
//! object to a single-threaded *event scope*, established by the instance's
//! mutex, while exposing a thread-safe call surface to the outside world.
//! Every value crossing the boundary passes the sanitizer and comes out as
//! itself, a deep copy, or a wrapper, so no data race can reach the confined
//! state. Long-running or blocking work runs in *actions* on dedicated or
//! pooled threads, with cooperative, window-scoped interruption.
//!
//! Operations on an instance are declared with one of four kinds:
//!
//! - **async**: returns the instance immediately, the body runs serialised;
//! - **sync**: the caller blocks until the body's result crosses back;
//! - **yield**: the caller blocks until the body's one-shot completion
//!   handle is invoked or raised;
//! - **action**: the body runs on a worker thread outside the scope.
//!
//! While a sync/yield caller is suspended it drives a callback loop: the
//! event scope can call external procs and objects, and those callbacks
//! execute on the waiting caller's thread, outside the mutex, on the side of
//! the boundary that owns them.
//!
//! # Example
//!
//! ```
//! use eventbox::{
//!     Boxable, CallArgs, Dispatch, Error, EventScope, Eventbox, Interface,
//!     MethodCall, OperationDef, Result, Value,
//! };
//!
//! #[derive(Default)]
//! struct Counter {
//!     count: i64,
//! }
//!
//! impl Boxable for Counter {
//!     fn interface() -> Interface {
//!         Interface::new().op(OperationDef::sync_call("incr"))
//!     }
//!
//!     fn dispatch(
//!         &mut self,
//!         _scope: &mut EventScope<'_>,
//!         call: MethodCall,
//!     ) -> Result<Dispatch> {
//!         match call.name.as_ref() {
//!             "incr" => {
//!                 self.count += 1;
//!                 Ok(Dispatch::value(self.count))
//!             }
//!             other => Err(Error::invalid_access(format!("unknown operation `{other}'"))),
//!         }
//!     }
//! }
//!
//! let counter = Eventbox::new(Counter::default());
//! // callable concurrently from any number of threads
//! assert_eq!(
//!     counter.call_sync("incr", CallArgs::new()).unwrap(),
//!     Value::Int(1),
//! );
//! ```

mod action;
mod answer_queue;
mod boxable;
mod call_context;
mod error;
mod event_loop;
mod eventbox;
mod pool;
mod procs;
mod registry;
mod sanitizer;
mod value;
mod wrapped;

pub use action::{Action, ActionScope};
pub use boxable::{
    ActionBody, ArgPlan, Boxable, CallArgs, CallKind, Dispatch, Interface, MethodCall,
    OperationDef,
};
pub use call_context::CallContext;
pub use error::{Error, Result};
pub use event_loop::{EventScope, GuardTime};
pub use eventbox::{Eventbox, Options, Reply};
pub use pool::{PoolOptions, PoolTicket, ThreadPolicy, ThreadPool};
pub use procs::{Completion, NativeFn, Proc, ProcArgs, ProcKind, ScopeFn};
pub use registry::LoopId;
pub use value::{Cell, OpaqueRef, RecordData, SendHandler, Value};
pub use wrapped::{ExternalObject, WrappedObject};

#[cfg(test)]
mod tests;
