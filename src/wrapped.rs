//! Object wrappers.
//!
//! A `WrappedObject` is an event-scope value travelling outside; an
//! `ExternalObject` is an external value travelling inside. Both are opaque
//! envelopes in the foreign scope and unwrap to their payload only when they
//! cross back into the scope that owns it. The external object additionally
//! carries the asynchronous `send` primitive: the event scope may request a
//! method invocation that is then executed by a waiting external thread, on
//! the side of the boundary where the payload may be touched.

use std::fmt;
use std::sync::Arc;

use crate::answer_queue::{AnswerQueueRef, CallbackRequest, CallbackTarget};
use crate::boxable::CallArgs;
use crate::error::{Error, Result};
use crate::event_loop::EventScope;
use crate::procs::ProcInner;
use crate::registry::{LoopId, ScopeId};
use crate::sanitizer;
use crate::value::Value;

struct WrappedInner {
    payload: Value,
    owner: ScopeId,
    name: Option<Arc<str>>,
}

/// Envelope around a value that must not be touched outside its owning scope.
#[derive(Clone)]
pub struct WrappedObject {
    inner: Arc<WrappedInner>,
}

impl WrappedObject {
    pub(crate) fn new(payload: Value, owner: ScopeId, name: Option<Arc<str>>) -> Self {
        WrappedObject {
            inner: Arc::new(WrappedInner {
                payload,
                owner,
                name,
            }),
        }
    }

    pub(crate) fn owner(&self) -> ScopeId {
        self.inner.owner
    }

    pub(crate) fn payload(&self) -> Value {
        self.inner.payload.clone()
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl fmt::Debug for WrappedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WrappedObject({}, owner: {:?})",
            self.name().unwrap_or("?"),
            self.inner.owner
        )
    }
}

struct ExternalInner {
    payload: Value,
    for_loop: LoopId,
    /// Latest answer queue at creation time; fallback route for `send`.
    creation_queue: Option<AnswerQueueRef>,
    name: Option<Arc<str>>,
}

/// Envelope around an external value inside an event scope.
#[derive(Clone)]
pub struct ExternalObject {
    inner: Arc<ExternalInner>,
}

impl ExternalObject {
    pub(crate) fn new(
        payload: Value,
        for_loop: LoopId,
        creation_queue: Option<AnswerQueueRef>,
        name: Option<Arc<str>>,
    ) -> Self {
        ExternalObject {
            inner: Arc::new(ExternalInner {
                payload,
                for_loop,
                creation_queue,
                name,
            }),
        }
    }

    pub(crate) fn payload(&self) -> Value {
        self.inner.payload.clone()
    }

    pub(crate) fn for_loop(&self) -> LoopId {
        self.inner.for_loop
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Requests `method` on the payload, executed by a waiting external
    /// thread. Usable only from the owning event scope.
    ///
    /// The request is routed to the answer queue of the call currently being
    /// serviced, or to this wrapper's creation queue — the latest call or
    /// call context it was created under — if that is still open.
    pub fn send(
        &self,
        scope: &mut EventScope<'_>,
        method: &str,
        args: CallArgs,
        completion: Option<Value>,
    ) -> Result<()> {
        if scope.loop_id() != self.for_loop() {
            return Err(Error::invalid_access(format!(
                "external object `{}' belongs to a different event scope",
                self.name().unwrap_or("?")
            )));
        }
        let request = build_callback_request(
            scope,
            CallbackTarget::Send {
                object: self.inner.payload.clone(),
                method: Arc::from(method),
            },
            args,
            completion,
        )?;
        scope.route_callback(request, self.inner.creation_queue.as_ref())
    }
}

impl fmt::Debug for ExternalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ExternalObject({}, kind: {})",
            self.name().unwrap_or("?"),
            self.inner.payload.kind_name()
        )
    }
}

/// Sanitises an outbound argument bundle into a callback request.
///
/// A plain in-scope closure as the block of an outbound call is rejected: the
/// library cannot know which scope would end up invoking it.
pub(crate) fn build_callback_request(
    scope: &EventScope<'_>,
    target: CallbackTarget,
    args: CallArgs,
    completion: Option<Value>,
) -> Result<CallbackRequest> {
    if let Some(Value::Proc(p)) = &args.block {
        if matches!(p.inner, ProcInner::Native(_)) {
            return Err(Error::invalid_access(
                "block of an external call would be invokable from either scope; \
                 wrap it with async_proc/sync_proc/yield_proc",
            ));
        }
    }
    let shared = scope.shared();
    let mut out_args = Vec::with_capacity(args.args.len());
    for v in &args.args {
        out_args.push(sanitizer::sanitize_out(v, shared)?);
    }
    let mut out_kwargs = Vec::with_capacity(args.kwargs.len());
    for (name, v) in &args.kwargs {
        out_kwargs.push((name.clone(), sanitizer::sanitize_out(v, shared)?));
    }
    let completion = match completion {
        Some(v) => {
            let v = sanitizer::sanitize_out(&v, shared)?;
            if !matches!(v, Value::Proc(_)) {
                return Err(Error::invalid_access(
                    "completion of an external call must be a proc",
                ));
            }
            Some(v)
        }
        None => None,
    };
    Ok(CallbackRequest {
        target,
        args: out_args,
        kwargs: out_kwargs,
        completion,
    })
}

/// Executes a `send`-requested method on an external payload.
///
/// Runs on the external thread that owns the payload; this is the only place
/// the library touches an externally owned mutable value.
pub(crate) fn external_send(object: &Value, method: &str, args: &[Value]) -> Result<Value> {
    let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Nil);
    match object {
        Value::List(cell) => match method {
            "push" => {
                cell.lock().push(arg(0));
                Ok(Value::Nil)
            }
            "pop" => Ok(cell.lock().pop().unwrap_or(Value::Nil)),
            "shift" => {
                let mut items = cell.lock();
                if items.is_empty() {
                    Ok(Value::Nil)
                } else {
                    Ok(items.remove(0))
                }
            }
            "len" => Ok(Value::Int(cell.lock().len() as i64)),
            "get" => {
                let idx = arg(0).as_int().unwrap_or(0) as usize;
                Ok(cell.lock().get(idx).cloned().unwrap_or(Value::Nil))
            }
            "set" => {
                let idx = arg(0).as_int().unwrap_or(0) as usize;
                let mut items = cell.lock();
                if idx < items.len() {
                    items[idx] = arg(1);
                    Ok(Value::Bool(true))
                } else {
                    Ok(Value::Bool(false))
                }
            }
            "clear" => {
                cell.lock().clear();
                Ok(Value::Nil)
            }
            "contains" => {
                let needle = arg(0);
                Ok(Value::Bool(cell.lock().iter().any(|v| *v == needle)))
            }
            _ => Err(unknown_method("list", method)),
        },
        Value::Map(cell) => match method {
            "insert" => {
                let (k, v) = (arg(0), arg(1));
                let mut pairs = cell.lock();
                if let Some(slot) = pairs.iter_mut().find(|(pk, _)| *pk == k) {
                    let old = std::mem::replace(&mut slot.1, v);
                    Ok(old)
                } else {
                    pairs.push((k, v));
                    Ok(Value::Nil)
                }
            }
            "get" => {
                let k = arg(0);
                Ok(cell
                    .lock()
                    .iter()
                    .find(|(pk, _)| *pk == k)
                    .map(|(_, v)| v.clone())
                    .unwrap_or(Value::Nil))
            }
            "remove" => {
                let k = arg(0);
                let mut pairs = cell.lock();
                match pairs.iter().position(|(pk, _)| *pk == k) {
                    Some(i) => Ok(pairs.remove(i).1),
                    None => Ok(Value::Nil),
                }
            }
            "len" => Ok(Value::Int(cell.lock().len() as i64)),
            "keys" => Ok(Value::list(
                cell.lock().iter().map(|(k, _)| k.clone()).collect(),
            )),
            _ => Err(unknown_method("map", method)),
        },
        Value::Bytes(cell) => match method {
            "append" => {
                match arg(0) {
                    // self-append would lock the same cell twice
                    Value::Bytes(other) if other.same(cell) => {
                        let dup = cell.lock().clone();
                        cell.lock().extend_from_slice(&dup);
                    }
                    Value::Bytes(other) => cell.lock().extend_from_slice(&other.lock()),
                    Value::Str(s) => cell.lock().extend_from_slice(s.as_bytes()),
                    other => {
                        return Err(Error::invalid_access(format!(
                            "cannot append {} to bytes",
                            other.kind_name()
                        )))
                    }
                }
                Ok(Value::Nil)
            }
            "len" => Ok(Value::Int(cell.lock().len() as i64)),
            _ => Err(unknown_method("bytes", method)),
        },
        Value::Record(cell) => match method {
            "get" => {
                let name = arg(0);
                let name = name.as_str().unwrap_or("");
                Ok(cell.lock().get(name).cloned().unwrap_or(Value::Nil))
            }
            "set" => {
                let name = arg(0);
                cell.lock().set(name.as_str().unwrap_or(""), arg(1));
                Ok(Value::Nil)
            }
            "type" => Ok(Value::Str(cell.lock().type_name.clone())),
            _ => Err(unknown_method("record", method)),
        },
        Value::Opaque(opaque) => match opaque.handler() {
            Some(handler) => opaque.with_payload(|payload| handler(payload, method, args)),
            None => Err(Error::invalid_access(format!(
                "external object `{}' has no send handler",
                opaque.name().unwrap_or("?")
            ))),
        },
        Value::Proc(p) => match method {
            "call" => p.call(CallArgs::positional(args.to_vec())),
            _ => Err(unknown_method("proc", method)),
        },
        other => Err(Error::invalid_access(format!(
            "no external methods on {} values",
            other.kind_name()
        ))),
    }
}

fn unknown_method(kind: &str, method: &str) -> Error {
    Error::invalid_access(format!("unknown method `{method}' on external {kind}"))
}
