//! The cross-scope value filter.
//!
//! Every value crossing between an event scope and the external world passes
//! through here and comes out as itself (immutable or internally safe), a
//! deep copy, or a wrapper. After sanitisation no mutable source-scope
//! payload is reachable from the target scope.
//!
//! Decision order, first match wins: scalars pass; wrappers unwrap when
//! coming home, otherwise propagate; internal procs pass; external procs
//! unwrap outward; instances pass; plain callables are wrapped; shared-tagged
//! values are wrapped by reference; everything else is deep-copied, dissected
//! when the copy fails, and shared-tagged as a last resort.

use std::sync::Arc;

use crate::answer_queue::AnswerQueueRef;
use crate::error::{Error, Result};
use crate::event_loop::LoopShared;
use crate::procs::{ExternalProcInner, Proc, ProcInner};
use crate::registry::{self, ScopeId};
use crate::value::{Cell, RecordData, Value};
use crate::wrapped::{ExternalObject, WrappedObject};

/// Sanitises `value` crossing from external scope into the event scope of
/// `target`. The latest answer queue, when present, becomes the creation
/// queue of any external-object wrapper built here.
pub(crate) fn sanitize_in(
    value: &Value,
    target: &Arc<LoopShared>,
    queue: Option<&AnswerQueueRef>,
) -> Result<Value> {
    match value {
        // step 1: immutable scalars
        Value::Nil
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::Sym(_)
        | Value::Str(_) => Ok(value.clone()),
        // step 2: wrappers unwrap only when coming home
        Value::Wrapped(w) => {
            if w.owner() == ScopeId::Loop(target.id()) {
                Ok(w.payload())
            } else {
                Ok(value.clone())
            }
        }
        Value::External(_) => Ok(value.clone()),
        Value::Proc(p) => match &p.inner {
            // step 3: internal procs are loop-bound and internally safe
            ProcInner::Internal(_) | ProcInner::Completion(_) => Ok(value.clone()),
            // step 4: an external proc stays wrapped on the way in
            ProcInner::External(_) => Ok(value.clone()),
            // step 6: a plain callable becomes an external proc
            ProcInner::Native(f) => Ok(Value::Proc(Proc::external(Arc::new(
                ExternalProcInner {
                    native: f.clone(),
                    name: Arc::from("block"),
                    for_loop: target.id(),
                },
            )))),
        },
        // step 5: instances are internally safe
        Value::Instance(_) => Ok(value.clone()),
        _ => sanitize_data_in(value, target, queue),
    }
}

/// Steps 7-10 for data values crossing inward.
fn sanitize_data_in(
    value: &Value,
    target: &Arc<LoopShared>,
    queue: Option<&AnswerQueueRef>,
) -> Result<Value> {
    // step 7: shared-tagged values cross by reference
    match registry::owner_of(value) {
        Some(ScopeId::External) => Ok(wrap_external(value, target, queue)),
        Some(ScopeId::Loop(id)) if id == target.id() => Ok(value.clone()),
        Some(ScopeId::Loop(_)) => Err(Error::invalid_access(format!(
            "{} value is shared by a different event scope",
            value.kind_name()
        ))),
        None => {
            // step 8: deep copy
            if let Ok(copy) = value.deep_copy() {
                return Ok(copy);
            }
            // step 9: dissection
            if let Some(copy) = dissect(value, &mut |child| sanitize_in(child, target, queue))? {
                return Ok(copy);
            }
            // step 10: tag as shared by the source and wrap
            registry::mark(value, ScopeId::External)?;
            Ok(wrap_external(value, target, queue))
        }
    }
}

/// Sanitises `value` crossing out of the event scope of `source`.
pub(crate) fn sanitize_out(value: &Value, source: &Arc<LoopShared>) -> Result<Value> {
    match value {
        Value::Nil
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::Sym(_)
        | Value::Str(_) => Ok(value.clone()),
        Value::Wrapped(_) => Ok(value.clone()),
        Value::External(x) => Ok(x.payload()),
        Value::Proc(p) => match &p.inner {
            ProcInner::Internal(_) | ProcInner::Completion(_) => Ok(value.clone()),
            // coming home: unwrap to the original callable, by identity
            ProcInner::External(x) => Ok(Value::Proc(Proc::from_native_fn(x.native.clone()))),
            // a callable built inside the scope is not invokable outside
            ProcInner::Native(_) => Ok(Value::Wrapped(WrappedObject::new(
                value.clone(),
                ScopeId::Loop(source.id()),
                Some(Arc::from("block")),
            ))),
        },
        Value::Instance(_) => Ok(value.clone()),
        _ => sanitize_data_out(value, source),
    }
}

fn sanitize_data_out(value: &Value, source: &Arc<LoopShared>) -> Result<Value> {
    match registry::owner_of(value) {
        Some(ScopeId::External) => Ok(value.clone()),
        Some(owner @ ScopeId::Loop(_)) => {
            Ok(Value::Wrapped(WrappedObject::new(value.clone(), owner, None)))
        }
        None => {
            if let Ok(copy) = value.deep_copy() {
                return Ok(copy);
            }
            if let Some(copy) = dissect(value, &mut |child| sanitize_out(child, source))? {
                return Ok(copy);
            }
            registry::mark(value, ScopeId::Loop(source.id()))?;
            Ok(Value::Wrapped(WrappedObject::new(
                value.clone(),
                ScopeId::Loop(source.id()),
                None,
            )))
        }
    }
}

/// Shared-argument wrapping for `€`-marked entry slots: the value crosses by
/// reference, tagged by its source scope, without any copy attempt.
pub(crate) fn sanitize_shared_in(
    value: &Value,
    target: &Arc<LoopShared>,
    queue: Option<&AnswerQueueRef>,
) -> Result<Value> {
    if value.tag_anchor().is_none() {
        // scalars, procs, wrappers: the ordinary rules already apply
        return sanitize_in(value, target, queue);
    }
    match registry::owner_of(value) {
        Some(ScopeId::External) | None => {
            registry::mark(value, ScopeId::External)?;
            Ok(wrap_external(value, target, queue))
        }
        Some(ScopeId::Loop(id)) if id == target.id() => Ok(value.clone()),
        Some(ScopeId::Loop(_)) => Err(Error::invalid_access(
            "shared argument belongs to a different event scope",
        )),
    }
}

fn wrap_external(
    value: &Value,
    target: &Arc<LoopShared>,
    queue: Option<&AnswerQueueRef>,
) -> Value {
    let name = match value {
        Value::Opaque(o) => o.name().map(Arc::from),
        _ => None,
    };
    Value::External(ExternalObject::new(
        value.clone(),
        target.id(),
        queue.cloned(),
        name,
    ))
}

/// Non-destructive dissection of a structured value whose deep copy failed.
///
/// Children are taken out of the source, the emptied shell is copied, the
/// originals are re-installed, and each child is then sanitised on its own
/// into the fresh shell. The source graph is identical afterwards, element
/// identities included. Returns `None` for values that have no shell to
/// dissect.
fn dissect(
    value: &Value,
    sanitize_child: &mut dyn FnMut(&Value) -> Result<Value>,
) -> Result<Option<Value>> {
    match value {
        Value::List(cell) => {
            let children = std::mem::take(&mut *cell.lock());
            let shell = Cell::new(Vec::with_capacity(children.len()));
            *cell.lock() = children.clone();

            let mut out = Vec::with_capacity(children.len());
            for child in &children {
                out.push(sanitize_child(child)?);
            }
            *shell.lock() = out;
            Ok(Some(Value::List(shell)))
        }
        Value::Map(cell) => {
            let pairs = std::mem::take(&mut *cell.lock());
            let shell = Cell::new(Vec::with_capacity(pairs.len()));
            *cell.lock() = pairs.clone();

            let mut out = Vec::with_capacity(pairs.len());
            for (k, v) in &pairs {
                out.push((sanitize_child(k)?, sanitize_child(v)?));
            }
            *shell.lock() = out;
            Ok(Some(Value::Map(shell)))
        }
        Value::Record(cell) => {
            let (type_name, fields) = {
                let mut rec = cell.lock();
                (rec.type_name.clone(), std::mem::take(&mut rec.fields))
            };
            let shell = Cell::new(RecordData {
                type_name,
                fields: Vec::with_capacity(fields.len()),
            });
            cell.lock().fields = fields.clone();

            let mut out = Vec::with_capacity(fields.len());
            for (name, v) in &fields {
                out.push((name.clone(), sanitize_child(v)?));
            }
            shell.lock().fields = out;
            Ok(Some(Value::Record(shell)))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxable::{Boxable, Dispatch, Interface, MethodCall};
    use crate::event_loop::{EventScope, GuardTime, LoopShared};
    use crate::pool::ThreadPolicy;
    use crate::procs::Proc;
    use crate::value::OpaqueRef;

    struct Dummy;

    impl Boxable for Dummy {
        fn interface() -> Interface {
            Interface::new()
        }

        fn dispatch(
            &mut self,
            _scope: &mut EventScope<'_>,
            _call: MethodCall,
        ) -> Result<Dispatch> {
            Ok(Dispatch::nil())
        }
    }

    fn test_loop() -> Arc<LoopShared> {
        LoopShared::new(
            Dummy,
            Arc::from("test-loop"),
            GuardTime::Off,
            ThreadPolicy::SpawnThread,
            false,
        )
    }

    #[test]
    fn scalars_pass_both_ways_unchanged() {
        let lp = test_loop();
        for v in [
            Value::Nil,
            Value::Bool(true),
            Value::Int(-3),
            Value::Float(1.5),
            Value::sym("atom"),
            Value::str("frozen"),
        ] {
            assert_eq!(sanitize_in(&v, &lp, None).unwrap(), v);
            assert_eq!(sanitize_out(&v, &lp).unwrap(), v);
        }
    }

    #[test]
    fn containers_cross_as_detached_copies_idempotently() {
        let lp = test_loop();
        let v = Value::list(vec![Value::Int(1), Value::str("x")]);
        let first = sanitize_in(&v, &lp, None).unwrap();
        assert_eq!(first, v);
        assert_ne!(first.identity(), v.identity());

        // a copy of the copy is structurally the same value again
        let second = sanitize_in(&first, &lp, None).unwrap();
        assert_eq!(second, first);
    }

    #[test]
    fn native_procs_wrap_inward_and_unwrap_outward_by_identity() {
        let lp = test_loop();
        let p = Value::Proc(Proc::native(|_| Ok(Value::Nil)));
        let wrapped = sanitize_in(&p, &lp, None).unwrap();
        assert_eq!(wrapped.kind_name(), "external-proc");

        let back = sanitize_out(&wrapped, &lp).unwrap();
        assert_eq!(back.kind_name(), "proc");
        assert_eq!(back.identity(), p.identity());
    }

    #[test]
    fn loop_shared_values_wrap_outward_and_unwrap_coming_home() {
        let lp = test_loop();
        let v = Value::list(vec![]);
        registry::mark(&v, ScopeId::Loop(lp.id())).unwrap();

        let out = sanitize_out(&v, &lp).unwrap();
        assert_eq!(out.kind_name(), "wrapped-object");

        let home = sanitize_in(&out, &lp, None).unwrap();
        assert_eq!(home.identity(), v.identity());
    }

    #[test]
    fn externally_shared_values_wrap_inward_and_unwrap_outward() {
        let lp = test_loop();
        let v = Value::list(vec![]);
        registry::mark(&v, ScopeId::External).unwrap();

        let inside = sanitize_in(&v, &lp, None).unwrap();
        assert_eq!(inside.kind_name(), "external-object");

        let back = sanitize_out(&inside, &lp).unwrap();
        assert_eq!(back.identity(), v.identity());
    }

    #[test]
    fn values_tagged_by_another_loop_are_rejected() {
        let a = test_loop();
        let b = test_loop();
        let v = Value::list(vec![]);
        registry::mark(&v, ScopeId::Loop(a.id())).unwrap();

        let err = sanitize_in(&v, &b, None).unwrap_err();
        assert!(matches!(err, Error::InvalidAccess(_)));
        assert!(sanitize_shared_in(&v, &b, None).is_err());
    }

    #[test]
    fn shared_plan_wraps_without_copying() {
        let lp = test_loop();
        let v = Value::list(vec![Value::Int(1)]);
        let inside = sanitize_shared_in(&v, &lp, None).unwrap();
        assert_eq!(inside.kind_name(), "external-object");
        assert_eq!(registry::owner_of(&v), Some(ScopeId::External));
        // scalars keep the ordinary rules
        assert_eq!(
            sanitize_shared_in(&Value::Int(1), &lp, None).unwrap(),
            Value::Int(1)
        );
    }

    #[test]
    fn dissection_leaves_the_source_graph_intact() {
        let lp = test_loop();
        let opaque = Value::Opaque(OpaqueRef::named("socket", 17u16));
        let v = Value::list(vec![Value::Int(1), opaque.clone()]);

        let inside = sanitize_in(&v, &lp, None).unwrap();
        let inside_items = inside.as_list().unwrap().lock().clone();
        assert_eq!(inside_items[0], Value::Int(1));
        assert_eq!(inside_items[1].kind_name(), "external-object");

        let source = v.as_list().unwrap().lock();
        assert_eq!(source.len(), 2);
        assert_eq!(source[1].identity(), opaque.identity());
    }

    #[test]
    fn instances_pass_unchanged() {
        let lp = test_loop();
        let bx = crate::Eventbox::new(Dummy);
        let v = Value::Instance(bx.clone());
        let inside = sanitize_in(&v, &lp, None).unwrap();
        assert_eq!(inside.identity(), v.identity());
        let outside = sanitize_out(&inside, &lp).unwrap();
        assert_eq!(outside.identity(), v.identity());
    }
}
