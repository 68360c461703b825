//! Boundary value model.
//!
//! Every argument, return value, completion payload and exception that
//! crosses a scope boundary travels as a [`Value`]. The sum type is what the
//! sanitizer's decision table matches on: immutable scalars pass freely,
//! mutable containers carry pointer identity and are deep-copied or
//! dissected, opaque payloads can only cross wrapped, and procs, wrappers and
//! instance handles each have their own rules.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::error::CopyError;
use crate::eventbox::Eventbox;
use crate::procs::Proc;
use crate::wrapped::{ExternalObject, WrappedObject};

/// Shared mutable container with pointer identity.
///
/// Two `Cell`s are the *same object* iff [`Cell::same`] holds; cloning the
/// handle never clones the payload. Mutation is only race-free because the
/// sanitizer keeps unwrapped cells confined to a single scope.
pub struct Cell<T>(Arc<Mutex<T>>);

impl<T> Cell<T> {
    pub fn new(value: T) -> Self {
        Cell(Arc::new(Mutex::new(value)))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock()
    }

    /// Pointer identity.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl<T: Send + 'static> Cell<T> {
    /// Liveness anchor for the object registry.
    pub(crate) fn anchor(&self) -> Weak<dyn Any + Send + Sync> {
        let any: Arc<dyn Any + Send + Sync> = self.0.clone();
        Arc::downgrade(&any)
    }
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Cell(self.0.clone())
    }
}

impl<T: fmt::Debug> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_lock() {
            Some(inner) => write!(f, "Cell({:?})", &*inner),
            None => write!(f, "Cell(<locked>)"),
        }
    }
}

/// Instance-variable-bearing object: a named type with ordered fields.
#[derive(Debug, Clone)]
pub struct RecordData {
    pub type_name: Arc<str>,
    pub fields: Vec<(Arc<str>, Value)>,
}

impl RecordData {
    pub fn new(type_name: impl Into<Arc<str>>) -> Self {
        RecordData {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<Arc<str>>, value: impl Into<Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| n.as_ref() == name)
            .map(|(_, v)| v)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| n.as_ref() == name) {
            slot.1 = value;
        } else {
            self.fields.push((Arc::from(name), value));
        }
    }
}

/// Handler invoked on the owning thread when the event scope `send`s a named
/// method to an opaque external object.
pub type SendHandler =
    Arc<dyn Fn(&mut (dyn Any + Send), &str, &[Value]) -> crate::Result<Value> + Send + Sync>;

struct OpaqueCell {
    name: Option<Arc<str>>,
    payload: Mutex<Box<dyn Any + Send>>,
    handler: Option<SendHandler>,
}

/// Un-copyable system resource. Crossing a boundary it is always
/// shared-tagged and wrapped; the payload itself never leaves its owner.
#[derive(Clone)]
pub struct OpaqueRef(Arc<OpaqueCell>);

impl OpaqueRef {
    pub fn new(payload: impl Any + Send) -> Self {
        OpaqueRef(Arc::new(OpaqueCell {
            name: None,
            payload: Mutex::new(Box::new(payload)),
            handler: None,
        }))
    }

    pub fn named(name: impl Into<Arc<str>>, payload: impl Any + Send) -> Self {
        OpaqueRef(Arc::new(OpaqueCell {
            name: Some(name.into()),
            payload: Mutex::new(Box::new(payload)),
            handler: None,
        }))
    }

    /// Attaches the method handler used by the external `send` primitive.
    pub fn with_handler(
        name: impl Into<Arc<str>>,
        payload: impl Any + Send,
        handler: SendHandler,
    ) -> Self {
        OpaqueRef(Arc::new(OpaqueCell {
            name: Some(name.into()),
            payload: Mutex::new(Box::new(payload)),
            handler: Some(handler),
        }))
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn with_payload<R>(&self, f: impl FnOnce(&mut (dyn Any + Send)) -> R) -> R {
        let mut guard = self.0.payload.lock();
        f(guard.as_mut())
    }

    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn handler(&self) -> Option<SendHandler> {
        self.0.handler.clone()
    }

    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub(crate) fn anchor(&self) -> Weak<dyn Any + Send + Sync> {
        let any: Arc<dyn Any + Send + Sync> = self.0.clone();
        Arc::downgrade(&any)
    }
}

impl fmt::Debug for OpaqueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque({})", self.name().unwrap_or("?"))
    }
}

/// A value crossing a scope boundary.
#[derive(Clone)]
pub enum Value {
    /// Absent value.
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Interned symbol; immutable, passes every boundary unchanged.
    Sym(Arc<str>),
    /// Frozen string; immutable, passes every boundary unchanged.
    Str(Arc<str>),
    /// Mutable byte string.
    Bytes(Cell<Vec<u8>>),
    /// Ordered sequence.
    List(Cell<Vec<Value>>),
    /// Ordered mapping with structural key equality.
    Map(Cell<Vec<(Value, Value)>>),
    /// Named record with instance variables.
    Record(Cell<RecordData>),
    /// Un-copyable resource.
    Opaque(OpaqueRef),
    /// An eventbox handle; internally safe, passes unchanged.
    Instance(Eventbox),
    /// Callable (see the proc taxonomy in [`crate::procs`]).
    Proc(Proc),
    /// Event-scope value wrapped for the outside.
    Wrapped(WrappedObject),
    /// External value wrapped for an event scope.
    External(ExternalObject),
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn sym(s: impl Into<Arc<str>>) -> Value {
        Value::Sym(s.into())
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(Cell::new(b.into()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Cell::new(items))
    }

    pub fn list_of<T: Into<Value>>(items: impl IntoIterator<Item = T>) -> Value {
        Value::list(items.into_iter().map(Into::into).collect())
    }

    pub fn map(pairs: Vec<(Value, Value)>) -> Value {
        Value::Map(Cell::new(pairs))
    }

    pub fn record(data: RecordData) -> Value {
        Value::Record(Cell::new(data))
    }

    pub fn opaque(payload: impl Any + Send) -> Value {
        Value::Opaque(OpaqueRef::new(payload))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Sym(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Cell<Vec<Value>>> {
        match self {
            Value::List(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Cell<Vec<(Value, Value)>>> {
        match self {
            Value::Map(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Cell<RecordData>> {
        match self {
            Value::Record(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_proc(&self) -> Option<&Proc> {
        match self {
            Value::Proc(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&Eventbox> {
        match self {
            Value::Instance(bx) => Some(bx),
            _ => None,
        }
    }

    /// Classification label, stable across boundaries.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Sym(_) => "symbol",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Record(_) => "record",
            Value::Opaque(_) => "opaque",
            Value::Instance(_) => "instance",
            Value::Proc(p) => p.kind_name(),
            Value::Wrapped(_) => "wrapped-object",
            Value::External(_) => "external-object",
        }
    }

    /// Pointer identity for identity-bearing variants.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Bytes(c) => Some(c.id()),
            Value::List(c) => Some(c.id()),
            Value::Map(c) => Some(c.id()),
            Value::Record(c) => Some(c.id()),
            Value::Opaque(o) => Some(o.id()),
            Value::Instance(bx) => Some(bx.id_ptr()),
            Value::Proc(p) => Some(p.id()),
            Value::Wrapped(w) => Some(w.id()),
            Value::External(x) => Some(x.id()),
            _ => None,
        }
    }

    /// Registry anchor for values that can be marked as shared objects.
    ///
    /// Scalars, frozen strings, symbols, procs, instances and values that are
    /// already wrapped are not taggable.
    pub(crate) fn tag_anchor(&self) -> Option<(usize, Weak<dyn Any + Send + Sync>)> {
        match self {
            Value::Bytes(c) => Some((c.id(), c.anchor())),
            Value::List(c) => Some((c.id(), c.anchor())),
            Value::Map(c) => Some((c.id(), c.anchor())),
            Value::Record(c) => Some((c.id(), c.anchor())),
            Value::Opaque(o) => Some((o.id(), o.anchor())),
            _ => None,
        }
    }

    /// Structural copy standing in for serialise-then-deserialise.
    ///
    /// Preserves shared substructure and cycles via the visited map; fails on
    /// opaque payloads, procs, instances and wrappers. The source graph is
    /// never modified.
    pub(crate) fn deep_copy(&self) -> std::result::Result<Value, CopyError> {
        let mut seen = HashMap::new();
        self.deep_copy_inner(&mut seen)
    }

    fn deep_copy_inner(
        &self,
        seen: &mut HashMap<usize, Value>,
    ) -> std::result::Result<Value, CopyError> {
        match self {
            Value::Nil
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::Sym(_)
            | Value::Str(_) => Ok(self.clone()),
            Value::Bytes(c) => {
                if let Some(v) = seen.get(&c.id()) {
                    return Ok(v.clone());
                }
                let copy = Cell::new(c.lock().clone());
                seen.insert(c.id(), Value::Bytes(copy.clone()));
                Ok(Value::Bytes(copy))
            }
            Value::List(c) => {
                if let Some(v) = seen.get(&c.id()) {
                    return Ok(v.clone());
                }
                let copy = Cell::new(Vec::new());
                seen.insert(c.id(), Value::List(copy.clone()));
                let children = c.lock().clone();
                let mut out = Vec::with_capacity(children.len());
                for child in &children {
                    out.push(child.deep_copy_inner(seen)?);
                }
                *copy.lock() = out;
                Ok(Value::List(copy))
            }
            Value::Map(c) => {
                if let Some(v) = seen.get(&c.id()) {
                    return Ok(v.clone());
                }
                let copy = Cell::new(Vec::new());
                seen.insert(c.id(), Value::Map(copy.clone()));
                let pairs = c.lock().clone();
                let mut out = Vec::with_capacity(pairs.len());
                for (k, v) in &pairs {
                    out.push((k.deep_copy_inner(seen)?, v.deep_copy_inner(seen)?));
                }
                *copy.lock() = out;
                Ok(Value::Map(copy))
            }
            Value::Record(c) => {
                if let Some(v) = seen.get(&c.id()) {
                    return Ok(v.clone());
                }
                let type_name = c.lock().type_name.clone();
                let copy = Cell::new(RecordData {
                    type_name,
                    fields: Vec::new(),
                });
                seen.insert(c.id(), Value::Record(copy.clone()));
                let fields = c.lock().fields.clone();
                let mut out = Vec::with_capacity(fields.len());
                for (name, v) in &fields {
                    out.push((name.clone(), v.deep_copy_inner(seen)?));
                }
                copy.lock().fields = out;
                Ok(Value::Record(copy))
            }
            Value::Opaque(_)
            | Value::Instance(_)
            | Value::Proc(_)
            | Value::Wrapped(_)
            | Value::External(_) => Err(CopyError),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Sym(a), Value::Sym(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a.same(b) || *a.lock() == *b.lock(),
            (Value::List(a), Value::List(b)) => a.same(b) || *a.lock() == *b.lock(),
            (Value::Map(a), Value::Map(b)) => a.same(b) || *a.lock() == *b.lock(),
            (Value::Record(a), Value::Record(b)) => {
                a.same(b) || {
                    let (a, b) = (a.lock(), b.lock());
                    a.type_name == b.type_name && a.fields == b.fields
                }
            }
            (Value::Opaque(a), Value::Opaque(b)) => a.same(b),
            (Value::Instance(a), Value::Instance(b)) => a == b,
            (Value::Proc(a), Value::Proc(b)) => a.id() == b.id(),
            (Value::Wrapped(a), Value::Wrapped(b)) => a.id() == b.id(),
            (Value::External(a), Value::External(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Sym(s) => write!(f, ":{s}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(c) => write!(f, "bytes[{}]", c.lock().len()),
            Value::List(c) => match c.0.try_lock() {
                Some(items) => f.debug_list().entries(items.iter()).finish(),
                None => write!(f, "[<locked>]"),
            },
            Value::Map(c) => match c.0.try_lock() {
                Some(pairs) => f
                    .debug_map()
                    .entries(pairs.iter().map(|(k, v)| (k, v)))
                    .finish(),
                None => write!(f, "{{<locked>}}"),
            },
            Value::Record(c) => match c.0.try_lock() {
                Some(rec) => write!(f, "{}{:?}", rec.type_name, rec.fields),
                None => write!(f, "record<locked>"),
            },
            Value::Opaque(o) => fmt::Debug::fmt(o, f),
            Value::Instance(bx) => write!(f, "Eventbox({})", bx.name()),
            Value::Proc(p) => write!(f, "#<{}>", p.kind_name()),
            Value::Wrapped(w) => fmt::Debug::fmt(w, f),
            Value::External(x) => fmt::Debug::fmt(x, f),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Value {
        Value::Nil
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Value {
        Value::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Int(i)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Value {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Value {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Str(Arc::from(s.as_str()))
    }
}

impl From<Proc> for Value {
    fn from(p: Proc) -> Value {
        Value::Proc(p)
    }
}

impl From<Eventbox> for Value {
    fn from(bx: Eventbox) -> Value {
        Value::Instance(bx)
    }
}
