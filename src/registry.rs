//! Process-wide object registry.
//!
//! Values marked as *shared objects* cross scope boundaries by reference
//! instead of by deep copy; the registry records which scope owns each tag.
//! Reads and writes are point operations behind the registry's own mutex.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::value::Value;

/// Unique identity of one event loop instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(u64);

impl LoopId {
    pub(crate) fn next() -> LoopId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        LoopId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A scope a value can belong to: one specific event loop, or the external
/// world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeId {
    Loop(LoopId),
    External,
}

struct Entry {
    owner: ScopeId,
    alive: Weak<dyn Any + Send + Sync>,
}

static REGISTRY: Lazy<Mutex<HashMap<usize, Entry>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Tags `value` as shared by `owner`.
///
/// Re-marking with the same owner is idempotent; marking a non-taggable value
/// or re-marking with a different owner is an `InvalidAccess`.
pub(crate) fn mark(value: &Value, owner: ScopeId) -> Result<()> {
    let (id, alive) = value.tag_anchor().ok_or_else(|| {
        Error::invalid_access(format!(
            "{} value cannot be marked as a shared object",
            value.kind_name()
        ))
    })?;
    let mut map = REGISTRY.lock();
    match map.get(&id) {
        Some(entry) if entry.alive.strong_count() > 0 => {
            if entry.owner == owner {
                Ok(())
            } else {
                Err(Error::invalid_access(
                    "value is already shared by a different scope",
                ))
            }
        }
        _ => {
            map.insert(id, Entry { owner, alive });
            Ok(())
        }
    }
}

/// Owner of the shared tag on `value`, if any.
pub(crate) fn owner_of(value: &Value) -> Option<ScopeId> {
    let id = value.identity()?;
    let mut map = REGISTRY.lock();
    match map.get(&id) {
        Some(entry) if entry.alive.strong_count() > 0 => Some(entry.owner),
        Some(_) => {
            // stale slot from a dead value that shared this address
            map.remove(&id);
            None
        }
        None => None,
    }
}

/// Drops tags whose values have been finalised. Invoked by the threadpool's
/// GC-when-busy hint and safe to call at any time.
pub(crate) fn sweep() -> usize {
    let mut map = REGISTRY.lock();
    let before = map.len();
    map.retain(|_, entry| entry.alive.strong_count() > 0);
    before - map.len()
}
