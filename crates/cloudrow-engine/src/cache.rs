//! Per-run memoization cache
//!
//! One map per reality from `(kind, identity)` to the last entity read in the
//! current run. All mutation goes through `put`/`invalidate*`/`clear`.

use crate::entity::{Entity, Reality};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type Slot = Arc<dyn Any + Send + Sync>;
type Key = (Reality, &'static str);

#[derive(Default)]
pub struct MemoCache {
    entries: Mutex<HashMap<Key, HashMap<String, Slot>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Cache counters for the current run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl MemoCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, HashMap<String, Slot>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get<E: Entity>(&self, reality: Reality, kind: &'static str, id: &str) -> Option<E> {
        let found = self
            .lock()
            .get(&(reality, kind))
            .and_then(|m| m.get(id))
            .and_then(|slot| slot.downcast_ref::<E>())
            .cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Cache hit for {} {} {}", kind, reality, id);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Cache miss for {} {} {}", kind, reality, id);
        }
        found
    }

    pub fn put<E: Entity>(&self, reality: Reality, kind: &'static str, id: impl Into<String>, entity: E) {
        self.lock()
            .entry((reality, kind))
            .or_default()
            .insert(id.into(), Arc::new(entity));
    }

    /// Drop one entity so the next read observes a just-applied change
    pub fn invalidate(&self, reality: Reality, kind: &'static str, id: &str) {
        if let Some(m) = self.lock().get_mut(&(reality, kind)) {
            m.remove(id);
        }
    }

    /// Drop every entity of one kind in one reality
    pub fn invalidate_kind(&self, reality: Reality, kind: &'static str) {
        self.lock().remove(&(reality, kind));
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.lock().values().map(|m| m.len()).sum(),
        }
    }
}

impl std::fmt::Debug for MemoCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoCache")
            .field("stats", &self.stats())
            .finish()
    }
}
