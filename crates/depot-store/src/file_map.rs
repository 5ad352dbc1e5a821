//! Entry registry
//!
//! Name -> entry map with two implementations: an unbounded map and a
//! bounded LRU. The registry is a cache of on-disk truth: a dropped
//! slot is not a dropped file. LRU eviction removes the slot only; the
//! on-disk file and any open handles survive, and a later lookup
//! reloads the entry from disk.

use crate::entry::FileEntry;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Registry of resident entries.
///
/// The structural lock is held only across individual calls; once a
/// reference is out, the entry's own lock governs synchronization.
pub(crate) trait FileMap: Send + Sync {
    /// Look up a resident entry.
    fn load(&self, name: &str) -> Option<Arc<FileEntry>>;

    /// Insert `entry` unless `name` is already resident; returns the
    /// resident entry either way.
    fn try_store(&self, name: &str, entry: Arc<FileEntry>) -> Arc<FileEntry>;

    /// Whether `name` is resident.
    fn contains(&self, name: &str) -> bool;

    /// Drop the slot for `name`, but only if it still holds `entry`
    /// (a concurrent reload may have materialized a fresh one).
    fn remove(&self, name: &str, entry: &Arc<FileEntry>);
}

/// Unbounded registry.
pub(crate) struct SimpleFileMap {
    entries: Mutex<HashMap<String, Arc<FileEntry>>>,
}

impl SimpleFileMap {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl FileMap for SimpleFileMap {
    fn load(&self, name: &str) -> Option<Arc<FileEntry>> {
        self.entries.lock().get(name).cloned()
    }

    fn try_store(&self, name: &str, entry: Arc<FileEntry>) -> Arc<FileEntry> {
        let mut entries = self.entries.lock();
        Arc::clone(entries.entry(name.to_string()).or_insert(entry))
    }

    fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    fn remove(&self, name: &str, entry: &Arc<FileEntry>) {
        let mut entries = self.entries.lock();
        if entries.get(name).is_some_and(|e| Arc::ptr_eq(e, entry)) {
            entries.remove(name);
        }
    }
}

struct LruState {
    entries: HashMap<String, Arc<FileEntry>>,
    /// Recency queue, least recently used at the front.
    order: VecDeque<String>,
}

impl LruState {
    fn touch(&mut self, name: &str) {
        self.order.retain(|n| n != name);
        self.order.push_back(name.to_string());
    }
}

/// Bounded registry with recency updated on every load and store.
pub(crate) struct LruFileMap {
    state: Mutex<LruState>,
    capacity: usize,
}

impl LruFileMap {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LruState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }
}

impl FileMap for LruFileMap {
    fn load(&self, name: &str) -> Option<Arc<FileEntry>> {
        let mut state = self.state.lock();
        let entry = state.entries.get(name).cloned()?;
        state.touch(name);
        Some(entry)
    }

    fn try_store(&self, name: &str, entry: Arc<FileEntry>) -> Arc<FileEntry> {
        let mut state = self.state.lock();
        let resident = Arc::clone(state.entries.entry(name.to_string()).or_insert(entry));
        state.touch(name);
        while state.entries.len() > self.capacity {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
            debug!(name = %oldest, "evicted entry from registry");
        }
        resident
    }

    fn contains(&self, name: &str) -> bool {
        self.state.lock().entries.contains_key(name)
    }

    fn remove(&self, name: &str, entry: &Arc<FileEntry>) {
        let mut state = self.state.lock();
        if state.entries.get(name).is_some_and(|e| Arc::ptr_eq(e, entry)) {
            state.entries.remove(name);
            state.order.retain(|n| n != name);
        }
    }
}
