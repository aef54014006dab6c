use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Categories for attributing memory usage and allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryCategory {
    /// Arenas preallocated by memory pools
    PoolArena,
    /// Requests a pool could not serve and sent to the general allocator
    PoolFallback,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub items: u64,
    pub bytes: u64,
}

#[derive(Debug, Default)]
pub struct MemoryTracker {
    inner: Mutex<HashMap<MemoryCategory, CategoryStats>>,
}

impl MemoryTracker {
    pub fn record_alloc(&self, category: MemoryCategory, items: u64) {
        let mut g = self.inner.lock();
        let e = g.entry(category).or_default();
        e.items = e.items.saturating_add(items);
    }

    pub fn record_bytes(&self, category: MemoryCategory, delta: i64) {
        let mut g = self.inner.lock();
        let e = g.entry(category).or_default();
        if delta >= 0 {
            e.bytes = e.bytes.saturating_add(delta as u64);
        } else {
            e.bytes = e.bytes.saturating_sub(delta.unsigned_abs());
        }
    }

    pub fn get(&self, category: MemoryCategory) -> CategoryStats {
        self.inner.lock().get(&category).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<MemoryCategory, CategoryStats> {
        self.inner.lock().clone()
    }
}

pub static MEMORY_TRACKER: Lazy<MemoryTracker> = Lazy::new(MemoryTracker::default);
