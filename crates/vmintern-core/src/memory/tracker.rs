use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Categories for attributing memory usage and allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    PermanentArena,
    Identifiers,
    Text,
    LoaderContexts,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub items: u64,
    pub bytes: u64,
}

/// Per-runtime allocation accounting. Cheap enough for the slow paths only:
/// callers record chunk allocations and table rows, not every lookup.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    inner: Mutex<HashMap<MemoryCategory, CategoryStats>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, category: MemoryCategory, apply: impl FnOnce(&mut CategoryStats)) {
        apply(self.inner.lock().entry(category).or_default());
    }

    pub fn record_alloc(&self, category: MemoryCategory, items: u64) {
        self.update(category, |stats| stats.items = stats.items.saturating_add(items));
    }

    /// Saturates at zero.
    pub fn record_free(&self, category: MemoryCategory, items: u64) {
        self.update(category, |stats| stats.items = stats.items.saturating_sub(items));
    }

    /// Signed change in bytes for `category`.
    pub fn record_bytes(&self, category: MemoryCategory, delta: i64) {
        self.update(category, |stats| {
            stats.bytes = stats.bytes.saturating_add_signed(delta);
        });
    }

    pub fn get(&self, category: MemoryCategory) -> CategoryStats {
        self.inner.lock().get(&category).copied().unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<MemoryCategory, CategoryStats> {
        self.inner.lock().clone()
    }
}
