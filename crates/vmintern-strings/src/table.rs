use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};
use vmintern_concurrent::{
    ConcurrentInternTable, RehashOutcome, TableConfig, TableHasher, TableStatistics,
};
use vmintern_core::{
    MaintenanceConfig, MaintenanceNotifier, MaintenanceWork, MemoryCategory, MemoryTracker,
    TextTableConfig,
};

use crate::text::{Text, WeakText};

struct TextConfig;

impl TableConfig for TextConfig {
    type Key = str;
    type Value = WeakText;

    fn matches(value: &WeakText, key: &str) -> bool {
        value.upgrade().is_some_and(|text| text.as_str() == key)
    }

    fn is_dead(value: &WeakText) -> bool {
        value.is_dead()
    }

    fn rehash(hasher: &TableHasher, value: &WeakText) -> Option<u64> {
        value.upgrade().map(|text| hasher.hash(text.as_str()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextStatistics {
    pub table: TableStatistics,
    /// Dead rows at the last collector notification
    pub dead_reported: usize,
    pub removed_total: u64,
    pub has_work: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMaintenance {
    pub grew: bool,
    pub removed: usize,
    pub rehash: Option<RehashOutcome>,
    /// Another structural operation held the table; the request was requeued.
    pub deferred: bool,
}

/// Canonical text values, held weakly.
///
/// The table never keeps a value alive. A row dies when the last strong
/// [`Text`] goes away and is removed by a later maintenance pass, never by
/// a lookup.
pub struct TextTable {
    table: ConcurrentInternTable<TextConfig>,
    config: TextTableConfig,
    tracker: Arc<MemoryTracker>,
    has_work: AtomicBool,
    notifier: RwLock<Option<Arc<dyn MaintenanceNotifier>>>,
    step_buckets: usize,
    dead_reported: AtomicUsize,
    removed_total: AtomicU64,
}

impl TextTable {
    pub fn new(config: &TextTableConfig, step_buckets: usize, tracker: Arc<MemoryTracker>) -> Self {
        Self {
            table: ConcurrentInternTable::new("text", config.sizing()),
            config: config.clone(),
            tracker,
            has_work: AtomicBool::new(false),
            notifier: RwLock::new(None),
            step_buckets: step_buckets.max(1),
            dead_reported: AtomicUsize::new(0),
            removed_total: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            &TextTableConfig::default(),
            MaintenanceConfig::default().step_buckets,
            Arc::new(MemoryTracker::new()),
        )
    }

    pub fn set_notifier(&self, notifier: Arc<dyn MaintenanceNotifier>) {
        *self.notifier.write() = Some(notifier);
    }

    /// The canonical value equal to `text`. If none is live, `text` itself
    /// becomes canonical.
    pub fn intern(&self, text: &Text) -> Text {
        self.intern_with(text.as_str(), || text.clone())
    }

    /// Like [`intern`](Self::intern), allocating only when no live row exists.
    pub fn intern_str(&self, content: &str) -> Text {
        self.intern_with(content, || Text::new(content))
    }

    fn intern_with<F>(&self, content: &str, make: F) -> Text
    where
        F: FnOnce() -> Text,
    {
        let mut canonical = None;
        let mut created = None;
        let inserted = match self.table.insert_if_absent(
            content,
            || {
                let text = make();
                let row = text.downgrade();
                created = Some(text);
                Ok::<_, Infallible>(row)
            },
            |row| {
                canonical = row.upgrade();
                canonical.is_some()
            },
        ) {
            Ok(inserted) => inserted,
            Err(never) => match never {},
        };

        if inserted.is_new() {
            self.on_new_row();
        }
        // a claimed row was upgraded into `canonical`; a published one came from `make`
        match (canonical, created) {
            (Some(text), _) | (None, Some(text)) => text,
            (None, None) => unreachable!("text row neither claimed nor created"),
        }
    }

    pub fn lookup(&self, content: &str) -> Option<Text> {
        let mut found = None;
        self.table.get_with(content, |row| {
            found = row.upgrade();
            found.is_some()
        })?;
        found
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn has_work(&self) -> bool {
        self.has_work.load(Ordering::Acquire)
    }

    fn on_new_row(&self) {
        self.tracker.record_alloc(MemoryCategory::Text, 1);
        if self.table.needs_rehash() {
            self.request_maintenance();
        }
    }

    fn request_maintenance(&self) {
        if self.has_work.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!("text maintenance requested");
        if let Some(notifier) = self.notifier.read().as_ref() {
            notifier.notify(MaintenanceWork::Text);
        }
    }

    /// Collector report after weak processing.
    pub fn gc_notification(&self, dead_count: usize) {
        self.maybe_trigger_maintenance(dead_count);
    }

    /// Schedule maintenance when dead rows outnumber live ones, the table is
    /// crowded, or dead rows pass the high-water mark. Returns whether work
    /// was scheduled by this call.
    pub fn maybe_trigger_maintenance(&self, dead_count: usize) -> bool {
        self.dead_reported.store(dead_count, Ordering::Relaxed);
        if self.has_work() {
            return false;
        }
        let buckets = self.table.bucket_count() as f64;
        let live = self.table.len().saturating_sub(dead_count);
        let load_factor = live as f64 / buckets;
        let dead_factor = dead_count as f64 / buckets;

        let due = dead_factor > load_factor
            || load_factor > self.config.target_load_factor
            || dead_factor > self.config.dead_high_water_mark;
        if due {
            debug!(load_factor, dead_factor, "text maintenance due");
            self.request_maintenance();
        }
        due
    }

    /// Rows whose value is gone; what a collector's weak pass would report.
    pub fn count_dead(&self) -> usize {
        self.table.count_dead()
    }

    /// Grow when crowded and allowed to, otherwise delete dead rows; then
    /// rehash if a runaway chain was seen.
    pub fn run_maintenance(&self) -> TextMaintenance {
        self.has_work.store(false, Ordering::Release);
        let mut report = TextMaintenance::default();

        if self.table.needs_grow() {
            match self.table.start_grow() {
                Some(mut task) => {
                    while !task.step(self.step_buckets) {
                        std::thread::yield_now();
                    }
                    report.grew = true;
                    report.removed = task.dropped();
                }
                None => report.deferred = self.table.is_maintenance_active(),
            }
        } else {
            match self.table.start_bulk_delete(|_| {}) {
                Some(mut task) => {
                    while !task.step(self.step_buckets) {
                        std::thread::yield_now();
                    }
                    report.removed = task.finish();
                }
                None => report.deferred = true,
            }
        }

        if report.removed > 0 {
            self.tracker
                .record_free(MemoryCategory::Text, report.removed as u64);
            self.removed_total
                .fetch_add(report.removed as u64, Ordering::Relaxed);
        }
        if self.table.needs_rehash() {
            report.rehash = Some(self.rehash_with_new_seed());
        }
        if report.deferred {
            debug!("text table busy; maintenance requeued");
            self.request_maintenance();
        }

        if report.grew || report.removed > 0 {
            info!(
                grew = report.grew,
                removed = report.removed,
                rows = self.table.len(),
                buckets = self.table.bucket_count(),
                "text maintenance finished"
            );
        }
        report
    }

    /// Rehash at most once per table. When growth is due it is scheduled
    /// instead, since doubling also shortens the chains.
    pub fn rehash_with_new_seed(&self) -> RehashOutcome {
        if self.table.needs_grow() {
            debug!("rehash deferred in favour of growth");
            self.request_maintenance();
            return RehashOutcome::GrowthPreferred;
        }
        self.table.rehash_with_new_seed()
    }

    /// Visit every live value. Used for dumps.
    pub fn for_each_live<F>(&self, mut visit: F)
    where
        F: FnMut(&Text),
    {
        self.table.for_each(|row| {
            if let Some(text) = row.upgrade() {
                visit(&text);
            }
        });
    }

    pub fn statistics(&self) -> TextStatistics {
        TextStatistics {
            table: self.table.statistics(),
            dead_reported: self.dead_reported.load(Ordering::Relaxed),
            removed_total: self.removed_total.load(Ordering::Relaxed),
            has_work: self.has_work(),
        }
    }

    /// Structural check plus: every live value is the one its content finds.
    /// Call while no thread is interning.
    pub fn verify(&self) -> usize {
        let checked = self.table.verify();
        self.for_each_live(|text| {
            let found = self.lookup(text.as_str());
            assert!(
                found.is_some_and(|row| Text::ptr_eq(&row, text)),
                "text {text:?} is not the row its content finds"
            );
        });
        checked
    }
}

impl std::fmt::Debug for TextTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextTable")
            .field("table", &self.table)
            .field("has_work", &self.has_work())
            .finish()
    }
}
