use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};
use vmintern_concurrent::{
    ConcurrentInternTable, RehashOutcome, TableConfig, TableHasher, TableStatistics,
};
use vmintern_core::{
    IdentifierTableConfig, MaintenanceConfig, MaintenanceNotifier, MaintenanceWork,
    MemoryCategory, MemoryTracker, PermanentArena,
};

use crate::error::{check_length, Result, MAX_IDENTIFIER_LENGTH};
use crate::symbol::{Identifier, Symbol};
use crate::vocabulary::{CoreId, CoreIdentifiers};

struct SymbolConfig;

impl TableConfig for SymbolConfig {
    type Key = [u8];
    type Value = Arc<Symbol>;

    fn matches(value: &Arc<Symbol>, key: &[u8]) -> bool {
        value.as_bytes() == key
    }

    fn is_dead(value: &Arc<Symbol>) -> bool {
        value.is_dead()
    }

    fn rehash(hasher: &TableHasher, value: &Arc<Symbol>) -> Option<u64> {
        (!value.is_dead()).then(|| hasher.hash(value.as_bytes()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentifierStatistics {
    pub table: TableStatistics,
    pub permanent: usize,
    pub arena_used_bytes: usize,
    pub arena_reserved_bytes: usize,
    pub arena_chunks: usize,
    pub removed_total: u64,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierMaintenance {
    pub grew: bool,
    pub removed: usize,
    pub rehash: Option<RehashOutcome>,
    /// Another structural operation held the table; the request was requeued.
    pub deferred: bool,
}

/// Process-wide table of canonical identifiers.
///
/// Counted rows are heap allocated and removed by maintenance once their
/// refcount reaches zero. Permanent rows are copied into an arena that is
/// never freed.
pub struct IdentifierTable {
    table: ConcurrentInternTable<SymbolConfig>,
    arena: PermanentArena,
    tracker: Arc<MemoryTracker>,
    core: CoreIdentifiers,
    has_work: AtomicBool,
    notifier: RwLock<Option<Arc<dyn MaintenanceNotifier>>>,
    step_buckets: usize,
    removed_total: AtomicU64,
}

impl IdentifierTable {
    pub fn new(
        config: &IdentifierTableConfig,
        step_buckets: usize,
        tracker: Arc<MemoryTracker>,
    ) -> Result<Self> {
        let table = ConcurrentInternTable::new("identifiers", config.sizing());
        let arena = PermanentArena::new(
            config.arena_chunk_bytes,
            config.arena_limit_bytes,
            Arc::clone(&tracker),
        );
        let core = CoreIdentifiers::intern_with(|bytes| {
            Self::intern_permanent_into(&table, &arena, &tracker, bytes)
        })?;
        debug!(core = core.len(), "identifier table ready");

        Ok(Self {
            table,
            arena,
            tracker,
            core,
            has_work: AtomicBool::new(false),
            notifier: RwLock::new(None),
            step_buckets: step_buckets.max(1),
            removed_total: AtomicU64::new(0),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(
            &IdentifierTableConfig::default(),
            MaintenanceConfig::default().step_buckets,
            Arc::new(MemoryTracker::new()),
        )
    }

    /// Route maintenance requests to `notifier`.
    pub fn set_notifier(&self, notifier: Arc<dyn MaintenanceNotifier>) {
        *self.notifier.write() = Some(notifier);
    }

    /// Canonical handle for `bytes`, creating a counted row on first use.
    pub fn intern(&self, bytes: &[u8]) -> Result<Identifier> {
        check_length(bytes)?;
        let inserted = match self.table.insert_if_absent(
            bytes,
            || Ok::<_, Infallible>(Arc::new(Symbol::heap(bytes))),
            |symbol| symbol.try_claim(),
        ) {
            Ok(inserted) => inserted,
            Err(never) => match never {},
        };
        if inserted.is_new() {
            self.on_new_row();
        }
        Ok(Identifier::adopt(inserted.into_value()))
    }

    pub fn intern_str(&self, text: &str) -> Result<Identifier> {
        self.intern(text.as_bytes())
    }

    /// Canonical handle for `bytes` that is never reclaimed. An existing
    /// counted row is promoted in place.
    pub fn intern_permanent(&self, bytes: &[u8]) -> Result<Identifier> {
        let identifier = Self::intern_permanent_into(&self.table, &self.arena, &self.tracker, bytes)?;
        self.check_load();
        Ok(identifier)
    }

    fn intern_permanent_into(
        table: &ConcurrentInternTable<SymbolConfig>,
        arena: &PermanentArena,
        tracker: &MemoryTracker,
        bytes: &[u8],
    ) -> Result<Identifier> {
        check_length(bytes)?;
        let inserted = table.insert_if_absent(
            bytes,
            || -> Result<Arc<Symbol>> {
                let stored = arena.alloc_bytes(bytes)?;
                Ok(Arc::new(Symbol::permanent(stored)))
            },
            |symbol| symbol.try_claim(),
        )?;
        if inserted.is_new() {
            tracker.record_alloc(MemoryCategory::Identifiers, 1);
        }
        let symbol = inserted.into_value();
        symbol.make_permanent();
        Ok(Identifier::adopt(symbol))
    }

    /// Handle for an existing live row. Never allocates.
    pub fn find_existing(&self, bytes: &[u8]) -> Option<Identifier> {
        if bytes.len() > MAX_IDENTIFIER_LENGTH {
            return None;
        }
        self.table
            .get_with(bytes, |symbol| symbol.try_claim())
            .map(Identifier::adopt)
    }

    /// Give back one reference. The row stays until maintenance sweeps it.
    pub fn release(&self, identifier: Identifier) {
        drop(identifier);
    }

    /// Intern a batch of names, as class loading does for a constant pool.
    pub fn intern_batch(&self, names: &[&[u8]]) -> Result<Vec<Identifier>> {
        names.iter().map(|name| self.intern(name)).collect()
    }

    pub fn core(&self) -> &CoreIdentifiers {
        &self.core
    }

    pub fn core_id(&self, id: CoreId) -> &Identifier {
        self.core.get(id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn tracker(&self) -> &Arc<MemoryTracker> {
        &self.tracker
    }

    /// Mark cleanup pending, typically after loader contexts were purged.
    pub fn trigger_cleanup(&self) {
        self.request_maintenance();
    }

    pub fn has_work(&self) -> bool {
        self.has_work.load(Ordering::Acquire)
    }

    fn on_new_row(&self) {
        self.tracker.record_alloc(MemoryCategory::Identifiers, 1);
        self.check_load();
    }

    fn check_load(&self) {
        if self.table.needs_grow() || self.table.needs_rehash() {
            self.request_maintenance();
        }
    }

    fn request_maintenance(&self) {
        if self.has_work.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!("identifier maintenance requested");
        if let Some(notifier) = self.notifier.read().as_ref() {
            notifier.notify(MaintenanceWork::Identifiers);
        }
    }

    /// Grow if over the preferred load factor and below the size limit,
    /// otherwise sweep dead rows; then rehash if a runaway chain was seen.
    pub fn run_maintenance(&self) -> IdentifierMaintenance {
        self.has_work.store(false, Ordering::Release);
        let mut report = IdentifierMaintenance::default();

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
                .record_free(MemoryCategory::Identifiers, report.removed as u64);
            self.removed_total
                .fetch_add(report.removed as u64, Ordering::Relaxed);
        }
        if self.table.needs_rehash() {
            report.rehash = Some(self.rehash_with_new_seed());
        }
        if report.deferred {
            debug!("identifier table busy; maintenance requeued");
            self.request_maintenance();
        }

        if report.grew || report.removed > 0 {
            info!(
                grew = report.grew,
                removed = report.removed,
                rows = self.table.len(),
                buckets = self.table.bucket_count(),
                "identifier maintenance finished"
            );
        }
        report
    }

    pub fn rehash_with_new_seed(&self) -> RehashOutcome {
        self.table.rehash_with_new_seed()
    }

    /// Visit every live permanent row. Read-only export hook.
    pub fn for_each_permanent<F>(&self, mut visit: F)
    where
        F: FnMut(&Symbol),
    {
        self.table.for_each(|symbol| {
            if symbol.is_permanent() {
                visit(symbol);
            }
        });
    }

    pub fn statistics(&self) -> IdentifierStatistics {
        let mut permanent = 0;
        self.for_each_permanent(|_| permanent += 1);
        IdentifierStatistics {
            table: self.table.statistics(),
            permanent,
            arena_used_bytes: self.arena.used(),
            arena_reserved_bytes: self.arena.reserved(),
            arena_chunks: self.arena.chunks(),
            removed_total: self.removed_total.load(Ordering::Relaxed),
        }
    }

    /// Check table structure and that every live row is the one its own
    /// content finds. Call while no thread is interning. Panics on
    /// corruption; returns the number of rows checked.
    pub fn verify(&self) -> usize {
        let checked = self.table.verify();
        self.table.for_each(|symbol| {
            if symbol.is_dead() {
                return;
            }
            let found = self.table.get(symbol.as_bytes());
            assert!(
                found.is_some_and(|row| Arc::ptr_eq(&row, symbol)),
                "identifier {symbol} is not the row its content finds"
            );
        });
        checked
    }
}

impl std::fmt::Debug for IdentifierTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentifierTable")
            .field("table", &self.table)
            .field("arena_used_bytes", &self.arena.used())
            .field("has_work", &self.has_work())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SymbolError;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicUsize,
    }

    impl MaintenanceNotifier for CountingNotifier {
        fn notify(&self, work: MaintenanceWork) {
            assert_eq!(work, MaintenanceWork::Identifiers);
            self.calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn core_bytes() -> usize {
        CoreId::ALL.iter().map(|id| id.text().len()).sum()
    }

    #[test]
    fn interning_twice_shares_the_row() {
        let table = IdentifierTable::with_defaults().unwrap();
        let a = table.intern(b"com/example/Foo").unwrap();
        let b = table.intern(b"com/example/Foo").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.refcount(), 2);
        assert_eq!(table.len(), CoreId::ALL.len() + 1);

        let row = a.symbol().clone();
        table.release(a);
        drop(b);
        assert_eq!(row.refcount(), 0);
        assert!(table.find_existing(b"com/example/Foo").is_none());
    }

    #[test]
    fn find_existing_takes_a_reference() {
        let table = IdentifierTable::with_defaults().unwrap();
        assert!(table.find_existing(b"missing").is_none());
        let held = table.intern(b"present").unwrap();
        let found = table.find_existing(b"present").unwrap();
        assert_eq!(held, found);
        assert_eq!(held.refcount(), 2);
    }

    #[test]
    fn overlong_input_is_rejected() {
        let table = IdentifierTable::with_defaults().unwrap();
        let long = vec![b'a'; MAX_IDENTIFIER_LENGTH + 1];
        let err = table.intern(&long).unwrap_err();
        assert!(matches!(err, SymbolError::TooLong { length, .. } if length == long.len()));
        assert!(table.intern(&long[..MAX_IDENTIFIER_LENGTH]).is_ok());
    }

    #[test]
    fn empty_identifier_is_valid_and_distinct() {
        let table = IdentifierTable::with_defaults().unwrap();
        let empty = table.intern(b"").unwrap();
        assert!(empty.is_empty());
        assert_eq!(&empty, table.core_id(CoreId::Empty));
        assert_ne!(empty, table.intern(b" ").unwrap());
    }

    #[test]
    fn permanent_interning_promotes_counted_rows() {
        let table = IdentifierTable::with_defaults().unwrap();
        let counted = table.intern(b"Promoted").unwrap();
        let permanent = table.intern_permanent(b"Promoted").unwrap();
        assert_eq!(counted, permanent);
        assert!(counted.is_permanent());
        assert!(!counted.is_arena_allocated());

        let fresh = table.intern_permanent(b"Fresh").unwrap();
        assert!(fresh.is_arena_allocated());
        drop(fresh);
        assert!(table.find_existing(b"Fresh").unwrap().is_permanent());
    }

    #[test]
    fn arena_limit_fails_without_touching_the_table() {
        let config = IdentifierTableConfig {
            arena_limit_bytes: Some(core_bytes() + 3),
            ..IdentifierTableConfig::default()
        };
        let table = IdentifierTable::new(&config, 16, Arc::new(MemoryTracker::new())).unwrap();
        table.intern_permanent(b"abc").unwrap();
        let before = table.len();
        let err = table.intern_permanent(b"d").unwrap_err();
        assert!(matches!(err, SymbolError::ArenaExhausted { requested: 1, .. }));
        assert_eq!(table.len(), before);
        assert!(table.find_existing(b"d").is_none());
        // counted rows do not use the arena
        assert!(table.intern(b"d").is_ok());
    }

    #[test]
    fn core_vocabulary_needs_the_arena() {
        let config = IdentifierTableConfig {
            arena_limit_bytes: Some(4),
            ..IdentifierTableConfig::default()
        };
        let result = IdentifierTable::new(&config, 16, Arc::new(MemoryTracker::new()));
        assert!(matches!(result, Err(SymbolError::ArenaExhausted { .. })));
    }

    #[test]
    fn maintenance_sweeps_released_rows() {
        let table = IdentifierTable::with_defaults().unwrap();
        let names: Vec<_> = (0..100).map(|i| format!("name{i}")).collect();
        let held: Vec<_> = names
            .iter()
            .map(|n| table.intern(n.as_bytes()).unwrap())
            .collect();
        let keep = held[7].clone();
        drop(held);

        let report = table.run_maintenance();
        assert!(!report.grew);
        assert_eq!(report.removed, 99);
        assert_eq!(table.len(), CoreId::ALL.len() + 1);
        assert_eq!(table.find_existing(b"name7").unwrap(), keep);
        assert_eq!(table.statistics().removed_total, 99);
        assert_eq!(table.tracker().get(MemoryCategory::Identifiers).items, table.len() as u64);
        table.verify();
    }

    #[test]
    fn maintenance_grows_crowded_tables() {
        let config = IdentifierTableConfig {
            initial_size_log2: 2,
            ..IdentifierTableConfig::default()
        };
        let table = IdentifierTable::new(&config, 1, Arc::new(MemoryTracker::new())).unwrap();
        let notifier = Arc::new(CountingNotifier::default());
        table.set_notifier(notifier.clone());

        let held: Vec<_> = (0..100)
            .map(|i| table.intern(format!("crowd{i}").as_bytes()).unwrap())
            .collect();
        assert!(table.has_work());
        assert_eq!(notifier.calls.load(Ordering::Relaxed), 1);

        let report = table.run_maintenance();
        assert!(report.grew);
        assert!(!table.has_work());
        assert_eq!(table.statistics().table.size_log2, 3);
        for (i, id) in held.iter().enumerate() {
            assert_eq!(&table.find_existing(format!("crowd{i}").as_bytes()).unwrap(), id);
        }
        table.verify();
    }

    #[test]
    fn busy_table_requeues_cleanup() {
        let table = IdentifierTable::with_defaults().unwrap();
        let notifier = Arc::new(CountingNotifier::default());
        table.set_notifier(notifier.clone());

        let held = table.table.start_bulk_delete(|_| {}).unwrap();
        table.trigger_cleanup();
        let report = table.run_maintenance();
        assert!(report.deferred);
        assert!(table.has_work());
        assert_eq!(notifier.calls.load(Ordering::Relaxed), 2);

        drop(held);
        assert!(!table.run_maintenance().deferred);
        assert!(!table.has_work());
        assert_eq!(notifier.calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn trigger_cleanup_notifies_once_per_pass() {
        let table = IdentifierTable::with_defaults().unwrap();
        let notifier = Arc::new(CountingNotifier::default());
        table.set_notifier(notifier.clone());
        table.trigger_cleanup();
        table.trigger_cleanup();
        assert_eq!(notifier.calls.load(Ordering::Relaxed), 1);
        table.run_maintenance();
        table.trigger_cleanup();
        assert_eq!(notifier.calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn permanent_export_lists_core_and_pinned_rows() {
        let table = IdentifierTable::with_defaults().unwrap();
        let _pinned = table.intern_permanent(b"Pinned").unwrap();
        let _counted = table.intern(b"Counted").unwrap();
        let mut exported = Vec::new();
        table.for_each_permanent(|symbol| exported.push(symbol.to_string()));
        assert_eq!(exported.len(), CoreId::ALL.len() + 1);
        assert!(exported.iter().any(|s| s == "Pinned"));
        assert!(exported.iter().any(|s| s == "java/lang/Object"));
        assert!(!exported.iter().any(|s| s == "Counted"));
    }

    #[test]
    fn batch_interning_returns_handles_in_order() {
        let table = IdentifierTable::with_defaults().unwrap();
        let batch = table
            .intern_batch(&[b"a".as_slice(), b"b".as_slice(), b"a".as_slice()])
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], batch[2]);
        assert_ne!(batch[0], batch[1]);
        assert_eq!(batch[0].refcount(), 2);
    }
}
