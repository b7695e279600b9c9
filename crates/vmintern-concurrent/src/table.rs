//! Concurrent intern table.
//!
//! A power-of-two array of buckets published through `ArcSwap`. Each bucket
//! holds an immutable chain of `Arc<Node>`; readers walk a snapshot without
//! locking, writers prepend by compare-and-swap on the bucket, and removal
//! rebuilds the chain prefix in front of the last dead row.
//!
//! Resizing and rehashing migrate into a successor array one bucket at a
//! time. A migrated bucket is sealed with a forwarding pointer: readers scan
//! the sealed rows and then the successor, writers go straight to the
//! successor. Once every bucket is sealed the successor becomes current.

use arc_swap::ArcSwap;
use crossbeam_utils::CachePadded;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vmintern_core::{TableSizing, MAX_TABLE_SIZE_LOG2};

use crate::hasher::TableHasher;
use crate::task::{BulkDeleteTask, MigrationKind, MigrationTask};

/// Row policy of one table.
pub trait TableConfig: Send + Sync + 'static {
    type Key: ?Sized + Hash;
    type Value: Clone + Send + Sync + 'static;

    /// Whether `value` is the row for `key`. Only called when hashes agree.
    fn matches(value: &Self::Value, key: &Self::Key) -> bool;

    /// Dead rows never match and are dropped by cleanup and migration.
    fn is_dead(value: &Self::Value) -> bool;

    /// Hash of a row's key under `hasher`, or `None` if the row died and
    /// should be dropped instead of moved.
    fn rehash(hasher: &TableHasher, value: &Self::Value) -> Option<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inserted<V> {
    /// The candidate was published
    New(V),
    /// A live row already existed; the candidate was discarded
    Existing(V),
}

impl<V> Inserted<V> {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New(_))
    }

    pub fn value(&self) -> &V {
        match self {
            Self::New(v) | Self::Existing(v) => v,
        }
    }

    pub fn into_value(self) -> V {
        match self {
            Self::New(v) | Self::Existing(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RehashOutcome {
    Rehashed,
    /// The table already moved to a seeded hasher once
    AlreadyRehashed,
    /// Another grow, rehash or cleanup holds the table
    ResizeInProgress,
    /// Growth was due, which spreads the chains just as well
    GrowthPreferred,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableStatistics {
    pub name: String,
    pub items: usize,
    pub buckets: usize,
    pub size_log2: u32,
    pub load_factor: f64,
    pub longest_chain: usize,
    pub live_rows: usize,
    pub dead_rows: usize,
    pub seeded_hasher: bool,
    pub rehashed: bool,
    pub needs_rehash: bool,
    pub maintenance_active: bool,
}

pub(crate) type Link<V> = Option<Arc<Node<V>>>;

pub(crate) struct Node<V> {
    pub(crate) value: V,
    pub(crate) hash: u64,
    pub(crate) next: Link<V>,
}

impl<V> Drop for Node<V> {
    // Unlink iteratively; a long chain would otherwise recurse once per node.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.next.take(),
                Err(_) => break,
            }
        }
    }
}

pub(crate) enum Chain<V> {
    Open(Link<V>),
    Sealed {
        chain: Link<V>,
        successor: Arc<BucketArray<V>>,
    },
}

impl<V> Chain<V> {
    pub(crate) fn rows(&self) -> &Link<V> {
        match self {
            Chain::Open(rows) => rows,
            Chain::Sealed { chain, .. } => chain,
        }
    }
}

pub(crate) fn nodes<V>(rows: &Link<V>) -> impl Iterator<Item = &Arc<Node<V>>> {
    std::iter::successors(rows.as_ref(), |node| node.next.as_ref())
}

pub(crate) struct BucketArray<V> {
    pub(crate) buckets: Box<[ArcSwap<Chain<V>>]>,
    pub(crate) mask: usize,
    pub(crate) size_log2: u32,
    pub(crate) hasher: Arc<TableHasher>,
}

impl<V: Clone> BucketArray<V> {
    pub(crate) fn new(size_log2: u32, hasher: Arc<TableHasher>) -> Self {
        let len = 1usize << size_log2;
        let empty = Arc::new(Chain::Open(None));
        let buckets = (0..len)
            .map(|_| ArcSwap::new(Arc::clone(&empty)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buckets,
            mask: len - 1,
            size_log2,
            hasher,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub(crate) fn index(&self, hash: u64) -> usize {
        ((hash ^ (hash >> 32)) as usize) & self.mask
    }

    #[inline]
    pub(crate) fn slot(&self, hash: u64) -> &ArcSwap<Chain<V>> {
        &self.buckets[self.index(hash)]
    }

    /// Prepend a row that is known to be absent. Used while migrating, when
    /// this array is the target and cannot itself be sealed.
    pub(crate) fn prepend(&self, value: V, hash: u64) {
        let slot = self.slot(hash);
        loop {
            let current = slot.load_full();
            let rows = match &*current {
                Chain::Open(rows) => rows.clone(),
                Chain::Sealed { .. } => unreachable!("migration target sealed while in use"),
            };
            let node = Arc::new(Node {
                value: value.clone(),
                hash,
                next: rows,
            });
            let prev = slot.compare_and_swap(&current, Arc::new(Chain::Open(Some(node))));
            if Arc::ptr_eq(&*prev, &current) {
                return;
            }
        }
    }
}

/// Marks the table busy with a structural operation; released on drop.
pub(crate) struct MaintenanceLease<'t> {
    flag: &'t AtomicBool,
}

impl Drop for MaintenanceLease<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct ConcurrentInternTable<C: TableConfig> {
    name: &'static str,
    sizing: TableSizing,
    pub(crate) current: ArcSwap<BucketArray<C::Value>>,
    pub(crate) items: CachePadded<AtomicUsize>,
    maintenance_active: AtomicBool,
    pub(crate) needs_rehash: AtomicBool,
    pub(crate) rehashed: AtomicBool,
    _config: PhantomData<fn() -> C>,
}

impl<C: TableConfig> ConcurrentInternTable<C> {
    pub fn new(name: &'static str, sizing: TableSizing) -> Self {
        let max_size_log2 = sizing.max_size_log2.min(MAX_TABLE_SIZE_LOG2);
        let initial_size_log2 = sizing.initial_size_log2.min(max_size_log2);
        let sizing = TableSizing {
            initial_size_log2,
            max_size_log2,
            ..sizing
        };
        debug!(
            table = name,
            buckets = 1usize << initial_size_log2,
            max_buckets = 1usize << max_size_log2,
            "creating intern table"
        );
        Self {
            name,
            sizing,
            current: ArcSwap::from_pointee(BucketArray::new(
                initial_size_log2,
                Arc::new(TableHasher::deterministic()),
            )),
            items: CachePadded::new(AtomicUsize::new(0)),
            maintenance_active: AtomicBool::new(false),
            needs_rehash: AtomicBool::new(false),
            rehashed: AtomicBool::new(false),
            _config: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn sizing(&self) -> &TableSizing {
        &self.sizing
    }

    /// Rows inserted and not yet removed, dead or alive.
    pub fn len(&self) -> usize {
        self.items.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_log2(&self) -> u32 {
        self.current.load().size_log2
    }

    pub fn bucket_count(&self) -> usize {
        self.current.load().len()
    }

    pub fn load_factor(&self) -> f64 {
        self.len() as f64 / self.bucket_count() as f64
    }

    /// Above the preferred load factor and still allowed to grow.
    pub fn needs_grow(&self) -> bool {
        self.load_factor() > self.sizing.target_load_factor
            && self.size_log2() < self.sizing.max_size_log2
    }

    pub fn needs_rehash(&self) -> bool {
        self.needs_rehash.load(Ordering::Relaxed)
    }

    pub fn is_rehashed(&self) -> bool {
        self.rehashed.load(Ordering::Acquire)
    }

    pub fn is_maintenance_active(&self) -> bool {
        self.maintenance_active.load(Ordering::Acquire)
    }

    pub fn get(&self, key: &C::Key) -> Option<C::Value> {
        self.get_with(key, |_| true)
    }

    /// Find the live row for `key` that `claim` accepts. A rejected row is
    /// treated as dead and the scan continues.
    pub fn get_with<F>(&self, key: &C::Key, mut claim: F) -> Option<C::Value>
    where
        F: FnMut(&C::Value) -> bool,
    {
        let mut array = self.current.load_full();
        loop {
            let hash = array.hasher.hash(key);
            let chain = array.slot(hash).load_full();
            if let Some(found) = self.scan(chain.rows(), hash, key, &mut claim) {
                return Some(found);
            }
            match &*chain {
                Chain::Sealed { successor, .. } => array = Arc::clone(successor),
                Chain::Open(_) => return None,
            }
        }
    }

    /// Return the live row for `key`, or publish the value built by `make`.
    ///
    /// `make` runs at most once and only after a miss; if it fails the table
    /// is untouched. When another thread publishes first, the candidate is
    /// dropped and the winner returned.
    pub fn insert_if_absent<E, M, F>(
        &self,
        key: &C::Key,
        make: M,
        mut claim: F,
    ) -> Result<Inserted<C::Value>, E>
    where
        M: FnOnce() -> Result<C::Value, E>,
        F: FnMut(&C::Value) -> bool,
    {
        if let Some(existing) = self.get_with(key, &mut claim) {
            return Ok(Inserted::Existing(existing));
        }
        let candidate = make()?;

        let mut array = self.current.load_full();
        loop {
            let hash = array.hasher.hash(key);
            let slot = array.slot(hash);
            let current = slot.load_full();
            if let Some(existing) = self.scan(current.rows(), hash, key, &mut claim) {
                return Ok(Inserted::Existing(existing));
            }
            match &*current {
                Chain::Sealed { successor, .. } => array = Arc::clone(successor),
                Chain::Open(rows) => {
                    let node = Arc::new(Node {
                        value: candidate.clone(),
                        hash,
                        next: rows.clone(),
                    });
                    let prev = slot.compare_and_swap(&current, Arc::new(Chain::Open(Some(node))));
                    if Arc::ptr_eq(&*prev, &current) {
                        self.items.fetch_add(1, Ordering::Relaxed);
                        return Ok(Inserted::New(candidate));
                    }
                }
            }
        }
    }

    fn scan<F>(
        &self,
        rows: &Link<C::Value>,
        hash: u64,
        key: &C::Key,
        claim: &mut F,
    ) -> Option<C::Value>
    where
        F: FnMut(&C::Value) -> bool,
    {
        let mut walked = 0;
        let mut found = None;
        for node in nodes(rows) {
            walked += 1;
            if node.hash == hash
                && C::matches(&node.value, key)
                && !C::is_dead(&node.value)
                && claim(&node.value)
            {
                found = Some(node.value.clone());
                break;
            }
        }
        self.note_chain_length(walked);
        found
    }

    fn note_chain_length(&self, walked: usize) {
        if walked > self.sizing.runaway_chain_length && !self.needs_rehash.swap(true, Ordering::Relaxed)
        {
            warn!(
                table = self.name,
                chain_length = walked,
                limit = self.sizing.runaway_chain_length,
                "runaway bucket chain, table marked for rehash"
            );
        }
    }

    pub(crate) fn begin_maintenance(&self) -> Option<MaintenanceLease<'_>> {
        self.maintenance_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| MaintenanceLease {
                flag: &self.maintenance_active,
            })
    }

    /// Start doubling the bucket array. `None` when another structural
    /// operation is running or the table is at its maximum size.
    pub fn start_grow(&self) -> Option<MigrationTask<'_, C>> {
        let lease = self.begin_maintenance()?;
        let source = self.current.load_full();
        if source.size_log2 >= self.sizing.max_size_log2 {
            debug!(table = self.name, size_log2 = source.size_log2, "table at maximum size");
            return None;
        }
        let successor = Arc::new(BucketArray::new(
            source.size_log2 + 1,
            Arc::clone(&source.hasher),
        ));
        Some(MigrationTask::new(
            self,
            lease,
            source,
            successor,
            MigrationKind::Grow,
        ))
    }

    pub fn grow(&self) -> bool {
        match self.start_grow() {
            Some(task) => {
                task.finish();
                true
            }
            None => false,
        }
    }

    pub fn resize_if_needed(&self) -> bool {
        self.needs_grow() && self.grow()
    }

    /// Start moving every row into a same-sized array hashed by `hasher`.
    pub fn start_rehash(&self, hasher: TableHasher) -> Option<MigrationTask<'_, C>> {
        let lease = self.begin_maintenance()?;
        let source = self.current.load_full();
        let successor = Arc::new(BucketArray::new(source.size_log2, Arc::new(hasher)));
        Some(MigrationTask::new(
            self,
            lease,
            source,
            successor,
            MigrationKind::Rehash,
        ))
    }

    pub fn rehash(&self, hasher: TableHasher) -> bool {
        match self.start_rehash(hasher) {
            Some(task) => {
                task.finish();
                true
            }
            None => false,
        }
    }

    /// Move to a randomly seeded hasher, once per table lifetime.
    pub fn rehash_with_new_seed(&self) -> RehashOutcome {
        if self.is_rehashed() {
            warn!(table = self.name, "rehash requested again, table already rehashed");
            return RehashOutcome::AlreadyRehashed;
        }
        if self.rehash(TableHasher::randomized()) {
            RehashOutcome::Rehashed
        } else {
            debug!(table = self.name, "rehash skipped, maintenance in progress");
            RehashOutcome::ResizeInProgress
        }
    }

    /// Start removing dead rows. `on_removed` sees each removed value.
    pub fn start_bulk_delete<P>(&self, on_removed: P) -> Option<BulkDeleteTask<'_, C, P>>
    where
        P: FnMut(&C::Value),
    {
        let lease = self.begin_maintenance()?;
        let array = self.current.load_full();
        Some(BulkDeleteTask::new(self, lease, array, on_removed))
    }

    /// Remove every dead row; `None` if the table is busy.
    pub fn bulk_delete<P>(&self, on_removed: P) -> Option<usize>
    where
        P: FnMut(&C::Value),
    {
        self.start_bulk_delete(on_removed).map(BulkDeleteTask::finish)
    }

    /// Visit every row of the current array. Rows inserted into an unfinished
    /// migration target show up once the migration completes.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&C::Value),
    {
        let array = self.current.load_full();
        for slot in array.buckets.iter() {
            let chain = slot.load();
            for node in nodes(chain.rows()) {
                visit(&node.value);
            }
        }
    }

    pub fn count_dead(&self) -> usize {
        let mut dead = 0;
        self.for_each(|value| {
            if C::is_dead(value) {
                dead += 1;
            }
        });
        dead
    }

    pub fn statistics(&self) -> TableStatistics {
        let array = self.current.load_full();
        let mut stats = TableStatistics {
            name: self.name.to_string(),
            items: self.len(),
            buckets: array.len(),
            size_log2: array.size_log2,
            load_factor: self.len() as f64 / array.len() as f64,
            seeded_hasher: array.hasher.is_seeded(),
            rehashed: self.is_rehashed(),
            needs_rehash: self.needs_rehash(),
            maintenance_active: self.is_maintenance_active(),
            ..TableStatistics::default()
        };
        for slot in array.buckets.iter() {
            let chain = slot.load();
            let mut length = 0;
            for node in nodes(chain.rows()) {
                length += 1;
                if C::is_dead(&node.value) {
                    stats.dead_rows += 1;
                } else {
                    stats.live_rows += 1;
                }
            }
            stats.longest_chain = stats.longest_chain.max(length);
        }
        stats
    }

    /// Check that every row sits in the bucket its hash selects and that the
    /// stored hash matches its content. Panics on corruption; returns the
    /// number of rows checked.
    pub fn verify(&self) -> usize {
        let array = self.current.load_full();
        let mut checked = 0;
        for (index, slot) in array.buckets.iter().enumerate() {
            let chain = slot.load();
            for node in nodes(chain.rows()) {
                assert_eq!(
                    array.index(node.hash),
                    index,
                    "{}: row filed under bucket {index} hashes elsewhere",
                    self.name
                );
                if let Some(expected) = C::rehash(&array.hasher, &node.value) {
                    assert_eq!(
                        node.hash, expected,
                        "{}: stored hash does not match row content",
                        self.name
                    );
                }
                checked += 1;
            }
        }
        checked
    }

    pub(crate) fn record_migration(&self, kind: MigrationKind, dropped: usize) {
        if dropped > 0 {
            self.items.fetch_sub(dropped, Ordering::Relaxed);
        }
        if kind == MigrationKind::Rehash {
            self.rehashed.store(true, Ordering::Release);
            self.needs_rehash.store(false, Ordering::Relaxed);
            info!(table = self.name, "table rehashed with a new seed");
        }
    }
}

impl<C: TableConfig> std::fmt::Debug for ConcurrentInternTable<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentInternTable")
            .field("name", &self.name)
            .field("items", &self.len())
            .field("size_log2", &self.size_log2())
            .field("rehashed", &self.is_rehashed())
            .finish()
    }
}
