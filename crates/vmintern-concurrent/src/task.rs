use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::table::{
    nodes, BucketArray, Chain, ConcurrentInternTable, MaintenanceLease, Node, TableConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationKind {
    /// Twice the buckets, same hasher
    Grow,
    /// Same buckets, new hasher
    Rehash,
}

/// Incremental move of every live row into a successor array.
///
/// Each `step` seals a batch of source buckets and copies their live rows
/// over. The table stays fully usable between steps. Dropping an unfinished
/// task runs it to completion, since a half-sealed array must not outlive
/// the maintenance lease.
pub struct MigrationTask<'t, C: TableConfig> {
    table: &'t ConcurrentInternTable<C>,
    source: Arc<BucketArray<C::Value>>,
    successor: Arc<BucketArray<C::Value>>,
    kind: MigrationKind,
    next_bucket: usize,
    moved: usize,
    dropped: usize,
    published: bool,
    started: Instant,
    _lease: MaintenanceLease<'t>,
}

/// Buckets handled per step when a task is finished implicitly.
const COMPLETION_STEP: usize = 1024;

impl<'t, C: TableConfig> MigrationTask<'t, C> {
    pub(crate) fn new(
        table: &'t ConcurrentInternTable<C>,
        lease: MaintenanceLease<'t>,
        source: Arc<BucketArray<C::Value>>,
        successor: Arc<BucketArray<C::Value>>,
        kind: MigrationKind,
    ) -> Self {
        debug!(
            table = table.name(),
            ?kind,
            from_log2 = source.size_log2,
            to_log2 = successor.size_log2,
            "starting table migration"
        );
        Self {
            table,
            source,
            successor,
            kind,
            next_bucket: 0,
            moved: 0,
            dropped: 0,
            published: false,
            started: Instant::now(),
            _lease: lease,
        }
    }

    pub fn kind(&self) -> MigrationKind {
        self.kind
    }

    /// Source buckets migrated so far and in total.
    pub fn progress(&self) -> (usize, usize) {
        (self.next_bucket, self.source.len())
    }

    pub fn is_complete(&self) -> bool {
        self.published
    }

    pub fn moved(&self) -> usize {
        self.moved
    }

    /// Dead rows left behind instead of moved.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Migrate up to `budget` buckets. Returns true once the successor has
    /// been published.
    pub fn step(&mut self, budget: usize) -> bool {
        if self.published {
            return true;
        }
        let end = self
            .next_bucket
            .saturating_add(budget.max(1))
            .min(self.source.len());
        while self.next_bucket < end {
            self.migrate_bucket(self.next_bucket);
            self.next_bucket += 1;
        }
        if self.next_bucket == self.source.len() {
            self.publish();
        }
        self.published
    }

    pub fn finish(mut self) {
        self.run_to_completion();
    }

    fn run_to_completion(&mut self) {
        while !self.step(COMPLETION_STEP) {}
    }

    fn migrate_bucket(&mut self, index: usize) {
        let slot = &self.source.buckets[index];
        let rows = loop {
            let current = slot.load_full();
            let rows = match &*current {
                Chain::Open(rows) => rows.clone(),
                Chain::Sealed { .. } => return,
            };
            let sealed = Arc::new(Chain::Sealed {
                chain: rows.clone(),
                successor: Arc::clone(&self.successor),
            });
            let prev = slot.compare_and_swap(&current, sealed);
            if Arc::ptr_eq(&*prev, &current) {
                break rows;
            }
        };

        let same_hasher = Arc::ptr_eq(&self.source.hasher, &self.successor.hasher);
        for node in nodes(&rows) {
            let hash = if C::is_dead(&node.value) {
                None
            } else if same_hasher {
                Some(node.hash)
            } else {
                C::rehash(&self.successor.hasher, &node.value)
            };
            match hash {
                Some(hash) => {
                    self.successor.prepend(node.value.clone(), hash);
                    self.moved += 1;
                }
                None => self.dropped += 1,
            }
        }
    }

    fn publish(&mut self) {
        self.table.current.store(Arc::clone(&self.successor));
        self.table.record_migration(self.kind, self.dropped);
        self.published = true;
        info!(
            table = self.table.name(),
            kind = ?self.kind,
            buckets = self.successor.len(),
            moved = self.moved,
            dropped = self.dropped,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "table migration complete"
        );
    }
}

impl<C: TableConfig> Drop for MigrationTask<'_, C> {
    fn drop(&mut self) {
        if !self.published {
            self.run_to_completion();
        }
    }
}

/// Incremental removal of dead rows, resumable between steps.
///
/// Only chains that contain a dead row are rebuilt; the suffix behind the
/// last dead row is shared with the old chain.
pub struct BulkDeleteTask<'t, C, P>
where
    C: TableConfig,
    P: FnMut(&C::Value),
{
    table: &'t ConcurrentInternTable<C>,
    array: Arc<BucketArray<C::Value>>,
    on_removed: P,
    next_bucket: usize,
    removed: usize,
    started: Instant,
    _lease: MaintenanceLease<'t>,
}

impl<'t, C, P> BulkDeleteTask<'t, C, P>
where
    C: TableConfig,
    P: FnMut(&C::Value),
{
    pub(crate) fn new(
        table: &'t ConcurrentInternTable<C>,
        lease: MaintenanceLease<'t>,
        array: Arc<BucketArray<C::Value>>,
        on_removed: P,
    ) -> Self {
        Self {
            table,
            array,
            on_removed,
            next_bucket: 0,
            removed: 0,
            started: Instant::now(),
            _lease: lease,
        }
    }

    /// Rows removed so far.
    pub fn removed(&self) -> usize {
        self.removed
    }

    pub fn progress(&self) -> (usize, usize) {
        (self.next_bucket, self.array.len())
    }

    /// Clean up to `budget` buckets. Returns true when every bucket is done.
    pub fn step(&mut self, budget: usize) -> bool {
        let end = self
            .next_bucket
            .saturating_add(budget.max(1))
            .min(self.array.len());
        while self.next_bucket < end {
            self.clean_bucket(self.next_bucket);
            self.next_bucket += 1;
        }
        self.next_bucket == self.array.len()
    }

    /// Run the remaining buckets and return the total removed.
    pub fn finish(mut self) -> usize {
        while !self.step(COMPLETION_STEP) {}
        debug!(
            table = self.table.name(),
            removed = self.removed,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "dead rows removed"
        );
        self.removed
    }

    fn clean_bucket(&mut self, index: usize) {
        let slot = &self.array.buckets[index];
        loop {
            let current = slot.load_full();
            let Chain::Open(rows) = &*current else {
                return;
            };
            let chain: Vec<&Arc<Node<C::Value>>> = nodes(rows).collect();
            let Some(last_dead) = chain.iter().rposition(|node| C::is_dead(&node.value)) else {
                return;
            };

            let mut rebuilt = chain[last_dead].next.clone();
            let mut dead = Vec::new();
            for node in chain[..=last_dead].iter().rev() {
                if C::is_dead(&node.value) {
                    dead.push(node.value.clone());
                } else {
                    rebuilt = Some(Arc::new(Node {
                        value: node.value.clone(),
                        hash: node.hash,
                        next: rebuilt,
                    }));
                }
            }

            let prev = slot.compare_and_swap(&current, Arc::new(Chain::Open(rebuilt)));
            if Arc::ptr_eq(&*prev, &current) {
                for value in &dead {
                    (self.on_removed)(value);
                }
                self.removed += dead.len();
                self.table.items.fetch_sub(dead.len(), Ordering::Relaxed);
                return;
            }
        }
    }
}
