//! The loader context graph.
//!
//! Contexts live on a singly linked list whose head is published with an
//! atomic store, so lock-free readers see either a fully built node or none.
//! Nodes are only ever prepended. At a safepoint, dead contexts are unlinked
//! onto a separate unloading list; a later `purge` releases their metadata.
//! Unlinked nodes keep their `next` link so a reader that is still walking
//! through them reaches the rest of the list.

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use vmintern_core::{MaintenanceNotifier, MaintenanceWork, SafepointCoordinator, SafepointGuard};

use crate::context::{ContextDescriptor, ContextState, LoaderContext};
use crate::cursor::{ContextCursor, CursorState};

/// How `purge` may finish its work.
#[derive(Debug, Clone, Copy)]
pub enum PurgeMode<'a> {
    /// All mutators are stopped; deallocate lists are freed right away.
    AtSafepoint(&'a SafepointGuard<'a>),
    /// Mutators are running; deallocate-list cleanup is deferred to the next
    /// safepoint and the maintenance listener is notified.
    Concurrent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub purged: usize,
    pub dropped_dependencies: usize,
    pub released_entries: usize,
    pub deallocated: usize,
    pub cleanup_deferred: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStatistics {
    pub live: usize,
    pub unloading: usize,
    pub classes: usize,
    pub pending_deallocations: usize,
    pub unloaded_total: u64,
    pub purged_total: u64,
    pub cleanup_needed: bool,
    pub active_cursors: usize,
}

pub struct LoaderContextGraph {
    head: ArcSwapOption<LoaderContext>,
    unloading: ArcSwapOption<LoaderContext>,
    lock: Mutex<()>,
    coordinator: Arc<SafepointCoordinator>,
    cursors: Mutex<Vec<Weak<CursorState>>>,
    boot: Arc<LoaderContext>,
    next_id: AtomicU64,
    live: AtomicUsize,
    unloading_count: AtomicUsize,
    unloaded_total: AtomicU64,
    purged_total: AtomicU64,
    cleanup_needed: AtomicBool,
    notifier: RwLock<Option<Arc<dyn MaintenanceNotifier>>>,
}

impl LoaderContextGraph {
    /// Create a graph whose only node is the boot context. Safepoint-only
    /// operations must be proven against `coordinator`.
    pub fn new(coordinator: Arc<SafepointCoordinator>) -> Self {
        let boot = Arc::new(LoaderContext::new(0, ContextDescriptor::boot()));
        Self {
            head: ArcSwapOption::new(Some(Arc::clone(&boot))),
            unloading: ArcSwapOption::empty(),
            lock: Mutex::new(()),
            coordinator,
            cursors: Mutex::new(Vec::new()),
            boot,
            next_id: AtomicU64::new(1),
            live: AtomicUsize::new(1),
            unloading_count: AtomicUsize::new(0),
            unloaded_total: AtomicU64::new(0),
            purged_total: AtomicU64::new(0),
            cleanup_needed: AtomicBool::new(false),
            notifier: RwLock::new(None),
        }
    }

    pub fn set_notifier(&self, notifier: Arc<dyn MaintenanceNotifier>) {
        *self.notifier.write() = Some(notifier);
    }

    pub fn boot(&self) -> &Arc<LoaderContext> {
        &self.boot
    }

    pub fn coordinator(&self) -> &Arc<SafepointCoordinator> {
        &self.coordinator
    }

    /// Register a new context as the head of the live list.
    pub fn add(&self, descriptor: ContextDescriptor) -> Arc<LoaderContext> {
        let _lock = self.lock.lock();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let context = Arc::new(LoaderContext::new(id, descriptor));
        context.next.store(self.head.load_full());
        self.head.store(Some(Arc::clone(&context)));
        self.live.fetch_add(1, Ordering::Relaxed);
        debug!(id, name = context.name(), kind = ?context.kind(), "context registered");
        context
    }

    /// Snapshot walk of the live list, newest first. Never blocks.
    pub fn iter(&self) -> ContextIter {
        ContextIter {
            next: self.head.load_full(),
        }
    }

    /// Visit every live context under the graph lock. At a safepoint the lock
    /// is not taken. `visit` must not call back into `add`.
    pub fn for_each_locked<F>(&self, mut visit: F)
    where
        F: FnMut(&Arc<LoaderContext>),
    {
        let _lock = if self.coordinator.is_at_safepoint() {
            None
        } else {
            Some(self.lock.lock())
        };
        for context in self.iter() {
            visit(&context);
        }
    }

    /// A cursor over the current live list for cooperating scanner threads.
    pub fn cursor(&self) -> ContextCursor {
        let state = Arc::new(CursorState::new(self.head.load_full()));
        let mut cursors = self.cursors.lock();
        cursors.retain(|cursor| cursor.strong_count() > 0);
        cursors.push(Arc::downgrade(&state));
        ContextCursor::new(state)
    }

    fn adjust_cursors(&self, node: &Arc<LoaderContext>) {
        let mut cursors = self.cursors.lock();
        cursors.retain(|cursor| match cursor.upgrade() {
            Some(state) => {
                state.skip(node);
                true
            }
            None => false,
        });
    }

    /// Unlink every dead context onto the unloading list. One walk; a context
    /// kept alive only by a dependency of a context unloaded earlier in the
    /// same walk is unloaded too.
    pub fn unload_dead_contexts(&self, guard: &SafepointGuard<'_>) -> bool {
        self.coordinator.assert_at_safepoint(guard);
        let _lock = self.lock.lock();

        let mut unloaded = 0usize;
        let mut dropped_dependencies = 0usize;
        let mut prev: Option<Arc<LoaderContext>> = None;
        let mut cursor = self.head.load_full();
        while let Some(node) = cursor {
            let next = node.next.load_full();
            if node.is_alive() {
                prev = Some(node);
                cursor = next;
                continue;
            }

            self.adjust_cursors(&node);
            match &prev {
                Some(prev) => prev.next.store(next.clone()),
                None => self.head.store(next.clone()),
            }
            node.set_state(ContextState::Unloading);
            dropped_dependencies += node.drop_dependencies();
            node.unloading_next.store(self.unloading.load_full());
            self.unloading.store(Some(Arc::clone(&node)));
            debug!(id = node.id(), name = node.name(), "context unlinked");

            unloaded += 1;
            cursor = next;
        }

        if unloaded > 0 {
            self.live.fetch_sub(unloaded, Ordering::Relaxed);
            self.unloading_count.fetch_add(unloaded, Ordering::Relaxed);
            self.unloaded_total
                .fetch_add(unloaded as u64, Ordering::Relaxed);
            info!(unloaded, dropped_dependencies, "unloaded dead contexts");
        }
        unloaded > 0
    }

    /// Destroy every context on the unloading list. Dependencies of all of
    /// them are dropped before any metadata is released.
    pub fn purge(&self, mode: PurgeMode<'_>) -> PurgeReport {
        if let PurgeMode::AtSafepoint(guard) = mode {
            self.coordinator.assert_at_safepoint(guard);
        }

        let mut report = PurgeReport::default();
        {
            let _lock = self.lock.lock();
            let mut doomed = Vec::new();
            let mut cursor = self.unloading.swap(None);
            while let Some(node) = cursor {
                cursor = node.unloading_next.swap(None);
                doomed.push(node);
            }

            for node in &doomed {
                report.dropped_dependencies += node.drop_dependencies();
            }
            for node in &doomed {
                report.released_entries += node.release_metadata();
                node.set_state(ContextState::Purged);
            }
            report.purged = doomed.len();
            self.unloading_count.fetch_sub(doomed.len(), Ordering::Relaxed);
            self.purged_total
                .fetch_add(doomed.len() as u64, Ordering::Relaxed);
        }

        match mode {
            PurgeMode::AtSafepoint(guard) => {
                report.deallocated = self.clean_deallocate_lists(guard);
            }
            PurgeMode::Concurrent => {
                let pending = self.iter().any(|context| context.pending_deallocations() > 0);
                if report.purged > 0 || pending {
                    report.cleanup_deferred = true;
                    if !self.cleanup_needed.swap(true, Ordering::AcqRel) {
                        if let Some(notifier) = self.notifier.read().as_ref() {
                            notifier.notify(MaintenanceWork::LoaderCleanup);
                        }
                    }
                }
            }
        }

        if report.purged > 0 {
            debug!(
                purged = report.purged,
                released = report.released_entries,
                deferred = report.cleanup_deferred,
                "purged unloaded contexts"
            );
        }
        report
    }

    /// Free the definitions replaced by redefinition in every live context.
    pub fn clean_deallocate_lists(&self, guard: &SafepointGuard<'_>) -> usize {
        self.coordinator.assert_at_safepoint(guard);
        self.cleanup_needed.store(false, Ordering::Release);
        let mut freed = 0;
        self.for_each_locked(|context| freed += context.free_deallocate_list());
        freed
    }

    pub fn cleanup_needed(&self) -> bool {
        self.cleanup_needed.load(Ordering::Acquire)
    }

    /// Whether `context` is currently on the live list.
    pub fn is_valid(&self, context: &Arc<LoaderContext>) -> bool {
        let mut cursor = self.head.load_full();
        while let Some(node) = cursor {
            if Arc::ptr_eq(&node, context) {
                return true;
            }
            cursor = node.next.load_full();
        }
        false
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn unloading_count(&self) -> usize {
        self.unloading_count.load(Ordering::Relaxed)
    }

    pub fn statistics(&self) -> GraphStatistics {
        let mut stats = GraphStatistics {
            live: self.live_count(),
            unloading: self.unloading_count(),
            unloaded_total: self.unloaded_total.load(Ordering::Relaxed),
            purged_total: self.purged_total.load(Ordering::Relaxed),
            cleanup_needed: self.cleanup_needed(),
            active_cursors: self
                .cursors
                .lock()
                .iter()
                .filter(|cursor| cursor.strong_count() > 0)
                .count(),
            ..GraphStatistics::default()
        };
        for context in self.iter() {
            stats.classes += context.class_count();
            stats.pending_deallocations += context.pending_deallocations();
        }
        stats
    }
}

impl fmt::Debug for LoaderContextGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderContextGraph")
            .field("live", &self.live_count())
            .field("unloading", &self.unloading_count())
            .field("cleanup_needed", &self.cleanup_needed())
            .finish()
    }
}

/// Lock-free iterator over live contexts.
pub struct ContextIter {
    next: Option<Arc<LoaderContext>>,
}

impl Iterator for ContextIter {
    type Item = Arc<LoaderContext>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.next.take()?;
            self.next = node.next.load_full();
            if node.state() == ContextState::Live {
                return Some(node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ClassDefinition, ContextKind, LoaderObject};
    use std::collections::HashSet;
    use std::thread;
    use vmintern_strings::Text;
    use vmintern_symbols::IdentifierTable;

    fn graph() -> LoaderContextGraph {
        LoaderContextGraph::new(SafepointCoordinator::new())
    }

    fn names(graph: &LoaderContextGraph) -> Vec<String> {
        graph.iter().map(|c| c.name().to_string()).collect()
    }

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicUsize,
    }

    impl MaintenanceNotifier for CountingNotifier {
        fn notify(&self, work: MaintenanceWork) {
            assert_eq!(work, MaintenanceWork::LoaderCleanup);
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn contexts_are_prepended() {
        let graph = graph();
        let a = LoaderObject::new("a");
        let b = LoaderObject::new("b");
        graph.add(ContextDescriptor::for_loader(&a));
        graph.add(ContextDescriptor::for_loader(&b));
        assert_eq!(names(&graph), vec!["b", "a", "boot"]);
        assert_eq!(graph.live_count(), 3);
        assert_eq!(graph.boot().kind(), ContextKind::Boot);
    }

    #[test]
    fn dead_contexts_are_unloaded_then_purged() {
        let graph = graph();
        let ids = IdentifierTable::with_defaults().unwrap();
        let keep = LoaderObject::new("keep");
        let gone = LoaderObject::new("gone");
        let kept = graph.add(ContextDescriptor::for_loader(&keep));
        let dead = graph.add(ContextDescriptor::for_loader(&gone));

        let name = ids.intern(b"gone/Main").unwrap();
        dead.retain_identifier(name.clone()).unwrap();
        dead.retain_text(Text::new("literal")).unwrap();
        assert_eq!(name.refcount(), 2);

        drop(gone);
        let coordinator = Arc::clone(graph.coordinator());
        let report = coordinator.execute(|guard| {
            assert!(graph.unload_dead_contexts(guard));
            assert!(!graph.unload_dead_contexts(guard));
            assert_eq!(dead.state(), ContextState::Unloading);
            assert!(!graph.is_valid(&dead));
            assert!(graph.is_valid(&kept));
            graph.purge(PurgeMode::AtSafepoint(guard))
        });

        assert_eq!(report.purged, 1);
        assert_eq!(report.released_entries, 2);
        assert!(!report.cleanup_deferred);
        assert_eq!(dead.state(), ContextState::Purged);
        assert_eq!(name.refcount(), 1);
        assert_eq!(names(&graph), vec!["keep", "boot"]);

        let stats = graph.statistics();
        assert_eq!(stats.live, 2);
        assert_eq!(stats.unloading, 0);
        assert_eq!(stats.unloaded_total, 1);
        assert_eq!(stats.purged_total, 1);
    }

    #[test]
    fn unlinked_nodes_still_lead_to_the_rest_of_the_list() {
        let graph = graph();
        let a = LoaderObject::new("a");
        let b = LoaderObject::new("b");
        graph.add(ContextDescriptor::for_loader(&a));
        let doomed = graph.add(ContextDescriptor::for_loader(&b));

        let stale = graph.iter();
        drop(b);
        graph
            .coordinator()
            .clone()
            .execute(|guard| graph.unload_dead_contexts(guard));

        let seen: Vec<_> = stale.map(|c| c.name().to_string()).collect();
        assert_eq!(seen, vec!["a", "boot"]);
        assert_eq!(doomed.next.load_full().map(|c| c.id()), Some(1));
    }

    #[test]
    fn hidden_context_lives_while_kept_alive() {
        let graph = graph();
        let loader = LoaderObject::new("app");
        let hidden = graph.add(ContextDescriptor::hidden(&loader, "Lambda$1"));
        drop(loader);

        let coordinator = Arc::clone(graph.coordinator());
        assert!(!coordinator.execute(|guard| graph.unload_dead_contexts(guard)));
        hidden.dec_keep_alive();
        assert!(coordinator.execute(|guard| graph.unload_dead_contexts(guard)));
    }

    #[test]
    fn boot_context_is_never_unloaded() {
        let graph = graph();
        let coordinator = Arc::clone(graph.coordinator());
        assert!(!coordinator.execute(|guard| graph.unload_dead_contexts(guard)));
        assert!(graph.is_valid(graph.boot()));
    }

    #[test]
    fn dependency_cascade_unloads_in_one_pass() {
        let graph = graph();
        let base_loader = LoaderObject::new("base");
        let app_loader = LoaderObject::new("app");
        let base = graph.add(ContextDescriptor::for_loader(&base_loader));
        let app = graph.add(ContextDescriptor::for_loader(&app_loader));
        assert!(app.record_dependency(&base));

        drop(base_loader);
        assert!(base.is_alive());
        drop(app_loader);

        let coordinator = Arc::clone(graph.coordinator());
        coordinator.execute(|guard| {
            assert!(graph.unload_dead_contexts(guard));
            graph.purge(PurgeMode::AtSafepoint(guard));
        });
        assert_eq!(app.state(), ContextState::Purged);
        assert_eq!(base.state(), ContextState::Purged);
        assert_eq!(names(&graph), vec!["boot"]);
    }

    #[test]
    #[should_panic(expected = "another coordinator")]
    fn unload_rejects_foreign_safepoint() {
        let graph = graph();
        let other = SafepointCoordinator::new();
        let guard = other.synchronize();
        graph.unload_dead_contexts(&guard);
    }

    #[test]
    fn concurrent_purge_defers_cleanup_and_notifies_once() {
        let graph = graph();
        let notifier = Arc::new(CountingNotifier::default());
        graph.set_notifier(notifier.clone());
        let ids = IdentifierTable::with_defaults().unwrap();

        let live_loader = LoaderObject::new("live");
        let live = graph.add(ContextDescriptor::for_loader(&live_loader));
        let class = ids.intern(b"live/Main").unwrap();
        live.define_class(ClassDefinition::new(class.clone())).unwrap();
        live.redefine_class(ClassDefinition::new(class)).unwrap();

        let gone = LoaderObject::new("gone");
        graph.add(ContextDescriptor::for_loader(&gone));
        drop(gone);

        let coordinator = Arc::clone(graph.coordinator());
        coordinator.execute(|guard| graph.unload_dead_contexts(guard));

        let report = graph.purge(PurgeMode::Concurrent);
        assert_eq!(report.purged, 1);
        assert!(report.cleanup_deferred);
        assert!(graph.cleanup_needed());
        assert_eq!(live.pending_deallocations(), 1);

        graph.purge(PurgeMode::Concurrent);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);

        let freed = coordinator.execute(|guard| graph.clean_deallocate_lists(guard));
        assert_eq!(freed, 1);
        assert!(!graph.cleanup_needed());
        assert_eq!(live.pending_deallocations(), 0);
    }

    #[test]
    fn cursor_hands_each_context_to_one_scanner() {
        let graph = graph();
        let loaders: Vec<_> = (0..200)
            .map(|i| LoaderObject::new(format!("loader-{i}")))
            .collect();
        for loader in &loaders {
            graph.add(ContextDescriptor::for_loader(loader));
        }

        let cursor = graph.cursor();
        let claimed: Vec<Vec<u64>> = thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let cursor = cursor.clone();
                    scope.spawn(move || {
                        let mut mine = Vec::new();
                        while let Some(context) = cursor.try_next() {
                            mine.push(context.id());
                        }
                        mine
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let total: usize = claimed.iter().map(Vec::len).sum();
        let unique: HashSet<u64> = claimed.into_iter().flatten().collect();
        assert_eq!(total, 201);
        assert_eq!(unique.len(), 201);
        assert!(cursor.is_exhausted());
    }

    #[test]
    fn cursor_moves_off_unlinked_context() {
        let graph = graph();
        let a = LoaderObject::new("a");
        let b = LoaderObject::new("b");
        graph.add(ContextDescriptor::for_loader(&a));
        graph.add(ContextDescriptor::for_loader(&b));

        let cursor = graph.cursor();
        drop(b);
        graph
            .coordinator()
            .clone()
            .execute(|guard| graph.unload_dead_contexts(guard));

        let seen: Vec<_> = std::iter::from_fn(|| cursor.try_next())
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(seen, vec!["a", "boot"]);
        assert_eq!(graph.statistics().active_cursors, 1);
        drop(cursor);
        assert_eq!(graph.statistics().active_cursors, 0);
    }

    #[test]
    fn for_each_locked_skips_the_lock_at_a_safepoint() {
        let graph = graph();
        let a = LoaderObject::new("a");
        graph.add(ContextDescriptor::for_loader(&a));

        let mut outside = 0;
        graph.for_each_locked(|_| outside += 1);
        let inside = graph.coordinator().clone().execute(|_guard| {
            let _held = graph.lock.lock();
            let mut count = 0;
            graph.for_each_locked(|_| count += 1);
            count
        });
        assert_eq!(outside, 2);
        assert_eq!(inside, 2);
    }
}
