use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use vmintern_core::{
    CategoryStats, ConfigManager, MemoryCategory, MemoryTracker, MutatorHandle, RuntimeConfig,
    SafepointCoordinator, SafepointGuard,
};
use vmintern_loader::{
    ContextDescriptor, GraphStatistics, LoaderContext, LoaderContextGraph, PurgeMode, PurgeReport,
};
use vmintern_strings::{Text, TextMaintenance, TextStatistics, TextTable};
use vmintern_symbols::{
    CoreId, Identifier, IdentifierMaintenance, IdentifierStatistics, IdentifierTable, Symbol,
};

use crate::error::Result;
use crate::service::{MaintenanceService, ServiceStatistics};

/// Everything the maintenance thread shares with the runtime.
pub(crate) struct RuntimeState {
    pub(crate) identifiers: IdentifierTable,
    pub(crate) text: TextTable,
    pub(crate) graph: LoaderContextGraph,
    pub(crate) coordinator: Arc<SafepointCoordinator>,
    pub(crate) tracker: Arc<MemoryTracker>,
}

/// What one `collect` cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    pub unloaded: bool,
    pub purge: PurgeReport,
    /// Text rows found dead by the weak pass
    pub dead_text: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatistics {
    pub identifiers: IdentifierStatistics,
    pub text: TextStatistics,
    pub graph: GraphStatistics,
    pub memory: HashMap<MemoryCategory, CategoryStats>,
    pub safepoints_completed: u64,
    pub mutators: usize,
    pub service: Option<ServiceStatistics>,
}

/// One interning runtime. Create it at start-up and share it by reference;
/// dropping it stops the maintenance thread.
pub struct Runtime {
    // Stopped before the state it works on.
    service: Option<MaintenanceService>,
    state: Arc<RuntimeState>,
    config: RuntimeConfig,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        ConfigManager::validate_config(&config)?;

        let tracker = Arc::new(MemoryTracker::new());
        let coordinator = SafepointCoordinator::new();
        let step_buckets = config.maintenance.step_buckets;
        let state = Arc::new(RuntimeState {
            identifiers: IdentifierTable::new(
                &config.identifiers,
                step_buckets,
                Arc::clone(&tracker),
            )?,
            text: TextTable::new(&config.text, step_buckets, Arc::clone(&tracker)),
            graph: LoaderContextGraph::new(Arc::clone(&coordinator)),
            coordinator,
            tracker,
        });
        state
            .tracker
            .record_alloc(MemoryCategory::LoaderContexts, 1);

        let service = if config.maintenance.background {
            let service = MaintenanceService::start(Arc::clone(&state))?;
            state.identifiers.set_notifier(service.notifier());
            state.text.set_notifier(service.notifier());
            state.graph.set_notifier(service.notifier());
            Some(service)
        } else {
            None
        };

        info!(
            background = service.is_some(),
            core_identifiers = state.identifiers.core().len(),
            "runtime started"
        );
        Ok(Self {
            service,
            state,
            config,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(RuntimeConfig::default())
    }

    /// Build from a loaded configuration file (or defaults).
    pub fn from_manager(manager: ConfigManager) -> Result<Self> {
        Self::new(manager.into_config())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // Identifiers

    pub fn intern_identifier(&self, bytes: &[u8]) -> Result<Identifier> {
        Ok(self.state.identifiers.intern(bytes)?)
    }

    pub fn intern_permanent_identifier(&self, bytes: &[u8]) -> Result<Identifier> {
        Ok(self.state.identifiers.intern_permanent(bytes)?)
    }

    pub fn find_identifier(&self, bytes: &[u8]) -> Option<Identifier> {
        self.state.identifiers.find_existing(bytes)
    }

    pub fn release_identifier(&self, identifier: Identifier) {
        self.state.identifiers.release(identifier);
    }

    pub fn core_identifier(&self, id: CoreId) -> &Identifier {
        self.state.identifiers.core_id(id)
    }

    /// Read-only walk over the permanent identifiers, for image export.
    pub fn for_each_permanent_identifier<F>(&self, visit: F)
    where
        F: FnMut(&Symbol),
    {
        self.state.identifiers.for_each_permanent(visit);
    }

    pub fn identifiers(&self) -> &IdentifierTable {
        &self.state.identifiers
    }

    // Text

    pub fn intern_text(&self, text: &Text) -> Text {
        self.state.text.intern(text)
    }

    pub fn intern_str(&self, content: &str) -> Text {
        self.state.text.intern_str(content)
    }

    pub fn lookup_text(&self, content: &str) -> Option<Text> {
        self.state.text.lookup(content)
    }

    pub fn text(&self) -> &TextTable {
        &self.state.text
    }

    // Loader contexts

    pub fn register_context(&self, descriptor: ContextDescriptor) -> Arc<LoaderContext> {
        let context = self.state.graph.add(descriptor);
        self.state
            .tracker
            .record_alloc(MemoryCategory::LoaderContexts, 1);
        context
    }

    pub fn graph(&self) -> &LoaderContextGraph {
        &self.state.graph
    }

    // Safepoint-bound maintenance

    pub fn safepoints(&self) -> &Arc<SafepointCoordinator> {
        &self.state.coordinator
    }

    /// Register the calling thread as a mutator.
    pub fn attach_mutator(&self) -> MutatorHandle {
        self.state.coordinator.attach()
    }

    pub fn unload_dead_contexts(&self, guard: &SafepointGuard<'_>) -> bool {
        self.state.graph.unload_dead_contexts(guard)
    }

    /// Purge unloaded contexts. Identifiers they held become sweepable, so
    /// identifier maintenance is requested when anything was purged.
    pub fn purge(&self, mode: PurgeMode<'_>) -> PurgeReport {
        let report = self.state.graph.purge(mode);
        if report.purged > 0 {
            self.state
                .tracker
                .record_free(MemoryCategory::LoaderContexts, report.purged as u64);
            self.state.identifiers.trigger_cleanup();
        }
        report
    }

    pub fn run_identifier_maintenance(&self) -> IdentifierMaintenance {
        self.state.identifiers.run_maintenance()
    }

    pub fn run_text_maintenance(&self) -> TextMaintenance {
        self.state.text.run_maintenance()
    }

    /// Collector report of dead text rows after its weak pass.
    pub fn gc_notification(&self, dead_count: usize) {
        self.state.text.gc_notification(dead_count);
    }

    /// One collection cycle from a thread that is not an attached mutator:
    /// unload and purge at a safepoint, then weak processing of the text
    /// table with mutators running.
    pub fn collect(&self) -> CollectionReport {
        let guard = self.state.coordinator.synchronize();
        let report = self.collect_at(&guard);
        drop(guard);
        self.finish_collection(report)
    }

    /// As [`Runtime::collect`], for a thread registered as `mutator`.
    pub fn collect_as(&self, mutator: &MutatorHandle) -> CollectionReport {
        let report = mutator.safepoint(|guard| self.collect_at(guard));
        self.finish_collection(report)
    }

    fn collect_at(&self, guard: &SafepointGuard<'_>) -> CollectionReport {
        let unloaded = self.unload_dead_contexts(guard);
        let purge = self.purge(PurgeMode::AtSafepoint(guard));
        CollectionReport {
            unloaded,
            purge,
            dead_text: 0,
        }
    }

    fn finish_collection(&self, mut report: CollectionReport) -> CollectionReport {
        report.dead_text = self.state.text.count_dead();
        self.gc_notification(report.dead_text);
        debug!(
            unloaded = report.unloaded,
            purged = report.purge.purged,
            dead_text = report.dead_text,
            "collection finished"
        );
        report
    }

    pub fn service(&self) -> Option<&MaintenanceService> {
        self.service.as_ref()
    }

    pub fn statistics(&self) -> RuntimeStatistics {
        RuntimeStatistics {
            identifiers: self.state.identifiers.statistics(),
            text: self.state.text.statistics(),
            graph: self.state.graph.statistics(),
            memory: self.state.tracker.snapshot(),
            safepoints_completed: self.state.coordinator.completed(),
            mutators: self.state.coordinator.attached_mutators(),
            service: self.service.as_ref().map(MaintenanceService::statistics),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("identifiers", &self.state.identifiers)
            .field("text", &self.state.text)
            .field("graph", &self.state.graph)
            .field("service", &self.service)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmintern_core::MaintenanceConfig;
    use vmintern_loader::{ClassDefinition, LoaderObject};

    fn foreground() -> Runtime {
        Runtime::new(RuntimeConfig {
            maintenance: MaintenanceConfig {
                background: false,
                ..MaintenanceConfig::default()
            },
            ..RuntimeConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        let mut config = RuntimeConfig::default();
        config.text.target_load_factor = 0.0;
        assert!(matches!(
            Runtime::new(config),
            Err(crate::RuntimeError::Config(_))
        ));
    }

    #[test]
    fn core_vocabulary_is_permanent() {
        let runtime = foreground();
        let object = runtime.core_identifier(CoreId::JavaLangObject);
        assert!(object.is_permanent());
        let found = runtime.find_identifier(b"java/lang/Object").unwrap();
        assert!(Identifier::ptr_eq(&found, object));

        let mut exported = 0;
        runtime.for_each_permanent_identifier(|_| exported += 1);
        assert_eq!(exported, CoreId::ALL.len());
    }

    #[test]
    fn collect_releases_context_references() {
        let runtime = foreground();
        let loader = LoaderObject::new("app");
        let context = runtime.register_context(ContextDescriptor::for_loader(&loader));
        let name = runtime.intern_identifier(b"app/Main").unwrap();
        context
            .define_class(ClassDefinition::new(name.clone()))
            .unwrap();
        context.retain_text(runtime.intern_str("greeting")).unwrap();
        runtime.release_identifier(name);

        drop(loader);
        let report = runtime.collect();
        assert!(report.unloaded);
        assert_eq!(report.purge.purged, 1);
        assert_eq!(report.dead_text, 1);
        assert!(runtime.identifiers().has_work());

        assert_eq!(runtime.run_identifier_maintenance().removed, 1);
        assert_eq!(runtime.run_text_maintenance().removed, 1);
        assert!(runtime.find_identifier(b"app/Main").is_none());
        assert!(runtime.lookup_text("greeting").is_none());
    }

    #[test]
    fn collect_from_a_mutator_thread() {
        let runtime = foreground();
        let mutator = runtime.attach_mutator();
        let loader = LoaderObject::new("short-lived");
        runtime.register_context(ContextDescriptor::for_loader(&loader));
        drop(loader);

        let report = runtime.collect_as(&mutator);
        assert!(report.unloaded);
        let stats = runtime.statistics();
        assert_eq!(stats.mutators, 1);
        assert_eq!(stats.safepoints_completed, 1);
        assert_eq!(stats.graph.live, 1);
        assert!(stats.service.is_none());
    }

    #[test]
    fn context_accounting_tracks_register_and_purge() {
        let runtime = foreground();
        let loader = LoaderObject::new("app");
        runtime.register_context(ContextDescriptor::for_loader(&loader));
        assert_eq!(
            runtime
                .statistics()
                .memory
                .get(&MemoryCategory::LoaderContexts)
                .map(|s| s.items),
            Some(2)
        );
        drop(loader);
        runtime.collect();
        assert_eq!(
            runtime
                .state
                .tracker
                .get(MemoryCategory::LoaderContexts)
                .items,
            1
        );
    }
}
