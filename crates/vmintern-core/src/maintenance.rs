use serde::{Deserialize, Serialize};

/// Kinds of deferred work a component can ask the maintenance service for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaintenanceWork {
    /// Grow or sweep the identifier table
    Identifiers,
    /// Grow, sweep or rehash the text table
    Text,
    /// Finish loader metadata cleanup at a later safepoint
    LoaderCleanup,
}

/// Wakes whoever runs maintenance. Must not block.
pub trait MaintenanceNotifier: Send + Sync {
    fn notify(&self, work: MaintenanceWork);
}
