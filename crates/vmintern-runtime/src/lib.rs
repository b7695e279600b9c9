//! The interning core of a managed runtime, assembled.
//!
//! A [`Runtime`] owns the identifier table, the text table, the loader
//! context graph and the safepoint coordinator they share. With background
//! maintenance enabled it also runs a [`MaintenanceService`] thread that the
//! tables and the graph wake when they have deferred work.

pub mod error;
pub mod runtime;
pub mod service;

pub use error::{Result, RuntimeError};
pub use runtime::{CollectionReport, Runtime, RuntimeStatistics};
pub use service::{MaintenanceService, ServiceStatistics};

pub use vmintern_core::{
    ConfigManager, MutatorHandle, RuntimeConfig, SafepointCoordinator, SafepointGuard,
};
pub use vmintern_loader::{
    ClassDefinition, ContextDescriptor, ContextState, LoaderContext, LoaderObject, PurgeMode,
    PurgeReport,
};
pub use vmintern_strings::Text;
pub use vmintern_symbols::{CoreId, Identifier};
