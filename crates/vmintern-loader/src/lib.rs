//! Loader contexts and the graph that tracks them
//!
//! - `context`: One class-loading context and the metadata it owns
//! - `graph`: Prepend-only context list with safepoint-gated unload and purge
//! - `cursor`: Shared work-splitting cursor over the live list
//! - `error`: Failures surfaced to callers

pub mod context;
pub mod cursor;
pub mod error;
pub mod graph;

pub use context::{
    ClassDefinition, ContextDescriptor, ContextKind, ContextState, LoaderContext, LoaderObject,
};
pub use cursor::ContextCursor;
pub use error::{LoaderError, Result};
pub use graph::{ContextIter, GraphStatistics, LoaderContextGraph, PurgeMode, PurgeReport};
