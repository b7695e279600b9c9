//! Memory subsystem: the permanent arena and allocation tracking.
//!
//! Components:
//! - `arena`: Never-freed chunked byte arena for permanent identifiers
//! - `tracker`: Memory tracker to record usage by category

pub mod arena;
pub mod tracker;

pub use arena::*;
pub use tracker::*;
