//! Ambient services shared by every vmintern crate.
//!
//! - `config`: TOML configuration with environment overrides and validation
//! - `logging`: `tracing` subscriber installation
//! - `safepoint`: cooperative stop-the-world coordination with a guard proof
//! - `memory`: the permanent arena and per-category memory accounting
//! - `maintenance`: the hook tables use to ask for background work

pub mod config;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod memory;
pub mod safepoint;

pub use config::*;
pub use error::*;
pub use logging::init_logging;
pub use maintenance::*;
pub use memory::*;
pub use safepoint::*;
