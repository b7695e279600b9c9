//! Identifier interning
//!
//! - `symbol`: Immutable byte rows and the counted `Identifier` handle
//! - `table`: The concurrent identifier table and its permanent arena
//! - `vocabulary`: Core identifiers interned permanently at start-up
//! - `error`: Failures surfaced to callers

pub mod error;
pub mod symbol;
pub mod table;
pub mod vocabulary;

pub use error::{Result, SymbolError, MAX_IDENTIFIER_LENGTH};
pub use symbol::{Identifier, Symbol};
pub use table::{IdentifierMaintenance, IdentifierStatistics, IdentifierTable};
pub use vocabulary::{CoreId, CoreIdentifiers};
