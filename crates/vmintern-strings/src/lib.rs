//! Text interning
//!
//! - `text`: Shared immutable text values and their weak row handles
//! - `table`: The weakly held text table and its maintenance policy

pub mod table;
pub mod text;

pub use table::{TextMaintenance, TextStatistics, TextTable};
pub use text::{Text, WeakText};
