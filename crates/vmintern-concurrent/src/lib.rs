//! Concurrent primitives behind the vmintern tables
//!
//! - `refcount`: Packed hash/refcount word with lock-free transitions and a sticky permanent state
//! - `hasher`: Deterministic and randomly seeded table hashers
//! - `table`: Concurrent intern table (lock-free reads, CAS inserts, online resize)
//! - `task`: Incremental grow/rehash and bulk-delete tasks over a table

pub mod hasher;
pub mod refcount;
pub mod table;
pub mod task;

pub use hasher::TableHasher;
pub use refcount::{AtomicRefcount, RefcountState, PERMANENT};
pub use table::{ConcurrentInternTable, Inserted, RehashOutcome, TableConfig, TableStatistics};
pub use task::{BulkDeleteTask, MigrationKind, MigrationTask};
