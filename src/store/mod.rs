//! Persistence: conversation history and statistics counters.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use memory::MemoryStore;
pub use traits::{HistoryEntry, HistoryRole, Store, counters};
