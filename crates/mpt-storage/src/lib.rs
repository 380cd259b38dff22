//! Transactional store implementations for mptracker: in-memory and SQLite.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub const CRATE_NAME: &str = "mpt-storage";
