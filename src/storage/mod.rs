//! Concrete `StoragePort` adapters (spec §4.1).

mod memory;
mod sqlite;

pub use memory::InMemoryStoragePort;
pub use sqlite::SqliteStoragePort;
