//! Storage module for the API.
//!
//! Provides storage backends for PostgreSQL and embedded SQLite.

pub(crate) mod codec;
pub mod error;
pub mod traits;

// Storage backend implementations
pub mod postgres;
pub mod sqlite;

pub use error::StorageError;
pub use postgres::PostgresStorageBackend;
pub use sqlite::SqliteStorageBackend;
pub use traits::{ConnectionDependents, Deletion, StorageBackend};
