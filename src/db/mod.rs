pub mod repository;
pub mod sqlite;

pub use sqlite::{open_database, open_memory_database};

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Migration v{version} failed: {message}")]
    MigrationFailed { version: i64, message: String },

    #[error("Invalid {field} value: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
