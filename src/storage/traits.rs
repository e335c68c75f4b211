//! Storage Trait Definitions
//!
//! The relayer persists a handful of small records (pending sign requests,
//! deposit records, the scan checkpoint) in a key/value store.
//! Implementations can use SQLite (production) or memory (testing).

use async_trait::async_trait;
use thiserror::Error;

use crate::common::BridgeError;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<StorageError> for BridgeError {
    fn from(err: StorageError) -> Self {
        BridgeError::Storage(err.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Byte-oriented key/value store
///
/// Implementations:
/// - `SqliteKvStore` - Production storage with SQLite
/// - `MemoryKvStore` - In-memory storage for testing
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Insert or overwrite a value
    async fn put(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// All entries whose key starts with `prefix`, ordered by key
    async fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>>;
}
