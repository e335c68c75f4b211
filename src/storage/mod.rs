//! Storage Layer Module
//!
//! Provides persistence for the relayer's in-flight state.
//!
//! This module contains:
//! - Key/value trait definitions for abstraction
//! - SQLite implementation for production
//! - In-memory implementation for testing
//! - Typed bridge records (pending sign requests, deposits, checkpoint)
//! - The spent UTXO cache shared by selection and broadcast

pub mod bridge;
pub mod memory;
pub mod spent;
pub mod sqlite;
pub mod traits;

// Re-exports for convenience
pub use bridge::{BridgeStore, DepositRecord, PendingSignRequest, SpentOutpoint};
pub use memory::MemoryKvStore;
pub use spent::SpentUtxoCache;
pub use sqlite::SqliteKvStore;
pub use traits::{KvStore, StorageError, StorageResult};
