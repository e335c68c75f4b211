//! Bitcoin Bridge Relayer
//!
//! The bitcoin side of a cross-chain bridge. Funds sit in a taproot
//! `k`-of-`n` multisig whose leaf is spent with signatures from the relayer
//! nodes.
//!
//! ## Inbound
//!
//! The listener scans the multisig address history, decodes the bridge
//! message carried in OP_RETURN outputs, checks the deposited funds and
//! emits an xCall request for the destination chain.
//!
//! ## Outbound
//!
//! Withdrawal requests and failed-call rollbacks are paid out by the master
//! node: it selects UTXOs, builds the transaction with a receipt in its
//! OP_RETURN outputs, collects partial signatures from the slave nodes over
//! HTTP and broadcasts once the threshold is met. Slaves sign only payouts
//! for messages they observed themselves, and at most one transaction per
//! message.
//!
//! ## Modules
//!
//! - `codec`: bridge message, xCall envelope and runestone encoding
//! - `multisig`: taproot wallet construction
//! - `tx`: UTXO selection and withdrawal building
//! - `signing`: partial signatures, aggregation and the slave client
//! - `indexer`: Esplora and UniSat access
//! - `storage`: pending requests, deposits and scan progress
//! - `provider`: listener and router
//! - `server`: the slave signing endpoint

pub mod codec;
pub mod common;
pub mod indexer;
pub mod multisig;
pub mod provider;
pub mod server;
pub mod signing;
pub mod storage;
pub mod tx;

// Re-exports: configuration and errors
pub use common::{BridgeConfig, BridgeError, Network, NodeMode};

// Re-exports: wallet and transactions
pub use multisig::{MultisigInfo, MultisigWallet};
pub use tx::{TxBuilder, UnsignedTx, Utxo};

// Re-exports: chain access and persistence
pub use indexer::{BridgeIndexer, Indexer};
pub use storage::{BridgeStore, SpentUtxoCache, SqliteKvStore};

// Re-exports: relaying
pub use provider::{BlockInfo, BridgeProvider, RelayMessage};
pub use server::{create_router, AppState};
pub use signing::{PartialSigner, SlaveClient};
