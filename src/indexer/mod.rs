//! Chain Indexer Clients
//!
//! The relayer reads chain state through an [`Indexer`]:
//! - Esplora for block heights, address history and broadcast
//! - UniSat for bitcoin and rune UTXOs and rune balances
//!
//! [`BridgeIndexer`] combines both behind the one trait the listener,
//! selector and router consume.

pub mod esplora;
pub mod unisat;

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use thiserror::Error;

use crate::codec::{RuneBalance, RuneId};
use crate::common::BridgeError;
use crate::tx::Utxo;

pub use esplora::EsploraClient;
pub use unisat::UnisatClient;

/// Indexer errors
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("indexer returned error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("broadcast rejected: {0}")]
    Broadcast(String),
}

impl From<IndexerError> for BridgeError {
    fn from(err: IndexerError) -> Self {
        match err {
            IndexerError::Broadcast(msg) => BridgeError::Broadcast(msg),
            other => BridgeError::Network(other.to_string()),
        }
    }
}

/// One page of UTXOs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoPage {
    pub utxos: Vec<Utxo>,
    /// Total number of UTXOs the indexer knows for the query
    pub total: u64,
}

/// Confirmed transaction with its position in the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedTx {
    pub tx: Transaction,
    pub height: u64,
    /// Position of the transaction within its block
    pub tx_index: u32,
}

/// Read and broadcast access to the bitcoin chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn latest_height(&self) -> Result<u64, IndexerError>;

    /// Confirmed transactions touching `address` with `start <= height < end`
    async fn txs_in_range(
        &self,
        address: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<IndexedTx>, IndexerError>;

    /// Plain bitcoin UTXOs, excluding outputs that carry runes or inscriptions
    async fn bitcoin_utxos(
        &self,
        address: &str,
        cursor: u64,
        size: u64,
    ) -> Result<UtxoPage, IndexerError>;

    /// UTXOs holding `rune_id`, with their full rune balances
    async fn rune_utxos(
        &self,
        address: &str,
        rune_id: &RuneId,
        cursor: u64,
        size: u64,
    ) -> Result<UtxoPage, IndexerError>;

    /// Rune balances held by one output
    async fn rune_balances(&self, txid: &Txid, vout: u32) -> Result<Vec<RuneBalance>, IndexerError>;

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, IndexerError>;
}

/// Esplora for chain data, UniSat for UTXO and rune data
#[derive(Debug, Clone)]
pub struct BridgeIndexer {
    esplora: EsploraClient,
    unisat: UnisatClient,
}

impl BridgeIndexer {
    pub fn new(esplora: EsploraClient, unisat: UnisatClient) -> Self {
        Self { esplora, unisat }
    }

    pub fn from_config(config: &crate::common::BridgeConfig) -> Result<Self, IndexerError> {
        let timeout = std::time::Duration::from_secs(config.request_timeout_secs);
        Ok(Self::new(
            EsploraClient::with_timeout(&config.esplora_url, timeout)?,
            UnisatClient::new(
                &config.unisat_url,
                Some(config.unisat_key.clone()).filter(|key| !key.is_empty()),
                timeout,
            )?,
        ))
    }
}

#[async_trait]
impl Indexer for BridgeIndexer {
    async fn latest_height(&self) -> Result<u64, IndexerError> {
        self.esplora.get_tip_height().await
    }

    async fn txs_in_range(
        &self,
        address: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<IndexedTx>, IndexerError> {
        self.esplora.get_address_txs_in_range(address, start, end).await
    }

    async fn bitcoin_utxos(
        &self,
        address: &str,
        cursor: u64,
        size: u64,
    ) -> Result<UtxoPage, IndexerError> {
        self.unisat.get_btc_utxos(address, cursor, size).await
    }

    async fn rune_utxos(
        &self,
        address: &str,
        rune_id: &RuneId,
        cursor: u64,
        size: u64,
    ) -> Result<UtxoPage, IndexerError> {
        self.unisat.get_rune_utxos(address, rune_id, cursor, size).await
    }

    async fn rune_balances(&self, txid: &Txid, vout: u32) -> Result<Vec<RuneBalance>, IndexerError> {
        self.unisat.get_rune_balances(txid, vout).await
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, IndexerError> {
        self.esplora.broadcast_tx(tx).await
    }
}
