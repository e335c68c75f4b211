//! Esplora API Client
//!
//! Provides access to Bitcoin blockchain data via the Esplora API.
//! Used for the chain tip, scanning the multisig address history,
//! and broadcasting signed transactions.

use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use bitcoin::{Transaction, Txid};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use super::{IndexedTx, IndexerError};

/// Esplora API endpoints
pub const MAINNET_URL: &str = "https://mempool.space/api";
pub const TESTNET_URL: &str = "https://mempool.space/testnet/api";

/// Esplora returns address history in pages of this many transactions
const CHAIN_PAGE_SIZE: usize = 25;

/// Esplora HTTP client
#[derive(Debug, Clone)]
pub struct EsploraClient {
    client: Client,
    base_url: String,
}

impl EsploraClient {
    /// Create a new client with custom URL
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Create a client whose requests give up after `timeout`
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, IndexerError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get current block height
    pub async fn get_tip_height(&self) -> Result<u64, IndexerError> {
        let url = format!("{}/blocks/tip/height", self.base_url);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(IndexerError::Api {
                code: i64::from(resp.status().as_u16()),
                message: resp.text().await.unwrap_or_default(),
            });
        }

        resp.text()
            .await?
            .trim()
            .parse()
            .map_err(|e| IndexerError::Parse(format!("invalid height: {}", e)))
    }

    /// Get raw transaction
    pub async fn get_tx(&self, txid: &str) -> Result<Transaction, IndexerError> {
        let url = format!("{}/tx/{}/hex", self.base_url, txid);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(IndexerError::NotFound(txid.to_string()));
        }

        let hex = resp.text().await?;
        deserialize_hex(hex.trim()).map_err(|e| IndexerError::Parse(format!("tx {}: {}", txid, e)))
    }

    /// Get the ordered txids of a block
    pub async fn get_block_txids(&self, block_hash: &str) -> Result<Vec<String>, IndexerError> {
        let url = format!("{}/block/{}/txids", self.base_url, block_hash);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(IndexerError::NotFound(format!("block {}", block_hash)));
        }

        Ok(resp.json().await?)
    }

    /// One page of confirmed address history, newest first
    async fn get_address_txs_chain(
        &self,
        address: &str,
        last_seen: Option<&str>,
    ) -> Result<Vec<EsploraTx>, IndexerError> {
        let url = match last_seen {
            Some(txid) => format!("{}/address/{}/txs/chain/{}", self.base_url, address, txid),
            None => format!("{}/address/{}/txs/chain", self.base_url, address),
        };
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(IndexerError::Api {
                code: i64::from(resp.status().as_u16()),
                message: resp.text().await.unwrap_or_default(),
            });
        }

        Ok(resp.json().await?)
    }

    /// Confirmed transactions of `address` with `start <= height < end`,
    /// ordered by `(height, tx_index)`
    pub async fn get_address_txs_in_range(
        &self,
        address: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<IndexedTx>, IndexerError> {
        let mut wanted: Vec<(String, u64, String)> = Vec::new();
        let mut last_seen: Option<String> = None;

        'pages: loop {
            let page = self
                .get_address_txs_chain(address, last_seen.as_deref())
                .await?;

            for entry in &page {
                let (Some(height), Some(hash)) =
                    (entry.status.block_height, entry.status.block_hash.as_ref())
                else {
                    continue;
                };
                if height >= end {
                    continue;
                }
                if height < start {
                    break 'pages;
                }
                wanted.push((entry.txid.clone(), height, hash.clone()));
            }

            if page.len() < CHAIN_PAGE_SIZE {
                break;
            }
            last_seen = page.last().map(|entry| entry.txid.clone());
        }

        let mut block_txids: HashMap<String, Vec<String>> = HashMap::new();
        let mut result = Vec::with_capacity(wanted.len());

        for (txid, height, hash) in wanted {
            if !block_txids.contains_key(&hash) {
                let txids = self.get_block_txids(&hash).await?;
                block_txids.insert(hash.clone(), txids);
            }
            let tx_index = block_txids
                .get(&hash)
                .and_then(|txids| txids.iter().position(|id| *id == txid))
                .ok_or_else(|| IndexerError::NotFound(format!("{} in block {}", txid, hash)))?;

            result.push(IndexedTx {
                tx: self.get_tx(&txid).await?,
                height,
                tx_index: tx_index as u32,
            });
        }

        result.sort_by_key(|indexed| (indexed.height, indexed.tx_index));
        Ok(result)
    }

    /// Broadcast a signed transaction
    pub async fn broadcast_tx(&self, tx: &Transaction) -> Result<Txid, IndexerError> {
        let url = format!("{}/tx", self.base_url);
        let resp = self.client.post(&url).body(serialize_hex(tx)).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(IndexerError::Broadcast(error_text));
        }

        let txid = resp.text().await?;
        Txid::from_str(txid.trim()).map_err(|e| IndexerError::Parse(format!("txid: {}", e)))
    }
}

/// Transaction status
#[derive(Debug, Clone, Deserialize)]
struct EsploraTxStatus {
    block_height: Option<u64>,
    block_hash: Option<String>,
}

/// Address history entry
#[derive(Debug, Clone, Deserialize)]
struct EsploraTx {
    txid: String,
    status: EsploraTxStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_urls() {
        let client = EsploraClient::new("https://mempool.space/testnet/api/");
        assert_eq!(client.base_url(), TESTNET_URL);

        let client = EsploraClient::with_timeout(MAINNET_URL, Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), MAINNET_URL);
    }

    #[test]
    fn test_history_entry_parsing() {
        let body = r#"[
            {"txid":"aa","version":2,"status":{"confirmed":true,"block_height":840000,"block_hash":"00ff","block_time":1}},
            {"txid":"bb","version":2,"status":{"confirmed":false}}
        ]"#;
        let entries: Vec<EsploraTx> = serde_json::from_str(body).unwrap();
        assert_eq!(entries[0].status.block_height, Some(840000));
        assert_eq!(entries[1].status.block_hash, None);
    }
}
