//! Typed bridge records on top of a [`KvStore`]
//!
//! Key layout:
//! - `bitcoin_message_<sn>`: pending sign request (slave side)
//! - `bitcoin_deposit_<sn>`: deposit record used for rollback refunds
//! - `bitcoin_spent_<txid>:<vout>`: outpoint spent by a broadcast payout
//! - `bitcoin_last_height`: listener checkpoint

use bitcoin::OutPoint;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;

use super::traits::{KvStore, StorageError, StorageResult};
use crate::codec::RuneId;
use crate::provider::RelayMessage;

pub const MESSAGE_PREFIX: &str = "bitcoin_message_";
pub const DEPOSIT_PREFIX: &str = "bitcoin_deposit_";
pub const SPENT_PREFIX: &str = "bitcoin_spent_";
pub const LAST_HEIGHT_KEY: &str = "bitcoin_last_height";

pub fn message_key(sn: u64) -> String {
    format!("{}{}", MESSAGE_PREFIX, sn)
}

pub fn deposit_key(sn: u64) -> String {
    format!("{}{}", DEPOSIT_PREFIX, sn)
}

pub fn spent_key(outpoint: &OutPoint) -> String {
    format!("{}{}", SPENT_PREFIX, outpoint)
}

/// A withdrawal this node observed and may be asked to co-sign
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSignRequest {
    pub message: RelayMessage,
    /// Txid of the transaction the signatures below belong to
    pub txid: Option<String>,
    /// Hex signatures, one per input (empty for foreign inputs)
    pub signatures: Option<Vec<String>>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PendingSignRequest {
    pub fn new(message: RelayMessage) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            message,
            txid: None,
            signatures: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Signatures already produced for `txid`, if any
    pub fn signatures_for(&self, txid: &str) -> Option<&[String]> {
        match (&self.txid, &self.signatures) {
            (Some(stored), Some(sigs)) if stored == txid => Some(sigs),
            _ => None,
        }
    }

    pub fn record_signatures(&mut self, txid: String, signatures: Vec<String>) {
        self.txid = Some(txid);
        self.signatures = Some(signatures);
        self.updated_at = chrono::Utc::now().timestamp();
    }
}

/// A verified deposit, kept so it can be refunded if the destination fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRecord {
    pub txid: String,
    /// Bitcoin address that receives a refund
    pub sender: String,
    /// `"0:0"` for bitcoin, otherwise the rune id
    pub token: String,
    pub amount: u128,
    #[serde(default)]
    pub rune_id: Option<RuneId>,
    /// Txid of the refund paid for this deposit
    #[serde(default)]
    pub refund_txid: Option<String>,
    pub created_at: i64,
}

impl DepositRecord {
    pub fn new(txid: String, sender: String, token: String, amount: u128) -> Self {
        let rune_id = token.parse::<RuneId>().ok().filter(|id| !id.is_bitcoin());
        Self {
            txid,
            sender,
            token,
            amount,
            rune_id,
            refund_txid: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// An outpoint consumed by a broadcast payout, kept until the indexer
/// has caught up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentOutpoint {
    pub outpoint: OutPoint,
    /// Unix seconds after which the indexer is trusted again
    pub expires_at: i64,
}

/// Typed facade over the key/value store
#[derive(Clone)]
pub struct BridgeStore {
    kv: Arc<dyn KvStore>,
}

impl BridgeStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.kv.get(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::InvalidData(format!("{}: {}", key, e))),
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> StorageResult<()> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| StorageError::InvalidData(e.to_string()))?;
        self.kv.put(key, &bytes).await
    }

    // ========================================================================
    // Pending sign requests
    // ========================================================================

    pub async fn save_pending(&self, sn: u64, request: &PendingSignRequest) -> StorageResult<()> {
        self.put_json(&message_key(sn), request).await
    }

    pub async fn get_pending(&self, sn: u64) -> StorageResult<Option<PendingSignRequest>> {
        self.get_json(&message_key(sn)).await
    }

    pub async fn delete_pending(&self, sn: u64) -> StorageResult<bool> {
        self.kv.delete(&message_key(sn)).await
    }

    /// All pending requests, ordered by key
    pub async fn list_pending(&self) -> StorageResult<Vec<PendingSignRequest>> {
        self.kv
            .scan_prefix(MESSAGE_PREFIX)
            .await?
            .into_iter()
            .map(|(key, bytes)| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::InvalidData(format!("{}: {}", key, e)))
            })
            .collect()
    }

    // ========================================================================
    // Deposit records
    // ========================================================================

    pub async fn save_deposit(&self, sn: u64, record: &DepositRecord) -> StorageResult<()> {
        self.put_json(&deposit_key(sn), record).await
    }

    pub async fn get_deposit(&self, sn: u64) -> StorageResult<Option<DepositRecord>> {
        self.get_json(&deposit_key(sn)).await
    }

    /// Fetch a deposit that must exist
    pub async fn require_deposit(&self, sn: u64) -> StorageResult<DepositRecord> {
        self.get_deposit(sn)
            .await?
            .ok_or_else(|| StorageError::NotFound(deposit_key(sn)))
    }

    /// Record that deposit `sn` was refunded by `txid`
    pub async fn mark_refunded(&self, sn: u64, txid: &str) -> StorageResult<()> {
        let mut record = self.require_deposit(sn).await?;
        record.refund_txid = Some(txid.to_string());
        self.save_deposit(sn, &record).await
    }

    // ========================================================================
    // Spent outpoints
    // ========================================================================

    pub async fn save_spent(&self, outpoints: &[OutPoint], expires_at: i64) -> StorageResult<()> {
        for outpoint in outpoints {
            let record = SpentOutpoint {
                outpoint: *outpoint,
                expires_at,
            };
            self.put_json(&spent_key(outpoint), &record).await?;
        }
        Ok(())
    }

    /// Spent outpoints still unexpired at `now`
    pub async fn live_spent(&self, now: i64) -> StorageResult<Vec<SpentOutpoint>> {
        let mut live = Vec::new();
        for (key, bytes) in self.kv.scan_prefix(SPENT_PREFIX).await? {
            let record: SpentOutpoint = serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::InvalidData(format!("{}: {}", key, e)))?;
            if record.expires_at > now {
                live.push(record);
            }
        }
        Ok(live)
    }

    /// Delete spent outpoints expired at `now`, returning how many went
    pub async fn prune_spent(&self, now: i64) -> StorageResult<usize> {
        let mut pruned = 0;
        for (key, bytes) in self.kv.scan_prefix(SPENT_PREFIX).await? {
            let expired = serde_json::from_slice::<SpentOutpoint>(&bytes)
                .map(|record| record.expires_at <= now)
                .unwrap_or(true);
            if expired && self.kv.delete(&key).await? {
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    // ========================================================================
    // Checkpoint
    // ========================================================================

    pub async fn last_height(&self) -> StorageResult<Option<u64>> {
        match self.kv.get(LAST_HEIGHT_KEY).await? {
            Some(bytes) => {
                let text = String::from_utf8(bytes)
                    .map_err(|e| StorageError::InvalidData(e.to_string()))?;
                text.trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|e| StorageError::InvalidData(format!("{}: {}", LAST_HEIGHT_KEY, e)))
            }
            None => Ok(None),
        }
    }

    pub async fn save_last_height(&self, height: u64) -> StorageResult<()> {
        self.kv
            .put(LAST_HEIGHT_KEY, height.to_string().as_bytes())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use crate::provider::EventType;
    use crate::storage::{MemoryKvStore, SqliteKvStore};

    fn relay_message(sn: u64) -> RelayMessage {
        RelayMessage {
            src: "0x2.icon".to_string(),
            dst: "0x2.btc".to_string(),
            sn,
            data: vec![0xf8, 0x01, 0x02],
            message_height: 1200,
            event_type: EventType::EmitMessage,
        }
    }

    #[tokio::test]
    async fn test_pending_request_lifecycle() {
        let store = BridgeStore::new(Arc::new(MemoryKvStore::new()));

        let mut request = PendingSignRequest::new(relay_message(42));
        store.save_pending(42, &request).await.unwrap();
        assert_eq!(store.get_pending(42).await.unwrap(), Some(request.clone()));
        assert!(request.signatures_for("abc").is_none());

        request.record_signatures("abc".to_string(), vec!["aa".to_string(), String::new()]);
        store.save_pending(42, &request).await.unwrap();

        let loaded = store.get_pending(42).await.unwrap().unwrap();
        assert_eq!(loaded.signatures_for("abc").unwrap().len(), 2);
        assert!(loaded.signatures_for("other").is_none());

        assert_eq!(store.list_pending().await.unwrap().len(), 1);
        assert!(store.delete_pending(42).await.unwrap());
        assert!(store.get_pending(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deposit_record_on_sqlite() {
        let store = BridgeStore::new(Arc::new(SqliteKvStore::in_memory().unwrap()));

        let record = DepositRecord::new(
            "ff".repeat(32),
            "tb1qsender".to_string(),
            "840000:3".to_string(),
            u128::from(u64::MAX) + 5,
        );
        assert_eq!(record.rune_id, Some(RuneId { block: 840000, tx: 3 }));

        store.save_deposit(7, &record).await.unwrap();
        assert_eq!(store.require_deposit(7).await.unwrap(), record);
        assert!(matches!(
            store.require_deposit(8).await,
            Err(StorageError::NotFound(_))
        ));

        store.mark_refunded(7, "ee").await.unwrap();
        assert_eq!(
            store.require_deposit(7).await.unwrap().refund_txid.as_deref(),
            Some("ee")
        );
        assert!(store.mark_refunded(8, "ee").await.is_err());
    }

    #[tokio::test]
    async fn test_spent_outpoints_expire() {
        let kv = Arc::new(MemoryKvStore::new());
        let store = BridgeStore::new(kv.clone());
        let op = |n: u8| OutPoint::new(bitcoin::Txid::from_byte_array([n; 32]), u32::from(n));

        store.save_spent(&[op(1), op(2)], 1_000).await.unwrap();
        store.save_spent(&[op(3)], 2_000).await.unwrap();
        kv.put(&format!("{}garbage", SPENT_PREFIX), b"{").await.unwrap();

        let mut live = store.live_spent(1_500).await.map(|v| v.len());
        assert!(live.is_err());
        assert_eq!(store.prune_spent(1_500).await.unwrap(), 3);

        live = store.live_spent(1_500).await.map(|v| v.len());
        assert_eq!(live.unwrap(), 1);
        let remaining = store.live_spent(0).await.unwrap();
        assert_eq!(remaining[0].outpoint, op(3));
        assert!(store.live_spent(2_000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_height_checkpoint() {
        let kv = Arc::new(MemoryKvStore::new());
        let store = BridgeStore::new(kv.clone());

        assert_eq!(store.last_height().await.unwrap(), None);
        store.save_last_height(2_500_100).await.unwrap();
        assert_eq!(store.last_height().await.unwrap(), Some(2_500_100));

        kv.put(LAST_HEIGHT_KEY, b"not-a-number").await.unwrap();
        assert!(store.last_height().await.is_err());
    }
}
