//! Bitcoin Bridge Provider
//!
//! The chain-facing half of the relayer:
//! - `listener`: scans the multisig address history and emits deposits as
//!   [`RelayMessage`]s in chain order
//! - `verify`: turns one bridge transaction into a relay message after
//!   checking the funds it claims to move
//! - `route`: pays out withdrawals and rollback refunds, as master or slave

pub mod listener;
pub mod route;
pub mod verify;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::{BridgeConfig, BridgeError, NodeMode};
use crate::indexer::Indexer;
use crate::multisig::MultisigWallet;
use crate::signing::{PartialSigner, SlaveClient};
use crate::storage::{BridgeStore, SpentUtxoCache};
use crate::tx::TxBuilder;

pub use listener::{start_height, RANGE_SIZE};
pub use route::{CosignError, WithdrawPlan};

// ============================================================================
// Chain registry
// ============================================================================

/// Bridge chain ids and the network ids they stand for
pub const CHAIN_REGISTRY: &[(u8, &str)] = &[
    (1, "0x1.icon"),
    (2, "0x1.btc"),
    (3, "0x2.icon"),
    (4, "0x2.btc"),
];

/// Network id for a bridge chain id
pub fn chain_nid(chain_id: u8) -> Option<&'static str> {
    CHAIN_REGISTRY
        .iter()
        .find(|(id, _)| *id == chain_id)
        .map(|(_, nid)| *nid)
}

// ============================================================================
// Relay types
// ============================================================================

/// Kind of event a relay message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    EmitMessage,
    RollbackMessage,
}

/// Message exchanged with the relay core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    pub src: String,
    pub dst: String,
    pub sn: u64,
    #[serde(with = "hex")]
    pub data: Vec<u8>,
    pub message_height: u64,
    pub event_type: EventType,
}

/// Messages found at one height
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub height: u64,
    pub messages: Vec<RelayMessage>,
}

/// Serial number of a deposit: block height in the high half, position in
/// the block in the low half
pub fn deposit_sn(height: u64, tx_index: u32) -> u64 {
    (height << 32) | u64::from(tx_index)
}

// ============================================================================
// Provider
// ============================================================================

/// Shared state of the bitcoin side of the bridge
pub struct BridgeProvider {
    nid: String,
    mode: NodeMode,
    network: bitcoin::Network,
    connections: Vec<String>,
    start_height: u64,
    poll_interval: Duration,
    max_retry_wait: Duration,
    retry_budget: Duration,
    wallet: Arc<MultisigWallet>,
    multisig_address: String,
    indexer: Arc<dyn Indexer>,
    store: BridgeStore,
    spent: Arc<SpentUtxoCache>,
    builder: TxBuilder,
    signer: PartialSigner,
    slaves: Option<SlaveClient>,
    sn_locks: StdMutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
}

impl BridgeProvider {
    /// Wire up a provider. `slaves` is required in master mode.
    pub fn new(
        config: &BridgeConfig,
        indexer: Arc<dyn Indexer>,
        store: BridgeStore,
        spent: Arc<SpentUtxoCache>,
        slaves: Option<SlaveClient>,
    ) -> Result<Self, BridgeError> {
        let network = config.network.bitcoin_network();
        let wallet = MultisigWallet::build(&config.multisig_info())?;
        let signer = PartialSigner::new(config.relayer_key, &wallet)?;

        if config.mode == NodeMode::Master && slaves.is_none() {
            return Err(BridgeError::validation("master mode needs a slave client"));
        }

        let multisig_address = wallet.address_on_chain(network).to_string();
        tracing::info!(
            target: "bridge::provider",
            nid = %config.nid,
            mode = ?config.mode,
            address = %multisig_address,
            signer = signer.signer_index(),
            "Bridge provider ready"
        );

        Ok(Self {
            nid: config.nid.clone(),
            mode: config.mode,
            network,
            connections: config.connections.clone(),
            start_height: config.start_height,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            max_retry_wait: Duration::from_secs(config.max_retry_wait_secs.max(1)),
            retry_budget: Duration::from_secs(config.retry_budget_secs),
            wallet: Arc::new(wallet),
            multisig_address,
            indexer,
            store,
            spent,
            builder: TxBuilder::new(network, config.fee_per_output),
            signer,
            slaves,
            sn_locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn nid(&self) -> &str {
        &self.nid
    }

    pub fn mode(&self) -> NodeMode {
        self.mode
    }

    pub fn wallet(&self) -> &MultisigWallet {
        &self.wallet
    }

    pub fn multisig_address(&self) -> &str {
        &self.multisig_address
    }

    pub fn store(&self) -> &BridgeStore {
        &self.store
    }

    pub fn spent(&self) -> &SpentUtxoCache {
        &self.spent
    }

    pub fn signer(&self) -> &PartialSigner {
        &self.signer
    }

    /// Load outpoints spent by earlier runs into the cache, so a fresh
    /// process does not reselect inputs the indexer still reports
    pub async fn restore_spent(&self) -> Result<usize, BridgeError> {
        let now = chrono::Utc::now().timestamp();
        let live = self.store.live_spent(now).await?;
        for record in &live {
            let remaining = u64::try_from(record.expires_at - now).unwrap_or(0);
            self.spent
                .restore_spent(record.outpoint, Duration::from_secs(remaining));
        }
        tracing::debug!(
            target: "bridge::provider",
            restored = live.len(),
            "Restored spent outpoints"
        );
        Ok(live.len())
    }

    /// Drop expired spent entries from the cache and the store
    pub async fn prune_spent(&self) -> Result<usize, BridgeError> {
        let cached = self.spent.prune();
        let stored = self
            .store
            .prune_spent(chrono::Utc::now().timestamp())
            .await?;
        Ok(cached + stored)
    }
}
