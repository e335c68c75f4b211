//! Master-side signing coordinator
//!
//! Sends the unsigned withdrawal to every slave concurrently and gathers
//! whatever partial signature sets come back. Slaves that fail or time out
//! are logged and skipped; the threshold check happens in
//! [`combine_signatures`](super::combine_signatures).

use std::time::Duration;

use bitcoin::consensus::encode::deserialize_hex;
use bitcoin::Transaction;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use super::{PartialSignatures, SignerError};
use crate::common::BridgeConfig;
use crate::multisig::MultisigWallet;
use crate::tx::{UnsignedTx, Utxo};

/// Header carrying the shared master/slave key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Scripts the slave must find in its own wallet before signing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapSigInfo {
    /// Hex P2TR output script of the wallet
    pub pk_script: String,
    /// Hex multisig leaf script
    pub leaf_script: String,
}

impl TapSigInfo {
    pub fn from_wallet(wallet: &MultisigWallet) -> Self {
        Self {
            pk_script: hex::encode(wallet.pk_script().as_bytes()),
            leaf_script: hex::encode(wallet.multisig_script().as_bytes()),
        }
    }

    /// Whether both scripts describe `wallet`
    pub fn matches(&self, wallet: &MultisigWallet) -> bool {
        *self == Self::from_wallet(wallet)
    }
}

/// Body of `POST /sign`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    pub msg_sn: u64,
    /// Hex consensus encoding of the unsigned transaction
    pub msg_tx: String,
    #[serde(rename = "UTXOs")]
    pub utxos: Vec<Utxo>,
    pub tap_sig_info: TapSigInfo,
}

impl SignRequest {
    pub fn new(msg_sn: u64, unsigned: &UnsignedTx, wallet: &MultisigWallet) -> Self {
        Self {
            msg_sn,
            msg_tx: unsigned.to_hex(),
            utxos: unsigned.utxos.clone(),
            tap_sig_info: TapSigInfo::from_wallet(wallet),
        }
    }

    pub fn transaction(&self) -> Result<Transaction, SignerError> {
        deserialize_hex(&self.msg_tx).map_err(|e| SignerError::InputMismatch(format!("bad tx: {}", e)))
    }
}

/// Body of `POST /release`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub msg_sn: u64,
}

#[derive(Debug, Clone)]
struct SlaveEndpoint {
    signer_index: usize,
    url: String,
}

/// HTTP client for the slave signers
pub struct SlaveClient {
    slaves: Vec<SlaveEndpoint>,
    api_key: String,
    http_client: reqwest::Client,
}

impl SlaveClient {
    /// `slaves` pairs each slave's signer index with its base URL
    pub fn new(
        slaves: Vec<(usize, String)>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SignerError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignerError::Transport(e.to_string()))?;

        Ok(Self {
            slaves: slaves
                .into_iter()
                .map(|(signer_index, url)| SlaveEndpoint {
                    signer_index,
                    url: url.trim_end_matches('/').to_string(),
                })
                .collect(),
            api_key: api_key.into(),
            http_client,
        })
    }

    /// Slaves take the signer indices other than this node's, in order
    pub fn from_config(config: &BridgeConfig) -> Result<Self, SignerError> {
        Self::new(
            slave_assignments(config)?,
            config.api_key.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn slave_count(&self) -> usize {
        self.slaves.len()
    }

    /// Ask every slave to sign; returns the sets that arrived
    pub async fn request_signatures(&self, request: &SignRequest) -> Vec<PartialSignatures> {
        let calls = self.slaves.iter().map(|slave| async move {
            match self.sign_one(slave, request).await {
                Ok(set) => Some(set),
                Err(e) => {
                    tracing::warn!(
                        target: "bridge::signing",
                        sn = request.msg_sn,
                        slave = %slave.url,
                        error = %e,
                        "Slave did not return signatures"
                    );
                    None
                }
            }
        });

        join_all(calls).await.into_iter().flatten().collect()
    }

    async fn sign_one(
        &self,
        slave: &SlaveEndpoint,
        request: &SignRequest,
    ) -> Result<PartialSignatures, SignerError> {
        let response = self
            .http_client
            .post(format!("{}/sign", slave.url))
            .header(API_KEY_HEADER, &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| SignerError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SignerError::Transport(format!("HTTP {}: {}", status, body)));
        }

        let sigs: Vec<String> = response
            .json()
            .await
            .map_err(|e| SignerError::Transport(format!("bad response: {}", e)))?;

        tracing::debug!(
            target: "bridge::signing",
            sn = request.msg_sn,
            signer = slave.signer_index,
            "Received partial signatures"
        );
        PartialSignatures::from_hex(slave.signer_index, &sigs)
    }

    /// Tell every slave to drop its pending request for `sn`.
    /// Best effort: failures are only logged.
    pub async fn release(&self, sn: u64) {
        let body = ReleaseRequest { msg_sn: sn };
        let calls = self.slaves.iter().map(|slave| async move {
            let result = self
                .http_client
                .post(format!("{}/release", slave.url))
                .header(API_KEY_HEADER, &self.api_key)
                .json(&body)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            if let Err(e) = result {
                tracing::warn!(
                    target: "bridge::signing",
                    sn = sn,
                    slave = %slave.url,
                    error = %e,
                    "Failed to release slave request"
                );
            }
        });
        join_all(calls).await;
    }
}

/// Pair each configured slave URL with a signer index, skipping our own
pub fn slave_assignments(config: &BridgeConfig) -> Result<Vec<(usize, String)>, SignerError> {
    let own = config.signer_index().ok_or(SignerError::KeyNotInPolicy)?;
    let others: Vec<usize> = (0..config.pub_keys.len()).filter(|i| *i != own).collect();
    if config.slave_urls.len() > others.len() {
        return Err(SignerError::Transport(format!(
            "{} slave servers for {} co-signers",
            config.slave_urls.len(),
            others.len()
        )));
    }
    Ok(others.into_iter().zip(config.slave_urls.iter().cloned()).collect())
}
