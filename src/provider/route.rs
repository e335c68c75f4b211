//! Outbound routing
//!
//! A message addressed to this chain is either a withdrawal request or a
//! failed-call result that refunds the original deposit. The master builds,
//! co-signs and broadcasts the payout; a slave records the message and signs
//! only when the master presents a transaction that pays it out.

use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, MutexGuard};
use std::time::Instant;

use bitcoin::{OutPoint, Transaction, Txid};
use thiserror::Error;

use super::{BridgeProvider, RelayMessage};
use crate::codec::message::ACTION_WITHDRAW_TO;
use crate::codec::rune::decode_runestone;
use crate::codec::xcall::{
    decode_envelope, decode_withdraw_order, WithdrawOrder, XCallEnvelope, RESULT_FAILURE,
};
use crate::codec::{amount_to_bytes, bytes_to_amount, read_bridge_payload, RuneId, BTC_TOKEN_ID};
use crate::common::{
    generate_correlation_id, log_security_event, log_signing_event, log_withdrawal_event,
    BridgeError, NodeMode,
};
use crate::signing::{check_inputs, combine_signatures, SignRequest};
use crate::storage::PendingSignRequest;
use crate::tx::{UnsignedTx, DUST_LIMIT};

/// What a relay message asks the bitcoin side to pay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawPlan {
    pub order: WithdrawOrder,
    /// Bytes written to the bridge OP_RETURN outputs of the payout
    pub receipt: Vec<u8>,
    /// Deposit being refunded, for rollbacks
    pub refund_of: Option<u64>,
}

/// Why a slave refused to co-sign
#[derive(Debug, Error)]
pub enum CosignError {
    #[error("no pending message for sn {0}")]
    UnknownMessage(u64),

    #[error("sn {sn} was already signed for transaction {signed}")]
    Conflict { sn: u64, signed: String },

    #[error("sign request rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Internal(#[from] BridgeError),
}

impl BridgeProvider {
    // ========================================================================
    // Per-Sn serialization
    // ========================================================================

    fn sn_locks(&self) -> MutexGuard<'_, std::collections::HashMap<u64, Arc<tokio::sync::Mutex<()>>>> {
        self.sn_locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `work` while holding the lock for `sn`
    async fn with_sn_lock<T>(&self, sn: u64, work: impl Future<Output = T>) -> T {
        let lock = Arc::clone(self.sn_locks().entry(sn).or_default());
        let out = {
            let _guard = lock.lock().await;
            work.await
        };

        let mut locks = self.sn_locks();
        // Only the map and this call still hold it: nobody is waiting
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(&sn);
        }
        out
    }

    // ========================================================================
    // Planning
    // ========================================================================

    /// Decode what `message` asks to pay out.
    /// `Ok(None)` for results that need no bitcoin transaction.
    pub async fn plan_withdrawal(
        &self,
        message: &RelayMessage,
    ) -> Result<Option<WithdrawPlan>, BridgeError> {
        match decode_envelope(&message.data)? {
            XCallEnvelope::Request(request) => {
                let order = decode_withdraw_order(&request.data)?;
                Ok(Some(WithdrawPlan {
                    order,
                    receipt: request.data,
                    refund_of: None,
                }))
            }
            XCallEnvelope::Result(result) if result.code == RESULT_FAILURE => {
                let deposit_sn = u64::try_from(result.sn).map_err(|_| {
                    BridgeError::validation(format!("rollback sn {} out of range", result.sn))
                })?;
                let deposit = self.store.require_deposit(deposit_sn).await?;
                if let Some(refund_txid) = &deposit.refund_txid {
                    tracing::warn!(
                        target: "bridge::provider",
                        sn = message.sn,
                        deposit_sn = deposit_sn,
                        refund_txid = %refund_txid,
                        "Deposit already refunded"
                    );
                    log_security_event(
                        "refund_replayed",
                        false,
                        serde_json::json!({
                            "sn": message.sn,
                            "deposit_sn": deposit_sn,
                            "refund_txid": refund_txid,
                        }),
                        None,
                    );
                    return Ok(None);
                }
                if deposit.sender.is_empty() {
                    return Err(BridgeError::validation(format!(
                        "deposit {} has no refund address",
                        deposit_sn
                    )));
                }

                let order = WithdrawOrder {
                    action: ACTION_WITHDRAW_TO.to_string(),
                    token_address: deposit.token,
                    to: deposit.sender,
                    amount: amount_to_bytes(deposit.amount),
                };
                Ok(Some(WithdrawPlan {
                    receipt: alloy_rlp::encode(&order),
                    order,
                    refund_of: Some(deposit_sn),
                }))
            }
            XCallEnvelope::Result(result) => {
                tracing::debug!(
                    target: "bridge::provider",
                    sn = message.sn,
                    code = result.code,
                    "Call result needs no payout"
                );
                Ok(None)
            }
        }
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Handle a message addressed to this chain.
    ///
    /// Returns the broadcast txid on the master; `None` on a slave or when
    /// nothing had to be paid.
    pub async fn route(&self, message: &RelayMessage) -> Result<Option<Txid>, BridgeError> {
        if message.dst != self.nid {
            tracing::debug!(
                target: "bridge::provider",
                sn = message.sn,
                dst = %message.dst,
                "Message is not addressed to this chain"
            );
            return Ok(None);
        }

        tracing::info!(
            target: "bridge::provider",
            sn = message.sn,
            src = %message.src,
            mode = ?self.mode,
            "Routing message"
        );

        self.with_sn_lock(message.sn, self.route_locked(message))
            .await
    }

    async fn route_locked(&self, message: &RelayMessage) -> Result<Option<Txid>, BridgeError> {
        let Some(plan) = self.plan_withdrawal(message).await? else {
            return Ok(None);
        };
        match self.mode {
            NodeMode::Master => self.pay_out(message.sn, &plan).await.map(Some),
            NodeMode::Slave => {
                self.remember(message).await?;
                Ok(None)
            }
        }
    }

    /// Slave: keep the message until the master asks for signatures
    async fn remember(&self, message: &RelayMessage) -> Result<(), BridgeError> {
        if self.store.get_pending(message.sn).await?.is_some() {
            return Ok(());
        }
        self.store
            .save_pending(message.sn, &PendingSignRequest::new(message.clone()))
            .await?;
        tracing::info!(
            target: "bridge::provider",
            sn = message.sn,
            "Stored message for co-signing"
        );
        Ok(())
    }

    /// Master: build, sign with the slaves, broadcast
    async fn pay_out(&self, sn: u64, plan: &WithdrawPlan) -> Result<Txid, BridgeError> {
        let amount = bytes_to_amount(&plan.order.amount).unwrap_or_default();
        let unsigned = self
            .builder
            .build_withdrawal(
                self.indexer.as_ref(),
                &self.spent,
                &self.wallet,
                &plan.order,
                &plan.receipt,
            )
            .await?;
        let outpoints = unsigned.outpoints();

        match self.sign_and_broadcast(sn, &unsigned).await {
            Ok(txid) => {
                self.spent.mark_spent(&outpoints);
                self.persist_spent(&outpoints).await;
                if let Some(deposit_sn) = plan.refund_of {
                    self.record_refund(deposit_sn, &txid.to_string()).await;
                }
                if let Some(slaves) = &self.slaves {
                    slaves.release(sn).await;
                }
                log_withdrawal_event(
                    if plan.refund_of.is_some() { "refund_broadcast" } else { "withdrawal_broadcast" },
                    sn,
                    &plan.order.to,
                    amount,
                    Some(&txid.to_string()),
                    None,
                );
                Ok(txid)
            }
            Err(e) => {
                self.spent.release(&outpoints);
                log_withdrawal_event(
                    "withdrawal_failed",
                    sn,
                    &plan.order.to,
                    amount,
                    None,
                    Some(&e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// The payout is already on the network, so a failed write is only logged
    async fn persist_spent(&self, outpoints: &[OutPoint]) {
        let ttl = i64::try_from(self.spent.spent_ttl().as_secs()).unwrap_or(i64::MAX);
        let expires_at = chrono::Utc::now().timestamp().saturating_add(ttl);
        if let Err(e) = self.store.save_spent(outpoints, expires_at).await {
            tracing::error!(
                target: "bridge::provider",
                inputs = outpoints.len(),
                error = %e,
                "Failed to persist spent outpoints"
            );
        }
    }

    /// The refund is already on the network, so a failed write is only logged
    async fn record_refund(&self, deposit_sn: u64, txid: &str) {
        if let Err(e) = self.store.mark_refunded(deposit_sn, txid).await {
            tracing::error!(
                target: "bridge::provider",
                deposit_sn = deposit_sn,
                txid = %txid,
                error = %e,
                "Failed to record refund"
            );
        }
    }

    async fn sign_and_broadcast(&self, sn: u64, unsigned: &UnsignedTx) -> Result<Txid, BridgeError> {
        let slaves = self
            .slaves
            .as_ref()
            .ok_or_else(|| BridgeError::internal("master has no slave client"))?;
        let round_id = generate_correlation_id();
        let started = Instant::now();

        let mut sets = vec![self.signer.sign(&unsigned.tx, &unsigned.utxos, &self.wallet)?];
        sets.extend(
            slaves
                .request_signatures(&SignRequest::new(sn, unsigned, &self.wallet))
                .await,
        );

        log_signing_event(
            sn,
            &round_id,
            sets.len(),
            self.wallet.info().required_sigs,
            started.elapsed().as_millis() as u64,
        );

        let signed = combine_signatures(&self.wallet, &unsigned.tx, &unsigned.utxos, &sets)?;
        let txid = self.indexer.broadcast(&signed).await?;
        Ok(txid)
    }

    // ========================================================================
    // Co-signing (slave side)
    // ========================================================================

    /// Sign a payout proposed by the master.
    ///
    /// The transaction must spend the listed UTXOs, carry the receipt of a
    /// message this node observed itself and pay only the order's receiver
    /// besides the multisig. Signatures are stored before they are returned;
    /// asking again for the same transaction returns the stored set.
    pub async fn cosign(&self, request: &SignRequest) -> Result<Vec<String>, CosignError> {
        self.with_sn_lock(request.msg_sn, self.cosign_locked(request))
            .await
    }

    async fn cosign_locked(&self, request: &SignRequest) -> Result<Vec<String>, CosignError> {
        let sn = request.msg_sn;
        if !request.tap_sig_info.matches(&self.wallet) {
            return Err(CosignError::Rejected(
                "tap sig info does not describe this wallet".to_string(),
            ));
        }

        let mut pending = self
            .store
            .get_pending(sn)
            .await
            .map_err(BridgeError::from)?
            .ok_or(CosignError::UnknownMessage(sn))?;

        let tx = request
            .transaction()
            .map_err(|e| CosignError::Rejected(e.to_string()))?;
        check_inputs(&tx, &request.utxos).map_err(|e| CosignError::Rejected(e.to_string()))?;

        let txid = tx.compute_txid().to_string();
        if let Some(sigs) = pending.signatures_for(&txid) {
            return Ok(sigs.to_vec());
        }
        if let Some(signed) = &pending.txid {
            return Err(CosignError::Conflict {
                sn,
                signed: signed.clone(),
            });
        }

        let plan = self
            .plan_withdrawal(&pending.message)
            .await?
            .ok_or_else(|| CosignError::Rejected("message needs no payout".to_string()))?;
        let receipt = read_bridge_payload(&tx).map_err(|e| CosignError::Rejected(e.to_string()))?;
        if receipt != plan.receipt {
            return Err(CosignError::Rejected(
                "bridge receipt does not match the message".to_string(),
            ));
        }
        self.check_payout(&tx, &plan.order)
            .map_err(CosignError::Rejected)?;

        let sigs = self
            .signer
            .sign(&tx, &request.utxos, &self.wallet)
            .map_err(BridgeError::from)?
            .to_hex();

        pending.record_signatures(txid.clone(), sigs.clone());
        self.store
            .save_pending(sn, &pending)
            .await
            .map_err(BridgeError::from)?;

        tracing::info!(
            target: "bridge::provider",
            sn = sn,
            txid = %txid,
            "Co-signed payout"
        );
        Ok(sigs)
    }

    /// Every spendable output must go to the multisig, except exactly one
    /// payment to the order's receiver
    fn check_payout(&self, tx: &Transaction, order: &WithdrawOrder) -> Result<(), String> {
        let receiver = self
            .builder
            .validate_address(&order.to)
            .map_err(|e| e.to_string())?
            .script_pubkey();
        let amount = bytes_to_amount(&order.amount).map_err(|e| e.to_string())?;
        let is_btc = order.token_address == BTC_TOKEN_ID;
        let expected = if is_btc {
            u64::try_from(amount).map_err(|_| format!("amount {} too large", amount))?
        } else {
            DUST_LIMIT
        };

        let mut receiver_index = None;
        for (i, out) in tx.output.iter().enumerate() {
            if out.script_pubkey.is_op_return() || self.wallet.owns(&out.script_pubkey) {
                continue;
            }
            if out.script_pubkey == receiver
                && out.value.to_sat() == expected
                && receiver_index.is_none()
            {
                receiver_index = Some(i);
                continue;
            }
            return Err(format!("output {} pays an unexpected script", i));
        }
        let receiver_index =
            receiver_index.ok_or_else(|| "no payment to the receiver".to_string())?;

        if !is_btc {
            let rune_id = RuneId::from_str(&order.token_address).map_err(|e| e.to_string())?;
            let edicts = tx
                .output
                .iter()
                .find_map(|out| decode_runestone(&out.script_pubkey).ok())
                .ok_or_else(|| "no runestone".to_string())?;
            if !edicts.iter().any(|e| {
                e.id == rune_id && e.amount == amount && e.output as usize == receiver_index
            }) {
                return Err("runestone does not transfer the ordered runes".to_string());
            }
        }
        Ok(())
    }

    /// Drop the pending entry for `sn` once the payout is on the network.
    /// A signed refund is recorded against its deposit first.
    pub async fn release_pending(&self, sn: u64) -> Result<bool, BridgeError> {
        if let Some(pending) = self.store.get_pending(sn).await? {
            if let Some(txid) = &pending.txid {
                if let Ok(Some(WithdrawPlan {
                    refund_of: Some(deposit_sn),
                    ..
                })) = self.plan_withdrawal(&pending.message).await
                {
                    self.record_refund(deposit_sn, txid).await;
                }
            }
        }
        let removed = self.store.delete_pending(sn).await?;
        tracing::debug!(
            target: "bridge::provider",
            sn = sn,
            removed = removed,
            "Released pending message"
        );
        Ok(removed)
    }
}
