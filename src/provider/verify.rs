//! Deposit parsing and verification
//!
//! A deposit is relayed only when its bridge message asks for `Deposit`
//! through a connector this relayer serves, and the transaction really moves
//! the claimed amount into the multisig.

use std::str::FromStr;

use bitcoin::{Address, Transaction};

use super::{chain_nid, deposit_sn, BridgeProvider, EventType, RelayMessage};
use crate::codec::message::ACTION_DEPOSIT;
use crate::codec::xcall::{xcall_format, CALL_MESSAGE_ROLLBACK};
use crate::codec::{bytes_to_amount, read_bridge_message, RuneId, BTC_TOKEN_ID};
use crate::common::{log_deposit_event, BridgeError};
use crate::indexer::IndexedTx;
use crate::storage::DepositRecord;

impl BridgeProvider {
    /// Turn one transaction into a relay message.
    ///
    /// `Ok(None)` means the transaction is not a deposit for this relayer.
    /// A deposit whose funds do not check out fails with `Verification`.
    pub async fn parse_message_from_tx(
        &self,
        indexed: &IndexedTx,
    ) -> Result<Option<RelayMessage>, BridgeError> {
        let tx = &indexed.tx;
        let txid = tx.compute_txid();

        let bridge_msg = match read_bridge_message(tx) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(
                    target: "bridge::provider",
                    txid = %txid,
                    error = %e,
                    "No bridge message in transaction"
                );
                return Ok(None);
            }
        };

        let message = &bridge_msg.message;
        if message.action != ACTION_DEPOSIT {
            tracing::debug!(
                target: "bridge::provider",
                txid = %txid,
                action = %message.action,
                "Skipping non-deposit bridge message"
            );
            return Ok(None);
        }
        if !bridge_msg
            .connectors
            .iter()
            .any(|c| self.connections.contains(c))
        {
            tracing::warn!(
                target: "bridge::provider",
                txid = %txid,
                connectors = ?bridge_msg.connectors,
                "Deposit through an unknown connector"
            );
            return Ok(None);
        }

        let sn = deposit_sn(indexed.height, indexed.tx_index);
        let amount = bytes_to_amount(&message.amount)?;
        let dst = chain_nid(bridge_msg.chain_id).ok_or_else(|| {
            BridgeError::validation(format!("unknown chain id {}", bridge_msg.chain_id))
        })?;

        self.verify_deposit_amount(tx, &message.token_address, amount)
            .await?;

        let from = format!("{}/{}", self.nid, self.multisig_address);
        let data = xcall_format(
            alloy_rlp::encode(message),
            from,
            bridge_msg.receiver.clone(),
            u128::from(sn),
            bridge_msg.connectors.clone(),
            CALL_MESSAGE_ROLLBACK,
        );

        let sender = self.refund_address(tx, &message.from);
        let record = DepositRecord::new(
            txid.to_string(),
            sender,
            message.token_address.clone(),
            amount,
        );
        self.store.save_deposit(sn, &record).await?;

        log_deposit_event(
            "deposit_detected",
            sn,
            &txid.to_string(),
            &message.token_address,
            amount,
            None,
        );

        Ok(Some(RelayMessage {
            src: self.nid.clone(),
            dst: dst.to_string(),
            sn,
            data,
            message_height: indexed.height,
            event_type: EventType::EmitMessage,
        }))
    }

    /// Check that an output locked to the multisig carries exactly `amount`
    /// of `token`
    async fn verify_deposit_amount(
        &self,
        tx: &Transaction,
        token: &str,
        amount: u128,
    ) -> Result<(), BridgeError> {
        let txid = tx.compute_txid();
        let owned = tx
            .output
            .iter()
            .enumerate()
            .filter(|(_, out)| self.wallet.owns(&out.script_pubkey));

        if token == BTC_TOKEN_ID {
            if owned
                .into_iter()
                .any(|(_, out)| u128::from(out.value.to_sat()) == amount)
            {
                return Ok(());
            }
        } else {
            let rune_id = RuneId::from_str(token)?;
            for (vout, _) in owned {
                let balances = self.indexer.rune_balances(&txid, vout as u32).await?;
                if balances
                    .iter()
                    .any(|b| b.rune_id == rune_id && b.amount == amount)
                {
                    return Ok(());
                }
            }
        }

        Err(BridgeError::verification(format!(
            "transaction {} does not pay {} of {} to the multisig",
            txid, amount, token
        )))
    }

    /// Where a refund for this deposit goes: the declared sender when it is
    /// a valid address, else the first output not locked to the multisig
    fn refund_address(&self, tx: &Transaction, declared: &str) -> String {
        if let Ok(addr) = Address::from_str(declared) {
            if let Ok(addr) = addr.require_network(self.network) {
                return addr.to_string();
            }
        }

        tx.output
            .iter()
            .filter(|out| !self.wallet.owns(&out.script_pubkey))
            .find_map(|out| Address::from_script(&out.script_pubkey, self.network).ok())
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }
}
