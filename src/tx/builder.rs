//! BTC Transaction Builder
//!
//! Builds unsigned withdrawal transactions spending from the relayer
//! multisig. Output layout:
//!
//! ```text
//! [bridge receipt chunks] [payment]                                  [change]
//! [bridge receipt chunks] [runestone] [receiver dust] [rune change dust] [change]
//! ```

use bitcoin::{
    absolute::LockTime, transaction::Version, Address, Amount, Network, OutPoint, ScriptBuf,
    Sequence, Transaction, TxIn, TxOut, Witness,
};
use std::str::FromStr;

use super::selector::{select_bitcoin_utxos, select_rune_utxos, SelectionError};
use super::types::{OutputTx, UnsignedTx, Utxo};
use crate::codec::amount::MAX_SATS;
use crate::codec::message::ACTION_WITHDRAW_TO;
use crate::codec::rune::runestone_script;
use crate::codec::xcall::WithdrawOrder;
use crate::codec::{bytes_to_amount, encode_payload_to_scripts, CodecError, RuneEdict, RuneId};
use crate::codec::BTC_TOKEN_ID;
use crate::common::BridgeError;
use crate::indexer::Indexer;
use crate::multisig::MultisigWallet;
use crate::storage::SpentUtxoCache;

/// Value of rune carrier outputs and the smallest change worth keeping
pub const DUST_LIMIT: u64 = 1_000;

/// Smallest payment relayed by standard nodes
pub const MIN_PAYMENT: u64 = 546;

/// Builds unsigned BTC transactions
#[derive(Debug, Clone)]
pub struct TxBuilder {
    /// Network (mainnet, testnet, signet)
    network: Network,
    /// Flat fee charged per output, in sats
    fee_per_output: u64,
}

impl TxBuilder {
    /// Create a new transaction builder
    pub fn new(network: Network, fee_per_output: u64) -> Self {
        Self {
            network,
            fee_per_output,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn fee_per_output(&self) -> u64 {
        self.fee_per_output
    }

    /// Validate a Bitcoin address for this network
    pub fn validate_address(&self, address: &str) -> Result<Address, BuilderError> {
        Address::from_str(address)
            .map_err(|e| BuilderError::InvalidAddress(e.to_string()))?
            .require_network(self.network)
            .map_err(|e| BuilderError::InvalidAddress(e.to_string()))
    }

    /// Fee for a transaction with `outputs` outputs
    pub fn fee_for(&self, outputs: usize) -> Result<u64, BuilderError> {
        (outputs as u64)
            .checked_mul(self.fee_per_output)
            .filter(|fee| *fee <= MAX_SATS)
            .ok_or_else(|| {
                BuilderError::AmountTooLarge(format!(
                    "fee for {} outputs at {} sats each",
                    outputs, self.fee_per_output
                ))
            })
    }

    /// Build the transaction paying out `order`.
    ///
    /// `receipt` is written to the bridge OP_RETURN outputs. Inputs are
    /// reserved in `spent`; on error every reservation made here is released.
    pub async fn build_withdrawal(
        &self,
        indexer: &dyn Indexer,
        spent: &SpentUtxoCache,
        wallet: &MultisigWallet,
        order: &WithdrawOrder,
        receipt: &[u8],
    ) -> Result<UnsignedTx, BuilderError> {
        if order.action != ACTION_WITHDRAW_TO {
            return Err(BuilderError::UnsupportedAction(order.action.clone()));
        }

        let receiver = self.validate_address(&order.to)?;
        let amount = bytes_to_amount(&order.amount)?;
        let multisig_address = wallet.address_on_chain(self.network);
        let multisig_str = multisig_address.to_string();

        let mut outputs: Vec<OutputTx> = encode_payload_to_scripts(receipt)?
            .into_iter()
            .map(OutputTx::OpReturn)
            .collect();

        let mut inputs: Vec<Utxo> = Vec::new();
        let btc_required: u64;

        if order.token_address == BTC_TOKEN_ID {
            let sats = u64::try_from(amount)
                .ok()
                .filter(|sats| *sats <= MAX_SATS)
                .ok_or_else(|| BuilderError::AmountTooLarge(amount.to_string()))?;
            if sats < MIN_PAYMENT {
                return Err(BuilderError::AmountTooSmall(sats));
            }
            outputs.push(OutputTx::Payment {
                address: receiver,
                amount: sats,
            });
            btc_required = sats;
        } else {
            let rune_id = RuneId::from_str(&order.token_address)?;
            let (rune_utxos, change) =
                select_rune_utxos(indexer, spent, &multisig_str, &rune_id, amount, &[]).await?;
            inputs = rune_utxos;

            let runestone_index = outputs.len() as u32;
            let mut edicts = vec![RuneEdict {
                id: rune_id,
                amount,
                output: runestone_index + 1,
            }];
            if change > 0 {
                edicts.push(RuneEdict {
                    id: rune_id,
                    amount: change,
                    output: runestone_index + 2,
                });
            }

            let runestone = match runestone_script(&edicts) {
                Ok(script) => script,
                Err(e) => {
                    spent.release(&outpoints(&inputs));
                    return Err(e.into());
                }
            };
            outputs.push(OutputTx::OpReturn(runestone));
            outputs.push(OutputTx::Payment {
                address: receiver,
                amount: DUST_LIMIT,
            });
            if change > 0 {
                outputs.push(OutputTx::Payment {
                    address: multisig_address.clone(),
                    amount: DUST_LIMIT,
                });
            }
            btc_required = outputs.iter().map(OutputTx::amount).sum();
        }

        let totals = self.fee_for(outputs.len()).and_then(|fee| {
            let needed = checked_total(&[btc_required, fee])?;
            Ok((fee, needed, input_total(&inputs)?))
        });
        let (fee, needed, carried) = match totals {
            Ok(totals) => totals,
            Err(e) => {
                spent.release(&outpoints(&inputs));
                return Err(e);
            }
        };

        if needed > carried {
            let exclude = outpoints(&inputs);
            match select_bitcoin_utxos(indexer, spent, &multisig_str, needed - carried, &exclude)
                .await
            {
                Ok(btc_utxos) => inputs.extend(btc_utxos),
                Err(e) => {
                    spent.release(&exclude);
                    return Err(e.into());
                }
            }
        }

        let total_in = match input_total(&inputs) {
            Ok(v) => v,
            Err(e) => {
                spent.release(&outpoints(&inputs));
                return Err(e);
            }
        };
        let leftover = total_in.saturating_sub(needed);

        // Sub-dust leftovers are absorbed into the fee
        let (change, fee) = if leftover >= DUST_LIMIT {
            outputs.push(OutputTx::Payment {
                address: multisig_address,
                amount: leftover,
            });
            (leftover, fee)
        } else {
            (0, fee + leftover)
        };

        let tx = build_multisig_tx(&inputs, &outputs);

        tracing::info!(
            target: "bridge::tx",
            txid = %tx.compute_txid(),
            inputs = inputs.len(),
            outputs = outputs.len(),
            fee = fee,
            change = change,
            token = %order.token_address,
            "Built withdrawal transaction"
        );

        Ok(UnsignedTx {
            tx,
            utxos: inputs,
            fee,
            change,
        })
    }
}

fn outpoints(utxos: &[Utxo]) -> Vec<OutPoint> {
    utxos.iter().map(Utxo::outpoint).collect()
}

fn checked_total(values: &[u64]) -> Result<u64, BuilderError> {
    values
        .iter()
        .try_fold(0u64, |acc, v| acc.checked_add(*v))
        .filter(|total| *total <= MAX_SATS)
        .ok_or_else(|| BuilderError::AmountTooLarge(format!("sum of {:?}", values)))
}

fn input_total(inputs: &[Utxo]) -> Result<u64, BuilderError> {
    let amounts: Vec<u64> = inputs.iter().map(|u| u.amount).collect();
    checked_total(&amounts)
}

/// Assemble an unsigned version 2 transaction with RBF-enabled inputs
pub fn build_multisig_tx(inputs: &[Utxo], outputs: &[OutputTx]) -> Transaction {
    let input = inputs
        .iter()
        .map(|utxo| TxIn {
            previous_output: utxo.outpoint(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        })
        .collect();

    let output = outputs
        .iter()
        .map(|out| match out {
            OutputTx::Payment { address, amount } => TxOut {
                value: Amount::from_sat(*amount),
                script_pubkey: address.script_pubkey(),
            },
            OutputTx::OpReturn(script) => TxOut {
                value: Amount::ZERO,
                script_pubkey: script.clone(),
            },
        })
        .collect();

    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input,
        output,
    }
}

/// Builder errors
#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("amount too small: {0} sats")]
    AmountTooSmall(u64),

    #[error("amount too large: {0}")]
    AmountTooLarge(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Selection(#[from] SelectionError),
}

impl From<BuilderError> for BridgeError {
    fn from(err: BuilderError) -> Self {
        match err {
            BuilderError::Selection(e) => e.into(),
            BuilderError::Codec(e) => e.into(),
            other => BridgeError::Validation(other.to_string()),
        }
    }
}
