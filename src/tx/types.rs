//! Transaction building types

use bitcoin::{Address, OutPoint, ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::codec::RuneBalance;

/// Spendable output known to the indexer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    /// Value in satoshis
    pub amount: u64,
    pub pk_script: ScriptBuf,
    /// Set when the output is locked by the relayer wallet
    #[serde(default)]
    pub is_relayers_multisig: bool,
    /// Rune balances held by the output (empty for plain bitcoin)
    #[serde(default)]
    pub runes: Vec<RuneBalance>,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

/// Output requested by the withdrawal builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTx {
    /// Pay `amount` sats to `address`
    Payment { address: Address, amount: u64 },
    /// Zero-value data carrier
    OpReturn(ScriptBuf),
}

impl OutputTx {
    pub fn amount(&self) -> u64 {
        match self {
            OutputTx::Payment { amount, .. } => *amount,
            OutputTx::OpReturn(_) => 0,
        }
    }
}

/// Unsigned transaction ready for the signing round
#[derive(Debug, Clone)]
pub struct UnsignedTx {
    pub tx: Transaction,
    /// Inputs in transaction order; reserved in the spent cache
    pub utxos: Vec<Utxo>,
    /// Fee in sats, including any sub-dust change absorbed into it
    pub fee: u64,
    /// Value of the change output, 0 when none was added
    pub change: u64,
}

impl UnsignedTx {
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.utxos.iter().map(Utxo::outpoint).collect()
    }

    /// Hex serialization for transport
    pub fn to_hex(&self) -> String {
        bitcoin::consensus::encode::serialize_hex(&self.tx)
    }
}
