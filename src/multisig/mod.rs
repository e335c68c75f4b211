//! Taproot multisig wallet
//!
//! Builds the relayer's P2TR output: a k-of-n Schnorr multisig leaf, an
//! optional time-locked recovery leaf, and an unspendable internal key.

pub mod script;
pub mod wallet;

use thiserror::Error;

use crate::common::BridgeError;

pub use script::{
    build_multisig_script, build_recovery_script, default_internal_key, nums_point,
    shared_internal_key, SHARED_RANDOM_HEX,
};
pub use wallet::{MultisigInfo, MultisigWallet};

/// Wallet construction errors
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("multisig needs at least one public key")]
    EmptyKeySet,

    #[error("invalid threshold: {required} of {total}")]
    InvalidThreshold { required: usize, total: usize },

    #[error("key error: {0}")]
    Key(String),

    #[error("taproot error: {0}")]
    Taproot(String),
}

impl From<WalletError> for BridgeError {
    fn from(err: WalletError) -> Self {
        BridgeError::Validation(err.to_string())
    }
}
