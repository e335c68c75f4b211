//! Threshold Signing
//!
//! Every party signs the multisig leaf of each relayer-owned input with its
//! own key ([`PartialSigner`]). The master collects at least `k` partial
//! sets, checks them and assembles the script-path witnesses
//! ([`combine_signatures`]). Slaves are reached through [`SlaveClient`].

pub mod combine;
pub mod coordinator;
pub mod partial;

use thiserror::Error;

use crate::common::BridgeError;

pub use combine::combine_signatures;
pub use coordinator::{
    slave_assignments, ReleaseRequest, SignRequest, SlaveClient, TapSigInfo, API_KEY_HEADER,
};
pub use partial::{check_inputs, multisig_sighash, PartialSignatures, PartialSigner};

/// Signing errors
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("key is not part of the multisig policy")]
    KeyNotInPolicy,

    #[error("input mismatch: {0}")]
    InputMismatch(String),

    #[error("sighash error: {0}")]
    Sighash(String),

    #[error("insufficient signatures: need {required}, have {collected}")]
    InsufficientSignatures { required: usize, collected: usize },

    #[error("invalid signature from signer {signer} on input {input}: {reason}")]
    InvalidSignature {
        signer: usize,
        input: usize,
        reason: String,
    },

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<SignerError> for BridgeError {
    fn from(err: SignerError) -> Self {
        BridgeError::Signing(err.to_string())
    }
}
