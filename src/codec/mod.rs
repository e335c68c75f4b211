//! Wire codecs for bridge payloads
//!
//! Everything the relayer writes into or reads out of Bitcoin transactions
//! and cross-chain envelopes: typed address payloads, amount bytes, the
//! OP_RETURN bridge message, runestone edicts and the xCall envelope.

pub mod address;
pub mod amount;
pub mod message;
pub mod rune;
pub mod xcall;

use thiserror::Error;

use crate::common::BridgeError;

pub use address::{address_to_payload, payload_to_address, AddressType};
pub use amount::{amount_to_bytes, bytes_to_amount, bytes_to_sats};
pub use message::{
    create_bridge_message_scripts, decode_bridge_payload, encode_bridge_payload,
    encode_payload_to_scripts, read_bridge_message, read_bridge_payload, BridgeDecodedMsg,
    XCallMessage, BRIDGE_IDENT, PART_LIMIT,
};
pub use rune::{RuneBalance, RuneEdict, RuneId, BTC_TOKEN_ID};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid rune id: {0}")]
    InvalidRuneId(String),

    #[error("RLP error: {0}")]
    Rlp(#[from] alloy_rlp::Error),

    #[error("no bridge message found in transaction")]
    MessageNotFound,

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<CodecError> for BridgeError {
    fn from(err: CodecError) -> Self {
        BridgeError::Validation(err.to_string())
    }
}
