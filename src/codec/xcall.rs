//! xCall envelope
//!
//! Relay messages exchanged with the destination chain are RLP envelopes:
//! `CsMessage { msg_type, payload }` wrapping either a call request or a call
//! result. Outbound withdrawal requests carry a [`WithdrawOrder`] as data.

use alloy_rlp::{BufMut, Decodable, Encodable, Header};

use super::amount::{bytes_to_amount, MAX_SATS};
use super::message::{decode_rlp_bytes, decode_rlp_list, list_length};
use super::rune::BTC_TOKEN_ID;
use super::CodecError;

pub const CS_MESSAGE_REQUEST: u8 = 1;
pub const CS_MESSAGE_RESULT: u8 = 2;

/// Call message types
pub const CALL_MESSAGE: u8 = 0;
pub const CALL_MESSAGE_ROLLBACK: u8 = 1;

/// Result code reporting that the destination call failed
pub const RESULT_FAILURE: u8 = 0;

/// Outer envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsMessage {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

impl CsMessage {
    fn payload_length(&self) -> usize {
        self.msg_type.length() + self.payload.as_slice().length()
    }
}

impl Encodable for CsMessage {
    fn encode(&self, out: &mut dyn BufMut) {
        Header {
            list: true,
            payload_length: self.payload_length(),
        }
        .encode(out);
        self.msg_type.encode(out);
        self.payload.as_slice().encode(out);
    }

    fn length(&self) -> usize {
        list_length(self.payload_length())
    }
}

impl Decodable for CsMessage {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        decode_rlp_list(buf, |body| {
            Ok(Self {
                msg_type: u8::decode(body)?,
                payload: decode_rlp_bytes(body)?,
            })
        })
    }
}

/// Cross-chain call request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsMessageRequest {
    /// Network address of the caller (`<nid>/<address>`)
    pub from: String,
    pub to: String,
    pub sn: u128,
    pub message_type: u8,
    pub data: Vec<u8>,
    pub protocols: Vec<String>,
}

impl CsMessageRequest {
    fn payload_length(&self) -> usize {
        self.from.length()
            + self.to.length()
            + self.sn.length()
            + self.message_type.length()
            + self.data.as_slice().length()
            + self.protocols.length()
    }
}

impl Encodable for CsMessageRequest {
    fn encode(&self, out: &mut dyn BufMut) {
        Header {
            list: true,
            payload_length: self.payload_length(),
        }
        .encode(out);
        self.from.encode(out);
        self.to.encode(out);
        self.sn.encode(out);
        self.message_type.encode(out);
        self.data.as_slice().encode(out);
        self.protocols.encode(out);
    }

    fn length(&self) -> usize {
        list_length(self.payload_length())
    }
}

impl Decodable for CsMessageRequest {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        decode_rlp_list(buf, |body| {
            Ok(Self {
                from: String::decode(body)?,
                to: String::decode(body)?,
                sn: u128::decode(body)?,
                message_type: u8::decode(body)?,
                data: decode_rlp_bytes(body)?,
                protocols: Vec::<String>::decode(body)?,
            })
        })
    }
}

/// Outcome of a call executed on the destination chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsMessageResult {
    pub sn: u128,
    pub code: u8,
    pub message: Vec<u8>,
}

impl CsMessageResult {
    fn payload_length(&self) -> usize {
        self.sn.length() + self.code.length() + self.message.as_slice().length()
    }
}

impl Encodable for CsMessageResult {
    fn encode(&self, out: &mut dyn BufMut) {
        Header {
            list: true,
            payload_length: self.payload_length(),
        }
        .encode(out);
        self.sn.encode(out);
        self.code.encode(out);
        self.message.as_slice().encode(out);
    }

    fn length(&self) -> usize {
        list_length(self.payload_length())
    }
}

impl Decodable for CsMessageResult {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        decode_rlp_list(buf, |body| {
            Ok(Self {
                sn: u128::decode(body)?,
                code: u8::decode(body)?,
                message: decode_rlp_bytes(body)?,
            })
        })
    }
}

/// Withdrawal instruction carried as request data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawOrder {
    pub action: String,
    /// `"0:0"` for bitcoin, otherwise a rune id
    pub token_address: String,
    /// Bitcoin address receiving the funds
    pub to: String,
    /// Big-endian amount bytes
    pub amount: Vec<u8>,
}

impl WithdrawOrder {
    fn payload_length(&self) -> usize {
        self.action.length()
            + self.token_address.length()
            + self.to.length()
            + self.amount.as_slice().length()
    }
}

impl Encodable for WithdrawOrder {
    fn encode(&self, out: &mut dyn BufMut) {
        Header {
            list: true,
            payload_length: self.payload_length(),
        }
        .encode(out);
        self.action.encode(out);
        self.token_address.encode(out);
        self.to.encode(out);
        self.amount.as_slice().encode(out);
    }

    fn length(&self) -> usize {
        list_length(self.payload_length())
    }
}

impl Decodable for WithdrawOrder {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        decode_rlp_list(buf, |body| {
            Ok(Self {
                action: String::decode(body)?,
                token_address: String::decode(body)?,
                to: String::decode(body)?,
                amount: decode_rlp_bytes(body)?,
            })
        })
    }
}

/// Decoded inbound envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XCallEnvelope {
    Request(CsMessageRequest),
    Result(CsMessageResult),
}

/// Decode a relay payload into its request or result
pub fn decode_envelope(bytes: &[u8]) -> Result<XCallEnvelope, CodecError> {
    let outer = CsMessage::decode(&mut &bytes[..])?;
    let mut payload = outer.payload.as_slice();
    match outer.msg_type {
        CS_MESSAGE_REQUEST => Ok(XCallEnvelope::Request(CsMessageRequest::decode(&mut payload)?)),
        CS_MESSAGE_RESULT => Ok(XCallEnvelope::Result(CsMessageResult::decode(&mut payload)?)),
        other => Err(CodecError::Malformed(format!("unknown envelope type {}", other))),
    }
}

/// Wrap call data into a request envelope
pub fn xcall_format(
    data: Vec<u8>,
    from: String,
    to: String,
    sn: u128,
    protocols: Vec<String>,
    message_type: u8,
) -> Vec<u8> {
    let request = CsMessageRequest {
        from,
        to,
        sn,
        message_type,
        data,
        protocols,
    };
    alloy_rlp::encode(CsMessage {
        msg_type: CS_MESSAGE_REQUEST,
        payload: alloy_rlp::encode(&request),
    })
}

/// Wrap a call result into an envelope
pub fn result_format(result: &CsMessageResult) -> Vec<u8> {
    alloy_rlp::encode(CsMessage {
        msg_type: CS_MESSAGE_RESULT,
        payload: alloy_rlp::encode(result),
    })
}

/// Extract the withdrawal order from a request envelope's data.
/// BTC amounts above the total supply are rejected.
pub fn decode_withdraw_order(data: &[u8]) -> Result<WithdrawOrder, CodecError> {
    let order = WithdrawOrder::decode(&mut &data[..])?;
    let amount = bytes_to_amount(&order.amount)?;
    if order.token_address == BTC_TOKEN_ID && amount > u128::from(MAX_SATS) {
        return Err(CodecError::InvalidAmount(format!(
            "{} sats exceeds the bitcoin supply",
            amount
        )));
    }
    Ok(order)
}
