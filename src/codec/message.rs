//! Bridge message codec
//!
//! A bridge message is `RLP(XCallMessage) ‖ chain_id ‖ receiver ‖ connectors…`
//! where receiver and connectors are address payloads. On chain it is split
//! into `PART_LIMIT`-byte chunks, each carried by one
//! `OP_RETURN OP_14 <chunk>` output, in output order.

use alloy_rlp::{BufMut, Decodable, Encodable, Header};
use bitcoin::opcodes::all::{OP_PUSHNUM_14, OP_RETURN};
use bitcoin::opcodes::Opcode;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::{ScriptBuf, Transaction};

use super::address::{address_to_payload, payload_to_address};
use super::CodecError;

/// Bytes of bridge payload per OP_RETURN output
pub const PART_LIMIT: usize = 76;

/// Marker opcode following OP_RETURN in bridge outputs
pub const BRIDGE_IDENT: Opcode = OP_PUSHNUM_14;

/// Action carried by inbound deposits
pub const ACTION_DEPOSIT: &str = "Deposit";

/// Action carried by outbound withdrawals
pub const ACTION_WITHDRAW_TO: &str = "WithdrawTo";

// ============================================================================
// RLP helpers
// ============================================================================

/// Decode one RLP list, handing its body to `f`; the body must be consumed exactly.
pub(crate) fn decode_rlp_list<'a, T>(
    buf: &mut &'a [u8],
    f: impl FnOnce(&mut &'a [u8]) -> alloy_rlp::Result<T>,
) -> alloy_rlp::Result<T> {
    let header = Header::decode(buf)?;
    if !header.list {
        return Err(alloy_rlp::Error::UnexpectedString);
    }
    let data: &'a [u8] = *buf;
    if data.len() < header.payload_length {
        return Err(alloy_rlp::Error::InputTooShort);
    }
    let (mut body, rest) = data.split_at(header.payload_length);
    let value = f(&mut body)?;
    if !body.is_empty() {
        return Err(alloy_rlp::Error::ListLengthMismatch {
            expected: header.payload_length,
            got: header.payload_length - body.len(),
        });
    }
    *buf = rest;
    Ok(value)
}

/// Decode an RLP byte string into an owned buffer
pub(crate) fn decode_rlp_bytes(buf: &mut &[u8]) -> alloy_rlp::Result<Vec<u8>> {
    Ok(Header::decode_bytes(buf, false)?.to_vec())
}

pub(crate) fn list_length(payload_length: usize) -> usize {
    alloy_rlp::length_of_length(payload_length) + payload_length
}

// ============================================================================
// XCallMessage
// ============================================================================

/// Cross-chain call body carried in a bridge message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XCallMessage {
    pub message_type: u8,
    pub action: String,
    pub token_address: String,
    pub from: String,
    pub to: String,
    /// Big-endian amount bytes
    pub amount: Vec<u8>,
    pub data: Vec<u8>,
}

impl XCallMessage {
    fn payload_length(&self) -> usize {
        self.message_type.length()
            + self.action.length()
            + self.token_address.length()
            + self.from.length()
            + self.to.length()
            + self.amount.as_slice().length()
            + self.data.as_slice().length()
    }
}

impl Encodable for XCallMessage {
    fn encode(&self, out: &mut dyn BufMut) {
        Header {
            list: true,
            payload_length: self.payload_length(),
        }
        .encode(out);
        self.message_type.encode(out);
        self.action.encode(out);
        self.token_address.encode(out);
        self.from.encode(out);
        self.to.encode(out);
        self.amount.as_slice().encode(out);
        self.data.as_slice().encode(out);
    }

    fn length(&self) -> usize {
        list_length(self.payload_length())
    }
}

impl Decodable for XCallMessage {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        decode_rlp_list(buf, |body| {
            Ok(Self {
                message_type: u8::decode(body)?,
                action: String::decode(body)?,
                token_address: String::decode(body)?,
                from: String::decode(body)?,
                to: String::decode(body)?,
                amount: decode_rlp_bytes(body)?,
                data: decode_rlp_bytes(body)?,
            })
        })
    }
}

// ============================================================================
// Bridge payload
// ============================================================================

/// Fully decoded bridge message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeDecodedMsg {
    pub message: XCallMessage,
    /// Destination chain id (see the provider's chain registry)
    pub chain_id: u8,
    /// Destination contract
    pub receiver: String,
    /// Connector contracts expected to carry the message
    pub connectors: Vec<String>,
}

/// Serialize a bridge message to its flat payload
pub fn encode_bridge_payload(msg: &BridgeDecodedMsg) -> Result<Vec<u8>, CodecError> {
    let mut payload = alloy_rlp::encode(&msg.message);
    payload.push(msg.chain_id);
    payload.extend(address_to_payload(&msg.receiver)?);
    for connector in &msg.connectors {
        payload.extend(address_to_payload(connector)?);
    }
    Ok(payload)
}

/// Parse a flat bridge payload
pub fn decode_bridge_payload(payload: &[u8]) -> Result<BridgeDecodedMsg, CodecError> {
    let mut buf = payload;
    let message = XCallMessage::decode(&mut buf)?;

    let (&chain_id, rest) = buf
        .split_first()
        .ok_or_else(|| CodecError::Malformed("missing chain id".to_string()))?;
    let (receiver, mut rest) = payload_to_address(rest)?;

    let mut connectors = Vec::new();
    while !rest.is_empty() {
        let (connector, remaining) = payload_to_address(rest)?;
        connectors.push(connector);
        rest = remaining;
    }

    Ok(BridgeDecodedMsg {
        message,
        chain_id,
        receiver,
        connectors,
    })
}

/// Split a payload into `OP_RETURN OP_14 <chunk>` scripts
pub fn encode_payload_to_scripts(payload: &[u8]) -> Result<Vec<ScriptBuf>, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::Malformed("empty bridge payload".to_string()));
    }

    payload
        .chunks(PART_LIMIT)
        .map(|chunk| {
            let push = PushBytesBuf::try_from(chunk.to_vec())
                .map_err(|_| CodecError::Malformed("chunk exceeds push limit".to_string()))?;
            Ok(Builder::new()
                .push_opcode(OP_RETURN)
                .push_opcode(BRIDGE_IDENT)
                .push_slice(push)
                .into_script())
        })
        .collect()
}

/// Encode a bridge message straight to its OP_RETURN scripts
pub fn create_bridge_message_scripts(msg: &BridgeDecodedMsg) -> Result<Vec<ScriptBuf>, CodecError> {
    encode_payload_to_scripts(&encode_bridge_payload(msg)?)
}

/// Concatenate the bridge chunks of a transaction, in output order
pub fn read_bridge_payload(tx: &Transaction) -> Result<Vec<u8>, CodecError> {
    let mut payload = Vec::new();
    let mut found = false;

    for output in &tx.output {
        let mut instructions = output.script_pubkey.instructions();
        match (instructions.next(), instructions.next()) {
            (Some(Ok(Instruction::Op(first))), Some(Ok(Instruction::Op(second))))
                if first == OP_RETURN && second == BRIDGE_IDENT => {}
            _ => continue,
        }

        found = true;
        for instruction in instructions {
            match instruction {
                Ok(Instruction::PushBytes(bytes)) => payload.extend_from_slice(bytes.as_bytes()),
                Ok(Instruction::Op(op)) => {
                    return Err(CodecError::Malformed(format!(
                        "unexpected {} in bridge output",
                        op
                    )))
                }
                Err(e) => return Err(CodecError::Malformed(e.to_string())),
            }
        }
    }

    if !found {
        return Err(CodecError::MessageNotFound);
    }
    Ok(payload)
}

/// Locate and decode the bridge message carried by a transaction
pub fn read_bridge_message(tx: &Transaction) -> Result<BridgeDecodedMsg, CodecError> {
    decode_bridge_payload(&read_bridge_payload(tx)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::amount::amount_to_bytes;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, TxOut};

    fn deposit_message(data_len: usize) -> BridgeDecodedMsg {
        BridgeDecodedMsg {
            message: XCallMessage {
                message_type: 1,
                action: ACTION_DEPOSIT.to_string(),
                token_address: "0:0".to_string(),
                from: "tb1pf0atpt2d3zel6udws38pkrh2e49vqd3c5jcud3a82srphnmpe55q0ecrzk".to_string(),
                to: "0x2.icon/hx452e235f9f1fd1006b1941ed1ad19ef51d1192f6".to_string(),
                amount: amount_to_bytes(100_000),
                data: vec![0x5a; data_len],
            },
            chain_id: 3,
            receiver: "cxfc86ee7687e1bf681b5548b2667844485c0e7192".to_string(),
            connectors: vec![
                "cx577f5e756abd89cbcba38a58508b60a12754d2f5".to_string(),
                "0x1234567890abcdef1234567890abcdef12345678".to_string(),
            ],
        }
    }

    fn op_return(data: &[u8]) -> ScriptBuf {
        ScriptBuf::new_op_return(PushBytesBuf::try_from(data.to_vec()).unwrap())
    }

    fn tx_with_outputs(scripts: Vec<ScriptBuf>) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: scripts
                .into_iter()
                .map(|script_pubkey| TxOut {
                    value: Amount::ZERO,
                    script_pubkey,
                })
                .collect(),
        }
    }

    #[test]
    fn test_xcall_message_rlp() {
        let msg = deposit_message(0).message;
        let encoded = alloy_rlp::encode(&msg);
        assert_eq!(encoded.len(), msg.length());
        let decoded = XCallMessage::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_payload_chunk_boundaries() {
        for len in [PART_LIMIT, PART_LIMIT + 1] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let scripts = encode_payload_to_scripts(&payload).unwrap();
            assert_eq!(scripts.len(), if len == PART_LIMIT { 1 } else { 2 });
            assert!(scripts.iter().all(|s| s.is_op_return()));

            let tx = tx_with_outputs(scripts);
            assert_eq!(read_bridge_payload(&tx).unwrap(), payload);
        }
    }

    #[test]
    fn test_bridge_message_through_transaction() {
        let msg = deposit_message(200);
        let scripts = create_bridge_message_scripts(&msg).unwrap();
        assert!(scripts.len() > 2);

        // bridge chunks mixed with an unrelated payment output
        let mut outputs = vec![op_return(&[0xde, 0xad])];
        outputs.extend(scripts);
        let tx = tx_with_outputs(outputs);

        assert_eq!(read_bridge_message(&tx).unwrap(), msg);
    }

    #[test]
    fn test_no_bridge_output() {
        let tx = tx_with_outputs(vec![op_return(&[0x01, 0x02])]);
        assert!(matches!(read_bridge_message(&tx), Err(CodecError::MessageNotFound)));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let mut payload = encode_bridge_payload(&deposit_message(10)).unwrap();
        payload.truncate(payload.len() - 3);
        assert!(decode_bridge_payload(&payload).is_err());

        let rlp_only = alloy_rlp::encode(&deposit_message(10).message);
        assert!(matches!(
            decode_bridge_payload(&rlp_only),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_payload_has_no_scripts() {
        assert!(encode_payload_to_scripts(&[]).is_err());
    }
}
