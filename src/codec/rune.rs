//! Rune transfers
//!
//! A rune transfer is a runestone output `OP_RETURN OP_13 <payload>` whose
//! payload is a sequence of LEB128 integers: the body tag `0` followed by
//! edicts `(block delta, tx delta, amount, output)`, sorted by rune id.

use std::fmt;
use std::str::FromStr;

use bitcoin::opcodes::all::{OP_PUSHNUM_13, OP_RETURN};
use bitcoin::opcodes::Opcode;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::{Script, ScriptBuf};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::CodecError;

/// Token identifier used for plain bitcoin transfers
pub const BTC_TOKEN_ID: &str = "0:0";

/// Marker opcode following OP_RETURN in a runestone
pub const RUNESTONE_IDENT: Opcode = OP_PUSHNUM_13;

const TAG_BODY: u128 = 0;

/// Rune identifier: etching block height and transaction index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuneId {
    pub block: u64,
    pub tx: u32,
}

impl RuneId {
    /// `0:0` stands for plain bitcoin rather than a rune
    pub fn is_bitcoin(&self) -> bool {
        self.block == 0 && self.tx == 0
    }
}

impl fmt::Display for RuneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.tx)
    }
}

impl FromStr for RuneId {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (block, tx) = s
            .split_once(':')
            .ok_or_else(|| CodecError::InvalidRuneId(s.to_string()))?;
        Ok(RuneId {
            block: block
                .parse()
                .map_err(|_| CodecError::InvalidRuneId(s.to_string()))?,
            tx: tx.parse().map_err(|_| CodecError::InvalidRuneId(s.to_string()))?,
        })
    }
}

impl Serialize for RuneId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RuneId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Balance of one rune held by an output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuneBalance {
    pub rune_id: RuneId,
    pub amount: u128,
}

/// Transfer of `amount` of rune `id` to output index `output`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuneEdict {
    pub id: RuneId,
    pub amount: u128,
    pub output: u32,
}

// ============================================================================
// Varint
// ============================================================================

pub fn encode_varint(mut n: u128, out: &mut Vec<u8>) {
    while n >> 7 > 0 {
        out.push((n as u8 & 0x7f) | 0x80);
        n >>= 7;
    }
    out.push(n as u8);
}

/// Decode one varint, returning the value and the number of bytes read
pub fn decode_varint(buf: &[u8]) -> Result<(u128, usize), CodecError> {
    let mut n: u128 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i > 18 {
            return Err(CodecError::Malformed("varint overflows 128 bits".to_string()));
        }
        let value = u128::from(byte & 0x7f);
        if i == 18 && value > 0b11 {
            return Err(CodecError::Malformed("varint overflows 128 bits".to_string()));
        }
        n |= value << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((n, i + 1));
        }
    }
    Err(CodecError::Malformed("unterminated varint".to_string()))
}

// ============================================================================
// Runestone
// ============================================================================

/// Build the runestone output script for a set of edicts
pub fn runestone_script(edicts: &[RuneEdict]) -> Result<ScriptBuf, CodecError> {
    let mut sorted = edicts.to_vec();
    sorted.sort_by_key(|e| e.id);

    let mut payload = Vec::new();
    encode_varint(TAG_BODY, &mut payload);

    let mut previous = RuneId::default();
    for edict in &sorted {
        let block_delta = edict.id.block - previous.block;
        let tx_delta = if block_delta == 0 {
            edict.id.tx - previous.tx
        } else {
            edict.id.tx
        };
        encode_varint(u128::from(block_delta), &mut payload);
        encode_varint(u128::from(tx_delta), &mut payload);
        encode_varint(edict.amount, &mut payload);
        encode_varint(u128::from(edict.output), &mut payload);
        previous = edict.id;
    }

    let push = PushBytesBuf::try_from(payload)
        .map_err(|_| CodecError::Malformed("runestone payload too large".to_string()))?;
    Ok(Builder::new()
        .push_opcode(OP_RETURN)
        .push_opcode(RUNESTONE_IDENT)
        .push_slice(push)
        .into_script())
}

/// Parse the edicts out of a runestone script
pub fn decode_runestone(script: &Script) -> Result<Vec<RuneEdict>, CodecError> {
    let mut instructions = script.instructions();
    match (instructions.next(), instructions.next()) {
        (Some(Ok(Instruction::Op(first))), Some(Ok(Instruction::Op(second))))
            if first == OP_RETURN && second == RUNESTONE_IDENT => {}
        _ => return Err(CodecError::Malformed("not a runestone".to_string())),
    }

    let mut payload = Vec::new();
    for instruction in instructions {
        match instruction {
            Ok(Instruction::PushBytes(bytes)) => payload.extend_from_slice(bytes.as_bytes()),
            _ => return Err(CodecError::Malformed("runestone carries a non-push".to_string())),
        }
    }

    let mut integers = Vec::new();
    let mut rest = payload.as_slice();
    while !rest.is_empty() {
        let (value, read) = decode_varint(rest)?;
        integers.push(value);
        rest = &rest[read..];
    }

    match integers.split_first() {
        Some((&TAG_BODY, body)) if body.len() % 4 == 0 => {}
        _ => return Err(CodecError::Malformed("runestone without edict body".to_string())),
    }

    let mut edicts = Vec::new();
    let mut id = RuneId::default();
    for chunk in integers[1..].chunks(4) {
        let block_delta = u64::try_from(chunk[0])
            .map_err(|_| CodecError::Malformed("block delta overflow".to_string()))?;
        let tx = u32::try_from(chunk[1])
            .map_err(|_| CodecError::Malformed("tx delta overflow".to_string()))?;
        let overflow = || CodecError::Malformed("rune id overflow".to_string());
        id = if block_delta == 0 {
            RuneId {
                block: id.block,
                tx: id.tx.checked_add(tx).ok_or_else(overflow)?,
            }
        } else {
            RuneId {
                block: id.block.checked_add(block_delta).ok_or_else(overflow)?,
                tx,
            }
        };
        edicts.push(RuneEdict {
            id,
            amount: chunk[2],
            output: u32::try_from(chunk[3])
                .map_err(|_| CodecError::Malformed("output index overflow".to_string()))?,
        });
    }
    Ok(edicts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rune_id_text_form() {
        let id: RuneId = "840000:3".parse().unwrap();
        assert_eq!(id, RuneId { block: 840_000, tx: 3 });
        assert_eq!(id.to_string(), "840000:3");
        assert!("840000".parse::<RuneId>().is_err());
        assert!("a:b".parse::<RuneId>().is_err());
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"840000:3\"");
    }

    #[test]
    fn test_varint_known_values() {
        let mut out = Vec::new();
        encode_varint(300, &mut out);
        assert_eq!(out, vec![0xac, 0x02]);
        assert_eq!(decode_varint(&out).unwrap(), (300, 2));

        let mut max = Vec::new();
        encode_varint(u128::MAX, &mut max);
        assert_eq!(max.len(), 19);
        assert_eq!(decode_varint(&max).unwrap(), (u128::MAX, 19));

        assert!(decode_varint(&[0x80, 0x80]).is_err());
    }

    #[test]
    fn test_transfer_with_change_edict() {
        let id = RuneId { block: 2_584_327, tx: 44 };
        let edicts = vec![
            RuneEdict { id, amount: 7_000, output: 1 },
            RuneEdict { id, amount: 3_000, output: 2 },
        ];
        let script = runestone_script(&edicts).unwrap();
        assert!(script.is_op_return());
        assert_eq!(decode_runestone(&script).unwrap(), edicts);
    }

    #[test]
    fn test_payload_layout() {
        let script = runestone_script(&[RuneEdict {
            id: RuneId { block: 1, tx: 2 },
            amount: 3,
            output: 4,
        }])
        .unwrap();
        // OP_RETURN OP_13 PUSH5 [tag, block, tx, amount, output]
        assert_eq!(script.as_bytes(), &[0x6a, 0x5d, 0x05, 0x00, 0x01, 0x02, 0x03, 0x04]);
    }
}
