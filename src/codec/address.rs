//! Typed address payloads
//!
//! An address travels as one prefix byte `(type << 5) | (len - 1)` followed
//! by `len` raw bytes. The type is taken from the textual prefix.

use super::CodecError;

/// Longest raw address body the 5-bit length field can express
pub const MAX_ADDRESS_LEN: usize = 32;

/// Address families recognised by the prefix byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    /// `0x…` (EVM accounts and contracts)
    Evm = 1,
    /// `hx…` (ICON EOA)
    IconAccount = 2,
    /// `cx…` (ICON contract)
    IconContract = 3,
}

impl AddressType {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "0x" => Some(AddressType::Evm),
            "hx" => Some(AddressType::IconAccount),
            "cx" => Some(AddressType::IconContract),
            _ => None,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(AddressType::Evm),
            2 => Some(AddressType::IconAccount),
            3 => Some(AddressType::IconContract),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            AddressType::Evm => "0x",
            AddressType::IconAccount => "hx",
            AddressType::IconContract => "cx",
        }
    }
}

/// Encode a prefixed hex address into its compact payload form
pub fn address_to_payload(address: &str) -> Result<Vec<u8>, CodecError> {
    let prefix = address
        .get(..2)
        .ok_or_else(|| CodecError::InvalidAddress(format!("too short: {:?}", address)))?;
    let kind = AddressType::from_prefix(prefix)
        .ok_or_else(|| CodecError::InvalidAddress(format!("unknown prefix in {}", address)))?;

    let raw = hex::decode(&address[2..])
        .map_err(|e| CodecError::InvalidAddress(format!("{}: {}", address, e)))?;
    if raw.is_empty() || raw.len() > MAX_ADDRESS_LEN {
        return Err(CodecError::InvalidAddress(format!(
            "{}: body must be 1..={} bytes, got {}",
            address,
            MAX_ADDRESS_LEN,
            raw.len()
        )));
    }

    let mut out = Vec::with_capacity(raw.len() + 1);
    out.push(((kind as u8) << 5) | (raw.len() as u8 - 1));
    out.extend_from_slice(&raw);
    Ok(out)
}

/// Decode one address payload, returning the address and the unread rest
pub fn payload_to_address(payload: &[u8]) -> Result<(String, &[u8]), CodecError> {
    let (&head, rest) = payload
        .split_first()
        .ok_or_else(|| CodecError::InvalidAddress("empty payload".to_string()))?;

    let kind = AddressType::from_code(head >> 5)
        .ok_or_else(|| CodecError::InvalidAddress(format!("unknown address type {}", head >> 5)))?;
    let len = (head & 0x1f) as usize + 1;
    if rest.len() < len {
        return Err(CodecError::InvalidAddress(format!(
            "truncated address: need {} bytes, have {}",
            len,
            rest.len()
        )));
    }

    let (body, remaining) = rest.split_at(len);
    Ok((format!("{}{}", kind.prefix(), hex::encode(body)), remaining))
}
