//! Amount bytes: unsigned big-endian with leading zeros stripped.

use super::CodecError;

/// Total bitcoin supply in sats; no payout can exceed it
pub const MAX_SATS: u64 = 21_000_000 * 100_000_000; // == bitcoin::Amount::MAX_MONEY.to_sat()

/// Minimal big-endian encoding; zero encodes as an empty slice
pub fn amount_to_bytes(amount: u128) -> Vec<u8> {
    let bytes = amount.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

/// Decode big-endian amount bytes (leading zeros tolerated)
pub fn bytes_to_amount(bytes: &[u8]) -> Result<u128, CodecError> {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let significant = &bytes[first..];
    if significant.len() > 16 {
        return Err(CodecError::InvalidAmount(format!(
            "{} significant bytes exceed 128 bits",
            significant.len()
        )));
    }
    Ok(significant
        .iter()
        .fold(0u128, |acc, b| (acc << 8) | u128::from(*b)))
}

/// Decode amount bytes that must fit a satoshi value
pub fn bytes_to_sats(bytes: &[u8]) -> Result<u64, CodecError> {
    let amount = bytes_to_amount(bytes)?;
    u64::try_from(amount)
        .map_err(|_| CodecError::InvalidAmount(format!("{} exceeds a satoshi amount", amount)))
}
