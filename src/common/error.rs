//! Common Error Types for the Bitcoin Bridge Relayer
//!
//! Every module owns a narrow `thiserror` enum; they all fold into
//! [`BridgeError`], which carries the relayer-wide error taxonomy.

use thiserror::Error;

/// Root error type for the bridge relayer
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] super::logging::LoggingError),

    /// Malformed input: bad address, bad rune id, wrong action, oversized field
    #[error("validation error: {0}")]
    Validation(String),

    /// Not enough spendable value behind the multisig address
    #[error("insufficient funds: need {required}, have {available}")]
    InsufficientFunds { required: u128, available: u128 },

    /// A deposit or UTXO does not match what it claims to carry
    #[error("verification error: {0}")]
    Verification(String),

    /// Threshold not met, bad partial signature, or slave failure
    #[error("signing error: {0}")]
    Signing(String),

    /// Indexer or peer unreachable
    #[error("network error: {0}")]
    Network(String),

    /// The network rejected a signed transaction
    #[error("broadcast error: {0}")]
    Broadcast(String),

    /// Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    /// Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a verification error
    pub fn verification(msg: impl Into<String>) -> Self {
        Self::Verification(msg.into())
    }

    /// Create a signing error
    pub fn signing(msg: impl Into<String>) -> Self {
        Self::Signing(msg.into())
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a broadcast error
    pub fn broadcast(msg: impl Into<String>) -> Self {
        Self::Broadcast(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a retryable error
    ///
    /// Validation, funding and verification failures are permanent for a
    /// given message; a signing round or indexer call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Signing(_)
                | BridgeError::Network(_)
                | BridgeError::Storage(_)
                | BridgeError::Io(_)
        )
    }

    /// Get error code for API responses and structured logs
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::Config(_) => "CONFIG_ERROR",
            BridgeError::Logging(_) => "LOGGING_ERROR",
            BridgeError::Validation(_) => "VALIDATION_ERROR",
            BridgeError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            BridgeError::Verification(_) => "VERIFICATION_ERROR",
            BridgeError::Signing(_) => "SIGNING_ERROR",
            BridgeError::Network(_) => "NETWORK_ERROR",
            BridgeError::Broadcast(_) => "BROADCAST_ERROR",
            BridgeError::Storage(_) => "STORAGE_ERROR",
            BridgeError::Internal(_) => "INTERNAL_ERROR",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = BridgeError::verification("amount mismatch");
        assert!(err.to_string().contains("amount mismatch"));
        assert_eq!(err.error_code(), "VERIFICATION_ERROR");
    }

    #[test]
    fn test_insufficient_funds_display() {
        let err = BridgeError::InsufficientFunds {
            required: 120_000,
            available: 50_000,
        };
        assert_eq!(err.to_string(), "insufficient funds: need 120000, have 50000");
        assert_eq!(err.error_code(), "INSUFFICIENT_FUNDS");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(BridgeError::network("timeout").is_retryable());
        assert!(BridgeError::signing("slave offline").is_retryable());
        assert!(!BridgeError::validation("bad address").is_retryable());
        assert!(!BridgeError::verification("wrong rune").is_retryable());
        assert!(!BridgeError::InsufficientFunds {
            required: 1,
            available: 0
        }
        .is_retryable());
    }
}
