//! Common Infrastructure Module
//!
//! - Configuration loading from environment variables
//! - Structured logging setup
//! - The relayer-wide error taxonomy

pub mod config;
pub mod error;
pub mod logging;

pub use config::{BridgeConfig, ConfigError, Network, NodeMode};
pub use error::{BridgeError, Result};
pub use logging::{
    generate_correlation_id, init_from_config, init_logging, log_deposit_event,
    log_security_event, log_signing_event, log_withdrawal_event, EventCategory, LogEvent,
    LogLevel, LoggingError,
};
