//! Structured Logging for the Bridge Relayer
//!
//! - JSON output for log aggregation, pretty output for development
//! - Correlation ids (message serial numbers, signing round ids)
//! - Dedicated event helpers for deposits, withdrawals, signing rounds and
//!   security-relevant rejections
//!
//! ```rust,ignore
//! use btc_bridge_relay::common::logging::{init_logging, LogLevel};
//!
//! init_logging(LogLevel::Info, true)?;
//! tracing::info!(target: "bridge::provider", sn = 42, "relaying deposit");
//! ```

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

// ============================================================================
// Log Levels
// ============================================================================

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

// ============================================================================
// Structured Event Types
// ============================================================================

/// Event categories for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Inbound deposits detected on Bitcoin
    Deposit,
    /// Outbound withdrawals and refunds
    Withdrawal,
    /// Threshold signing rounds
    Signing,
    /// Rejected deposits, bad api keys, mismatched signing requests
    Security,
    /// Startup, shutdown, checkpoints
    System,
}

/// Structured log event
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// Event timestamp (ISO 8601)
    pub timestamp: String,
    pub level: String,
    pub category: EventCategory,
    pub message: String,
    /// Correlation id, usually the message serial number
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

/// Error details for error events
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    /// Create a new log event
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: format!("{:?}", level).to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    /// Serialize this event to JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"failed to serialize log\", \"message\": \"{}\"}}",
                self.message
            )
        })
    }
}

// ============================================================================
// Event Helpers
// ============================================================================

/// Log a security-related event
pub fn log_security_event(
    event_type: &str,
    success: bool,
    details: serde_json::Value,
    correlation_id: Option<&str>,
) {
    let level = if success { LogLevel::Info } else { LogLevel::Warn };
    let mut event = LogEvent::new(level, EventCategory::Security, event_type).with_data(
        serde_json::json!({
            "success": success,
            "details": details
        }),
    );
    if let Some(id) = correlation_id {
        event = event.with_correlation_id(id);
    }

    if success {
        tracing::info!(target: "bridge::security", "{}", event.to_json());
    } else {
        tracing::warn!(target: "bridge::security", "{}", event.to_json());
    }
}

/// Log a deposit event
pub fn log_deposit_event(
    event_type: &str,
    sn: u64,
    txid: &str,
    token: &str,
    amount: u128,
    error: Option<&str>,
) {
    let success = error.is_none();
    let level = if success { LogLevel::Info } else { LogLevel::Error };
    let mut event = LogEvent::new(level, EventCategory::Deposit, event_type)
        .with_correlation_id(sn.to_string())
        .with_data(serde_json::json!({
            "txid": txid,
            "token": token,
            "amount": amount.to_string(),
            "success": success
        }));
    if let Some(err) = error {
        event = event.with_error("DEPOSIT_ERROR", err);
    }

    if success {
        tracing::info!(target: "bridge::deposit", "{}", event.to_json());
    } else {
        tracing::error!(target: "bridge::deposit", "{}", event.to_json());
    }
}

/// Log a withdrawal event
pub fn log_withdrawal_event(
    event_type: &str,
    sn: u64,
    to: &str,
    amount: u128,
    btc_txid: Option<&str>,
    error: Option<&str>,
) {
    let success = error.is_none();
    let level = if success { LogLevel::Info } else { LogLevel::Error };
    let mut event = LogEvent::new(level, EventCategory::Withdrawal, event_type)
        .with_correlation_id(sn.to_string())
        .with_data(serde_json::json!({
            "to": to,
            "amount": amount.to_string(),
            "btc_txid": btc_txid,
            "success": success
        }));
    if let Some(err) = error {
        event = event.with_error("WITHDRAWAL_ERROR", err);
    }

    if success {
        tracing::info!(target: "bridge::withdrawal", "{}", event.to_json());
    } else {
        tracing::error!(target: "bridge::withdrawal", "{}", event.to_json());
    }
}

/// Log the outcome of a threshold signing round
pub fn log_signing_event(sn: u64, round_id: &str, collected: usize, required: usize, duration_ms: u64) {
    let success = collected >= required;
    let level = if success { LogLevel::Info } else { LogLevel::Warn };
    let event = LogEvent::new(level, EventCategory::Signing, "signing_round")
        .with_correlation_id(sn.to_string())
        .with_duration(duration_ms)
        .with_data(serde_json::json!({
            "round_id": round_id,
            "collected": collected,
            "required": required,
        }));

    if success {
        tracing::info!(target: "bridge::signing", "{}", event.to_json());
    } else {
        tracing::warn!(target: "bridge::signing", "{}", event.to_json());
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize the logging system
///
/// `json_format` selects machine-readable output; `RUST_LOG` overrides the
/// level filter when set.
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let lvl = level.as_filter();
        EnvFilter::new(format!(
            "btc_bridge_relay={lvl},bridge={lvl},tower_http={lvl},axum={lvl}"
        ))
    });

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from BridgeConfig
pub fn init_from_config(config: &super::config::BridgeConfig) -> Result<(), LoggingError> {
    init_logging(LogLevel::from(config.log_level.as_str()), config.log_json)
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

/// Generate a unique correlation id for a signing round
pub fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event_serialization() {
        let event = LogEvent::new(LogLevel::Info, EventCategory::Withdrawal, "withdrawal_broadcast")
            .with_correlation_id("4294967297")
            .with_data(serde_json::json!({"to": "tb1q"}))
            .with_duration(42);

        let json = event.to_json();
        assert!(json.contains("withdrawal_broadcast"));
        assert!(json.contains("4294967297"));
        assert!(json.contains("\"category\":\"withdrawal\""));
        assert!(json.contains("42"));
    }

    #[test]
    fn test_error_details_included() {
        let json = LogEvent::new(LogLevel::Error, EventCategory::Deposit, "deposit_rejected")
            .with_error("VERIFICATION_ERROR", "amount mismatch")
            .to_json();
        assert!(json.contains("VERIFICATION_ERROR"));
        assert!(json.contains("amount mismatch"));
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from("INFO"), LogLevel::Info);
        assert_eq!(LogLevel::from("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from("unknown"), LogLevel::Info);
    }

    #[test]
    fn test_correlation_ids_unique() {
        assert_ne!(generate_correlation_id(), generate_correlation_id());
    }
}
