//! Environment-based Configuration for the Bridge Relayer
//!
//! All keys and secrets come from environment variables (optionally loaded
//! from a `.env` file), never from hardcoded values.
//!
//! # Environment Variables
//!
//! ## Network
//! - `BRIDGE_NETWORK` - "mainnet", "testnet", "signet" or "regtest" (default: "testnet")
//! - `BRIDGE_NID` - network id of this chain in relay messages (default per network)
//! - `BRIDGE_ESPLORA_URL` - Esplora API endpoint
//! - `BRIDGE_UNISAT_URL` / `BRIDGE_UNISAT_KEY` - UniSat indexer endpoint and bearer key
//!
//! ## Signing
//! - `BRIDGE_MODE` - "master" or "slave"
//! - `BRIDGE_PUBKEYS` - comma-separated compressed signer keys, in signer order
//! - `BRIDGE_REQUIRED_SIGS` - threshold k (default: 2)
//! - `BRIDGE_RELAYER_PRIVKEY` - hex secret key of this node
//! - `BRIDGE_RECOVERY_PUBKEY` / `BRIDGE_RECOVERY_LOCK_TIME` - optional recovery leaf
//! - `BRIDGE_SLAVE_SERVERS` - comma-separated slave base URLs (master only)
//! - `BRIDGE_API_KEY` - shared key for the master/slave channel
//! - `BRIDGE_BIND_ADDR` - slave endpoint bind address (default: "0.0.0.0:8081")
//!
//! ## Relaying
//! - `BRIDGE_CONNECTIONS` - comma-separated connector contract addresses
//! - `BRIDGE_START_HEIGHT` - block height override (0 = resume)
//! - `BRIDGE_FEE_PER_OUTPUT` - static fee in sats per counted output
//! - `BRIDGE_POLL_INTERVAL_SECS`, `BRIDGE_REQUEST_TIMEOUT_SECS`, `BRIDGE_MAX_RETRY_WAIT_SECS`
//! - `BRIDGE_RETRY_BUDGET_SECS` - total backoff before an indexer call is given up (default: 600)
//! - `BRIDGE_DB_PATH` - SQLite database path
//! - `BRIDGE_LOG_LEVEL`, `BRIDGE_LOG_JSON`

use std::env;
use std::str::FromStr;

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use crate::multisig::MultisigInfo;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("signer configuration incomplete: {0}")]
    SignerConfigIncomplete(String),
}

/// Bitcoin network the relayer watches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            _ => Err(ConfigError::InvalidValue(
                "BRIDGE_NETWORK".to_string(),
                format!("unknown network: {}", s),
            )),
        }
    }
}

impl Network {
    /// Get bitcoin network enum
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }

    /// Default Esplora API for this network
    pub fn default_esplora_url(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://mempool.space/api",
            Network::Testnet => "https://mempool.space/testnet/api",
            Network::Signet => "https://mempool.space/signet/api",
            Network::Regtest => "http://127.0.0.1:3002",
        }
    }

    /// Default UniSat open API for this network
    pub fn default_unisat_url(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://open-api.unisat.io",
            Network::Testnet | Network::Regtest => "https://open-api-testnet.unisat.io",
            Network::Signet => "https://open-api-signet.unisat.io",
        }
    }

    /// Default relay network id
    pub fn default_nid(&self) -> &'static str {
        match self {
            Network::Mainnet => "0x1.btc",
            Network::Testnet | Network::Signet | Network::Regtest => "0x2.btc",
        }
    }
}

/// Role of this node in the signing protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    /// Builds transactions, aggregates signatures, broadcasts
    Master,
    /// Co-signs on request from the master
    Slave,
}

impl FromStr for NodeMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "master" => Ok(NodeMode::Master),
            "slave" => Ok(NodeMode::Slave),
            _ => Err(ConfigError::InvalidValue(
                "BRIDGE_MODE".to_string(),
                format!("unknown mode: {} (use 'master' or 'slave')", s),
            )),
        }
    }
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub network: Network,
    pub nid: String,
    pub esplora_url: String,
    pub unisat_url: String,
    pub unisat_key: String,

    pub mode: NodeMode,
    /// Signer keys; a signer's position in this list is its index
    pub pub_keys: Vec<PublicKey>,
    pub required_sigs: usize,
    pub relayer_key: SecretKey,
    pub recovery_pub_key: Option<PublicKey>,
    pub recovery_lock_time: u32,
    pub slave_urls: Vec<String>,
    pub api_key: String,
    pub bind_addr: String,

    /// Connector contracts whose messages are relayed
    pub connections: Vec<String>,
    pub start_height: u64,
    pub fee_per_output: u64,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub max_retry_wait_secs: u64,
    pub retry_budget_secs: u64,
    pub db_path: String,

    pub log_level: String,
    pub log_json: bool,
}

impl BridgeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let network: Network = lookup("BRIDGE_NETWORK")
            .unwrap_or_else(|| "testnet".to_string())
            .parse()?;

        let nid = lookup("BRIDGE_NID").unwrap_or_else(|| network.default_nid().to_string());
        let esplora_url = lookup("BRIDGE_ESPLORA_URL")
            .unwrap_or_else(|| network.default_esplora_url().to_string());
        let unisat_url = lookup("BRIDGE_UNISAT_URL")
            .unwrap_or_else(|| network.default_unisat_url().to_string());
        let unisat_key = lookup("BRIDGE_UNISAT_KEY").unwrap_or_default();

        let mode: NodeMode = lookup("BRIDGE_MODE")
            .ok_or_else(|| ConfigError::MissingEnvVar("BRIDGE_MODE".to_string()))?
            .parse()?;

        let pub_keys = split_list(&lookup("BRIDGE_PUBKEYS").unwrap_or_default())
            .iter()
            .map(|k| parse_public_key("BRIDGE_PUBKEYS", k))
            .collect::<Result<Vec<_>, _>>()?;

        let required_sigs = parse_or("BRIDGE_REQUIRED_SIGS", lookup("BRIDGE_REQUIRED_SIGS"), 2)?;

        let key_hex = lookup("BRIDGE_RELAYER_PRIVKEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("BRIDGE_RELAYER_PRIVKEY".to_string()))?;
        let relayer_key = parse_secret_key(&key_hex)?;

        let recovery_pub_key = match lookup("BRIDGE_RECOVERY_PUBKEY") {
            Some(k) if !k.trim().is_empty() => Some(parse_public_key("BRIDGE_RECOVERY_PUBKEY", &k)?),
            _ => None,
        };
        let recovery_lock_time =
            parse_or("BRIDGE_RECOVERY_LOCK_TIME", lookup("BRIDGE_RECOVERY_LOCK_TIME"), 0)?;

        let config = Self {
            network,
            nid,
            esplora_url,
            unisat_url,
            unisat_key,
            mode,
            pub_keys,
            required_sigs,
            relayer_key,
            recovery_pub_key,
            recovery_lock_time,
            slave_urls: split_list(&lookup("BRIDGE_SLAVE_SERVERS").unwrap_or_default()),
            api_key: lookup("BRIDGE_API_KEY").unwrap_or_default(),
            bind_addr: lookup("BRIDGE_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8081".to_string()),
            connections: split_list(&lookup("BRIDGE_CONNECTIONS").unwrap_or_default()),
            start_height: parse_or("BRIDGE_START_HEIGHT", lookup("BRIDGE_START_HEIGHT"), 0)?,
            fee_per_output: parse_or("BRIDGE_FEE_PER_OUTPUT", lookup("BRIDGE_FEE_PER_OUTPUT"), 2_000)?,
            poll_interval_secs: parse_or(
                "BRIDGE_POLL_INTERVAL_SECS",
                lookup("BRIDGE_POLL_INTERVAL_SECS"),
                60,
            )?,
            request_timeout_secs: parse_or(
                "BRIDGE_REQUEST_TIMEOUT_SECS",
                lookup("BRIDGE_REQUEST_TIMEOUT_SECS"),
                30,
            )?,
            max_retry_wait_secs: parse_or(
                "BRIDGE_MAX_RETRY_WAIT_SECS",
                lookup("BRIDGE_MAX_RETRY_WAIT_SECS"),
                120,
            )?,
            retry_budget_secs: parse_or(
                "BRIDGE_RETRY_BUDGET_SECS",
                lookup("BRIDGE_RETRY_BUDGET_SECS"),
                600,
            )?,
            db_path: lookup("BRIDGE_DB_PATH").unwrap_or_else(|| "data/bridge.db".to_string()),
            log_level: lookup("BRIDGE_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_json: lookup("BRIDGE_LOG_JSON").map(|v| v == "1" || v == "true").unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check role-specific requirements
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pub_keys.is_empty() {
            return Err(ConfigError::SignerConfigIncomplete(
                "BRIDGE_PUBKEYS must list at least one key".to_string(),
            ));
        }
        if self.required_sigs == 0 || self.required_sigs > self.pub_keys.len() {
            return Err(ConfigError::InvalidValue(
                "BRIDGE_REQUIRED_SIGS".to_string(),
                format!("must be between 1 and {}", self.pub_keys.len()),
            ));
        }
        if self.signer_index().is_none() {
            return Err(ConfigError::SignerConfigIncomplete(
                "BRIDGE_RELAYER_PRIVKEY does not match any key in BRIDGE_PUBKEYS".to_string(),
            ));
        }
        if self.recovery_lock_time > 0 && self.recovery_pub_key.is_none() {
            return Err(ConfigError::SignerConfigIncomplete(
                "BRIDGE_RECOVERY_LOCK_TIME set without BRIDGE_RECOVERY_PUBKEY".to_string(),
            ));
        }
        if self.fee_per_output == 0 {
            return Err(ConfigError::InvalidValue(
                "BRIDGE_FEE_PER_OUTPUT".to_string(),
                "must be positive".to_string(),
            ));
        }
        match self.mode {
            NodeMode::Master if self.slave_urls.len() + 1 < self.required_sigs => {
                Err(ConfigError::SignerConfigIncomplete(format!(
                    "{} slave servers cannot reach a threshold of {}",
                    self.slave_urls.len(),
                    self.required_sigs
                )))
            }
            NodeMode::Slave if self.api_key.is_empty() => {
                Err(ConfigError::MissingEnvVar("BRIDGE_API_KEY".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Position of this node's key in the signer list
    pub fn signer_index(&self) -> Option<usize> {
        let own = PublicKey::from_secret_key(&Secp256k1::new(), &self.relayer_key);
        self.pub_keys.iter().position(|k| *k == own)
    }

    /// Wallet policy described by this configuration
    pub fn multisig_info(&self) -> MultisigInfo {
        MultisigInfo {
            pub_keys: self.pub_keys.clone(),
            required_sigs: self.required_sigs,
            recovery_pub_key: self.recovery_pub_key,
            recovery_block_height: self.recovery_lock_time,
        }
    }

    /// Print configuration summary (hiding sensitive values)
    pub fn print_summary(&self) {
        println!("=== Bridge Relayer Configuration ===");
        println!("Network: {:?} ({})", self.network, self.nid);
        println!("Esplora API: {}", self.esplora_url);
        println!("UniSat API: {}", self.unisat_url);
        println!("Mode: {:?}", self.mode);
        println!(
            "Multisig: {}-of-{} (signer #{})",
            self.required_sigs,
            self.pub_keys.len(),
            self.signer_index().map(|i| i.to_string()).unwrap_or_else(|| "?".to_string())
        );
        println!("Recovery lock time: {}", self.recovery_lock_time);
        println!("Slave servers: {}", self.slave_urls.len());
        println!("Connections: {}", self.connections.join(", "));
        println!("Fee per output: {} sats", self.fee_per_output);
        println!(
            "Indexer retries: backoff up to {}s, given up after {}s",
            self.max_retry_wait_secs, self.retry_budget_secs
        );
        println!("Database: {}", self.db_path);
        println!("Log Level: {}", self.log_level);
        println!("====================================");
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_or<T: FromStr>(name: &str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => v.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(name.to_string(), format!("cannot parse '{}'", v))
        }),
        _ => Ok(default),
    }
}

fn parse_public_key(name: &str, value: &str) -> Result<PublicKey, ConfigError> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("invalid hex: {}", e)))?;
    PublicKey::from_slice(&bytes)
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("invalid key: {}", e)))
}

fn parse_secret_key(value: &str) -> Result<SecretKey, ConfigError> {
    let bytes = hex::decode(value.trim()).map_err(|e| {
        ConfigError::InvalidValue("BRIDGE_RELAYER_PRIVKEY".to_string(), format!("invalid hex: {}", e))
    })?;
    SecretKey::from_slice(&bytes).map_err(|e| {
        ConfigError::InvalidValue("BRIDGE_RELAYER_PRIVKEY".to_string(), format!("invalid key: {}", e))
    })
}
