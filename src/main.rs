//! Bridge Relayer CLI
//!
//! Entry point for running a relayer node (master or slave) and for the
//! operator chores around it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::secp256k1::Secp256k1;
use btc_bridge_relay::common::init_from_config;
use btc_bridge_relay::server::{self, AppState};
use btc_bridge_relay::{
    BlockInfo, BridgeConfig, BridgeIndexer, BridgeProvider, BridgeStore, MultisigWallet,
    NodeMode, RelayMessage, SlaveClient, SpentUtxoCache, SqliteKvStore,
};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};

#[derive(Parser)]
#[command(name = "bridge-relayer")]
#[command(about = "Bitcoin taproot multisig bridge relayer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relayer node (configured through BRIDGE_* variables)
    Run,

    /// Print the multisig address for the configured signer set
    Address,

    /// Generate a relayer key pair (for development only)
    Keygen,

    /// Route one relay message read from a JSON file
    Route {
        /// Path to the message JSON
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run_node(load_config()?).await?,
        Commands::Address => print_address(&load_config()?)?,
        Commands::Keygen => keygen(),
        Commands::Route { file } => route_file(load_config()?, file).await?,
    }

    Ok(())
}

fn load_config() -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    let config = BridgeConfig::from_env()?;
    init_from_config(&config)?;
    Ok(config)
}

async fn build_provider(config: &BridgeConfig) -> Result<Arc<BridgeProvider>, Box<dyn std::error::Error>> {
    let kv = SqliteKvStore::new(&config.db_path)?;
    let indexer = BridgeIndexer::from_config(config)?;
    let slaves = match config.mode {
        NodeMode::Master => Some(SlaveClient::from_config(config)?),
        NodeMode::Slave => None,
    };

    let provider = BridgeProvider::new(
        config,
        Arc::new(indexer),
        BridgeStore::new(Arc::new(kv)),
        Arc::new(SpentUtxoCache::new()),
        slaves,
    )?;
    provider.restore_spent().await?;
    Ok(Arc::new(provider))
}

/// Run the listener, and the signing endpoint on slaves, until Ctrl-C
async fn run_node(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.print_summary();
    let provider = build_provider(&config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (block_tx, block_rx) = mpsc::channel::<BlockInfo>(64);
    let listener = {
        let provider = Arc::clone(&provider);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { provider.listen(block_tx, shutdown).await })
    };
    let consumer = tokio::spawn(deliver_blocks(block_rx));
    let pruner = tokio::spawn(prune_spent(Arc::clone(&provider), shutdown_rx.clone()));

    let signer_server = match config.mode {
        NodeMode::Slave => {
            let addr: SocketAddr = config.bind_addr.parse()?;
            let state = Arc::new(AppState {
                provider: Arc::clone(&provider),
                api_key: config.api_key.clone(),
            });
            Some(tokio::spawn(server::serve(state, addr, shutdown_rx.clone())))
        }
        NodeMode::Master => None,
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    shutdown_tx.send(true).ok();

    if let Err(e) = listener.await? {
        tracing::error!(error = %e, "Listener exited with error");
    }
    if let Some(handle) = signer_server {
        if let Err(e) = handle.await? {
            tracing::error!(error = %e, "Signer server exited with error");
        }
    }
    pruner.await?;
    consumer.await?;
    Ok(())
}

/// Hand deposits to the relay core. The relay core runs out of process and
/// reads the message lines from the log.
async fn deliver_blocks(mut blocks: mpsc::Receiver<BlockInfo>) {
    while let Some(block) = blocks.recv().await {
        for message in &block.messages {
            match serde_json::to_string(message) {
                Ok(json) => tracing::info!(
                    target: "bridge::relay",
                    height = block.height,
                    sn = message.sn,
                    payload = %json,
                    "Relay message"
                ),
                Err(e) => tracing::error!(sn = message.sn, error = %e, "Unserializable message"),
            }
        }
    }
}

async fn prune_spent(provider: Arc<BridgeProvider>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(600));
    loop {
        tokio::select! {
            _ = interval.tick() => match provider.prune_spent().await {
                Ok(0) => {}
                Ok(pruned) => tracing::debug!(pruned = pruned, "Pruned spent outpoints"),
                Err(e) => tracing::warn!(error = %e, "Failed to prune spent outpoints"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

fn print_address(config: &BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let wallet = MultisigWallet::build(&config.multisig_info())?;
    println!("{}", wallet.address_on_chain(config.network.bitcoin_network()));
    Ok(())
}

fn keygen() {
    let secp = Secp256k1::new();
    let (secret, public) = secp.generate_keypair(&mut rand::thread_rng());
    println!("BRIDGE_RELAYER_PRIVKEY={}", hex::encode(secret.secret_bytes()));
    println!("public key: {}", public);
}

async fn route_file(config: BridgeConfig, file: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let message: RelayMessage = serde_json::from_slice(&std::fs::read(&file)?)?;
    let provider = build_provider(&config).await?;

    match provider.route(&message).await? {
        Some(txid) => println!("broadcast {}", txid),
        None => println!("message {} routed, nothing broadcast", message.sn),
    }
    Ok(())
}
