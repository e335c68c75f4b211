//! Withdrawal transaction construction
//!
//! - `types`: UTXOs, requested outputs and the unsigned result
//! - `selector`: greedy UTXO selection with spent-cache reservations
//! - `builder`: output layout, flat per-output fee and change handling

pub mod builder;
pub mod selector;
pub mod types;

pub use builder::{build_multisig_tx, BuilderError, TxBuilder, DUST_LIMIT, MIN_PAYMENT};
pub use selector::{select_bitcoin_utxos, select_rune_utxos, SelectionError, UTXO_PAGE_SIZE};
pub use types::{OutputTx, UnsignedTx, Utxo};
