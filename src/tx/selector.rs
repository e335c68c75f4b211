//! UTXO selection
//!
//! Greedy, first-seen selection over the indexer's pages. Every chosen UTXO
//! is reserved in the spent cache as it is picked so concurrent builders
//! never share an input; reservations are dropped again when selection
//! fails.

use bitcoin::OutPoint;
use std::collections::HashSet;
use std::future::Future;
use thiserror::Error;

use super::types::Utxo;
use crate::codec::RuneId;
use crate::common::BridgeError;
use crate::indexer::{Indexer, IndexerError, UtxoPage};
use crate::storage::SpentUtxoCache;

/// UTXOs requested from the indexer per page
pub const UTXO_PAGE_SIZE: u64 = 64;

/// Selection errors
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("insufficient funds: need {required}, have {available}")]
    InsufficientFunds { required: u128, available: u128 },

    #[error("rune UTXO {outpoint} carries {count} runes")]
    AmbiguousRunes { outpoint: OutPoint, count: usize },

    #[error("rune UTXO {outpoint} holds {found} instead of {expected}")]
    WrongRune {
        outpoint: OutPoint,
        expected: RuneId,
        found: RuneId,
    },

    #[error(transparent)]
    Indexer(#[from] IndexerError),
}

impl From<SelectionError> for BridgeError {
    fn from(err: SelectionError) -> Self {
        match err {
            SelectionError::InsufficientFunds {
                required,
                available,
            } => BridgeError::InsufficientFunds {
                required,
                available,
            },
            SelectionError::Indexer(e) => e.into(),
            other => BridgeError::Verification(other.to_string()),
        }
    }
}

/// Outcome of inspecting one candidate
enum Candidate {
    Skip,
    Take(u128),
}

/// Pages through `fetch` and reserves candidates until `required` is met.
/// `inspect` decides per UTXO whether it counts and for how much.
async fn select_paged<F, Fut, I>(
    spent: &SpentUtxoCache,
    required: u128,
    exclude: &[OutPoint],
    mut fetch: F,
    mut inspect: I,
) -> Result<(Vec<Utxo>, u128), SelectionError>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<UtxoPage, IndexerError>>,
    I: FnMut(&Utxo) -> Result<Candidate, SelectionError>,
{
    let mut selected: Vec<Utxo> = Vec::new();
    let mut total: u128 = 0;

    if required == 0 {
        return Ok((selected, total));
    }

    let result: Result<(), SelectionError> = async {
        let mut seen = HashSet::new();
        let mut cursor = 0u64;

        loop {
            let page = fetch(cursor).await?;
            let fetched = page.utxos.len() as u64;
            if fetched == 0 {
                break;
            }

            for utxo in page.utxos {
                let outpoint = utxo.outpoint();
                if exclude.contains(&outpoint) || !seen.insert(outpoint) {
                    continue;
                }
                let value = match inspect(&utxo)? {
                    Candidate::Skip => continue,
                    Candidate::Take(value) => value,
                };
                if !spent.try_reserve(outpoint) {
                    continue;
                }

                total = total.saturating_add(value);
                selected.push(utxo);
                if total >= required {
                    return Ok(());
                }
            }

            cursor += fetched;
            if fetched < UTXO_PAGE_SIZE || cursor >= page.total {
                break;
            }
        }

        Err(SelectionError::InsufficientFunds {
            required,
            available: total,
        })
    }
    .await;

    match result {
        Ok(()) => Ok((selected, total)),
        Err(e) => {
            let reserved: Vec<OutPoint> = selected.iter().map(Utxo::outpoint).collect();
            spent.release(&reserved);
            Err(e)
        }
    }
}

/// Select plain bitcoin UTXOs at `address` covering `required` sats
pub async fn select_bitcoin_utxos(
    indexer: &dyn Indexer,
    spent: &SpentUtxoCache,
    address: &str,
    required: u64,
    exclude: &[OutPoint],
) -> Result<Vec<Utxo>, SelectionError> {
    let (utxos, total) = select_paged(
        spent,
        u128::from(required),
        exclude,
        |cursor| indexer.bitcoin_utxos(address, cursor, UTXO_PAGE_SIZE),
        |utxo| {
            // Spending a rune-bearing output as plain bitcoin would burn its runes
            if utxo.runes.is_empty() {
                Ok(Candidate::Take(u128::from(utxo.amount)))
            } else {
                Ok(Candidate::Skip)
            }
        },
    )
    .await?;

    tracing::debug!(
        target: "bridge::tx",
        count = utxos.len(),
        total = %total,
        required = required,
        "Selected bitcoin UTXOs"
    );
    Ok(utxos)
}

/// Select UTXOs holding `rune_id` covering `required` units.
/// Returns the UTXOs and the rune change (`selected - required`).
pub async fn select_rune_utxos(
    indexer: &dyn Indexer,
    spent: &SpentUtxoCache,
    address: &str,
    rune_id: &RuneId,
    required: u128,
    exclude: &[OutPoint],
) -> Result<(Vec<Utxo>, u128), SelectionError> {
    let (utxos, total) = select_paged(
        spent,
        required,
        exclude,
        |cursor| indexer.rune_utxos(address, rune_id, cursor, UTXO_PAGE_SIZE),
        |utxo| match utxo.runes.as_slice() {
            [balance] if balance.rune_id == *rune_id => Ok(Candidate::Take(balance.amount)),
            [balance] => Err(SelectionError::WrongRune {
                outpoint: utxo.outpoint(),
                expected: *rune_id,
                found: balance.rune_id,
            }),
            runes => Err(SelectionError::AmbiguousRunes {
                outpoint: utxo.outpoint(),
                count: runes.len(),
            }),
        },
    )
    .await?;

    tracing::debug!(
        target: "bridge::tx",
        rune = %rune_id,
        count = utxos.len(),
        total = %total,
        required = %required,
        "Selected rune UTXOs"
    );
    Ok((utxos, total - required))
}
