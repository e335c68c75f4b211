//! Spent UTXO cache
//!
//! Tracks outpoints that have been committed to a transaction the indexer may
//! not have seen yet. Entries start as reservations (inputs of a transaction
//! under construction or being signed) and become spent after a successful
//! broadcast. Both expire once the indexer can be trusted to stop returning
//! them.

use bitcoin::OutPoint;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default lifetime of a reservation that was never confirmed or released
pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(30 * 60);

/// Default lifetime of a broadcast outpoint
pub const DEFAULT_SPENT_TTL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Reserved,
    Spent,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: EntryState,
    since: Instant,
}

/// Thread-safe outpoint reservation table shared by the selector and the router
#[derive(Debug)]
pub struct SpentUtxoCache {
    entries: Mutex<HashMap<OutPoint, Entry>>,
    reservation_ttl: Duration,
    spent_ttl: Duration,
}

impl Default for SpentUtxoCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SpentUtxoCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_RESERVATION_TTL, DEFAULT_SPENT_TTL)
    }

    pub fn with_ttl(reservation_ttl: Duration, spent_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            reservation_ttl,
            spent_ttl,
        }
    }

    // A poisoned lock only means another thread panicked mid-update; the map
    // itself is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<OutPoint, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_live(&self, entry: &Entry, now: Instant) -> bool {
        let ttl = match entry.state {
            EntryState::Reserved => self.reservation_ttl,
            EntryState::Spent => self.spent_ttl,
        };
        now.duration_since(entry.since) < ttl
    }

    /// Reserve `outpoint` if nobody holds it. Returns false when it is
    /// already reserved or spent.
    pub fn try_reserve(&self, outpoint: OutPoint) -> bool {
        let now = Instant::now();
        let mut entries = self.lock();

        if let Some(entry) = entries.get(&outpoint) {
            if self.is_live(entry, now) {
                return false;
            }
        }

        entries.insert(
            outpoint,
            Entry {
                state: EntryState::Reserved,
                since: now,
            },
        );
        true
    }

    /// Drop reservations for `outpoints`. Spent entries are left alone.
    pub fn release(&self, outpoints: &[OutPoint]) {
        let mut entries = self.lock();
        for outpoint in outpoints {
            if matches!(
                entries.get(outpoint),
                Some(Entry {
                    state: EntryState::Reserved,
                    ..
                })
            ) {
                entries.remove(outpoint);
            }
        }
    }

    /// Record `outpoints` as consumed by a broadcast transaction
    pub fn mark_spent(&self, outpoints: &[OutPoint]) {
        let now = Instant::now();
        let mut entries = self.lock();
        for outpoint in outpoints {
            entries.insert(
                *outpoint,
                Entry {
                    state: EntryState::Spent,
                    since: now,
                },
            );
        }
    }

    /// Re-enter an outpoint spent before a restart, live for `remaining`
    pub fn restore_spent(&self, outpoint: OutPoint, remaining: Duration) {
        let now = Instant::now();
        let age = self.spent_ttl.saturating_sub(remaining);
        let since = now.checked_sub(age).unwrap_or(now);
        self.lock().insert(
            outpoint,
            Entry {
                state: EntryState::Spent,
                since,
            },
        );
    }

    pub fn spent_ttl(&self) -> Duration {
        self.spent_ttl
    }

    /// True when the outpoint is reserved or spent
    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        let now = Instant::now();
        self.lock()
            .get(outpoint)
            .map(|entry| self.is_live(entry, now))
            .unwrap_or(false)
    }

    /// Remove expired entries, returning how many were dropped
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| self.is_live(entry, now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
