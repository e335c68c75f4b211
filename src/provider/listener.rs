//! Deposit listener
//!
//! Scans the multisig address history in fixed-size height ranges, a batch
//! of ranges at a time (one history fetch per batch), and hands the deposits it finds to the relay core
//! grouped by block and ordered by serial number. The next height to scan is
//! saved after every batch so a restart resumes where it stopped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use super::{BlockInfo, BridgeProvider, RelayMessage};
use crate::common::{log_deposit_event, log_security_event, BridgeError};
use crate::indexer::IndexedTx;

/// Blocks covered by one indexer query
pub const RANGE_SIZE: u64 = 2;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Pick the first height to scan.
///
/// A configured start inside the chain wins, then the saved progress. With
/// neither, scanning starts at the tip.
pub fn start_height(configured: u64, latest: u64, last_saved: u64) -> Result<u64, BridgeError> {
    if configured > 0 && configured < latest {
        return Ok(configured);
    }
    if last_saved > latest {
        return Err(BridgeError::validation(format!(
            "saved height {} is ahead of the chain tip {}",
            last_saved, latest
        )));
    }
    if last_saved > 0 && last_saved < latest {
        return Ok(last_saved);
    }
    Ok(latest)
}

/// Outcome of one scan pass
enum Scan {
    /// Everything below this height was delivered
    Done(u64),
    /// Shutdown requested or nobody listens anymore
    Stopped,
}

impl BridgeProvider {
    /// Run the listener until `shutdown` flips or the receiver goes away
    pub async fn listen(
        self: &Arc<Self>,
        blocks: mpsc::Sender<BlockInfo>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BridgeError> {
        let Some(latest) = self.latest_height(&mut shutdown).await? else {
            return Ok(());
        };
        let saved = self.store.last_height().await?.unwrap_or(0);
        let mut next = start_height(self.start_height, latest, saved)?;

        tracing::info!(
            target: "bridge::listener",
            address = %self.multisig_address,
            start = next,
            latest = latest,
            "Listener started"
        );

        loop {
            let Some(latest) = self.latest_height(&mut shutdown).await? else {
                break;
            };
            if next < latest {
                match self.scan(next, latest, &blocks, &shutdown).await? {
                    Scan::Done(height) => next = height,
                    Scan::Stopped => break,
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(target: "bridge::listener", next = next, "Listener stopped");
        Ok(())
    }

    async fn latest_height(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<u64>, BridgeError> {
        self.with_retry("latest height", shutdown, || async {
            self.indexer
                .latest_height()
                .await
                .map_err(BridgeError::from)
        })
        .await
    }

    /// Scan `[from, to)` and deliver what was found.
    ///
    /// The address history of a whole batch is fetched once; the ranges in
    /// it are then verified in parallel.
    async fn scan(
        self: &Arc<Self>,
        from: u64,
        to: u64,
        blocks: &mpsc::Sender<BlockInfo>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Scan, BridgeError> {
        let ranges = split_ranges(from, to);

        for batch in ranges.chunks(scan_workers()) {
            let (Some(&(batch_start, _)), Some(&(_, batch_end))) = (batch.first(), batch.last())
            else {
                continue;
            };
            let mut fetch_shutdown = shutdown.clone();
            let Some(txs) = self
                .with_retry("address history", &mut fetch_shutdown, move || async move {
                    self.indexer
                        .txs_in_range(&self.multisig_address, batch_start, batch_end)
                        .await
                        .map_err(BridgeError::from)
                })
                .await?
            else {
                return Ok(Scan::Stopped);
            };

            let mut set = JoinSet::new();
            for &(start, end) in batch {
                let in_range: Vec<IndexedTx> = txs
                    .iter()
                    .filter(|t| t.height >= start && t.height < end)
                    .cloned()
                    .collect();
                if in_range.is_empty() {
                    continue;
                }
                let this = Arc::clone(self);
                let mut shutdown = shutdown.clone();
                set.spawn(async move { this.scan_range(in_range, &mut shutdown).await });
            }

            let mut messages = Vec::new();
            while let Some(joined) = set.join_next().await {
                let found = joined
                    .map_err(|e| BridgeError::internal(format!("scan worker failed: {}", e)))??;
                match found {
                    Some(found) => messages.extend(found),
                    None => return Ok(Scan::Stopped),
                }
            }

            for block in group_by_height(messages) {
                tracing::info!(
                    target: "bridge::listener",
                    height = block.height,
                    messages = block.messages.len(),
                    "Delivering deposits"
                );
                if blocks.send(block).await.is_err() {
                    tracing::warn!(target: "bridge::listener", "Block receiver dropped");
                    return Ok(Scan::Stopped);
                }
            }

            self.store.save_last_height(batch_end).await?;
        }

        Ok(Scan::Done(to))
    }

    /// Deposits among `txs`. `None` when interrupted by shutdown.
    async fn scan_range(
        &self,
        txs: Vec<IndexedTx>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Vec<RelayMessage>>, BridgeError> {
        self.with_retry("verify range", shutdown, || self.collect_range(&txs))
            .await
    }

    async fn collect_range(&self, txs: &[IndexedTx]) -> Result<Vec<RelayMessage>, BridgeError> {
        let mut messages = Vec::new();
        for indexed in txs {
            match self.parse_message_from_tx(indexed).await {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => {}
                Err(e @ (BridgeError::Verification(_) | BridgeError::Validation(_))) => {
                    let txid = indexed.tx.compute_txid().to_string();
                    log_security_event(
                        "deposit_rejected",
                        false,
                        serde_json::json!({
                            "txid": txid,
                            "height": indexed.height,
                            "reason": e.to_string(),
                        }),
                        None,
                    );
                    log_deposit_event(
                        "deposit_rejected",
                        super::deposit_sn(indexed.height, indexed.tx_index),
                        &txid,
                        "",
                        0,
                        Some(&e.to_string()),
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(messages)
    }

    /// Retry `op` with exponential backoff while its error is retryable.
    /// `Ok(None)` when shutdown was requested while waiting. Once the waits
    /// would exceed the retry budget the last error is returned.
    async fn with_retry<T, F, Fut>(
        &self,
        what: &str,
        shutdown: &mut watch::Receiver<bool>,
        mut op: F,
    ) -> Result<Option<T>, BridgeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        let mut backoff = INITIAL_BACKOFF.min(self.max_retry_wait);
        let mut waited = Duration::ZERO;
        let mut attempts = 0u32;
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(Some(value)),
                Err(e) if e.is_retryable() && waited + backoff <= self.retry_budget => {
                    tracing::warn!(
                        target: "bridge::listener",
                        op = what,
                        error = %e,
                        attempt = attempts,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Indexer call failed, retrying"
                    );
                }
                Err(e) if e.is_retryable() => {
                    tracing::error!(
                        target: "bridge::listener",
                        op = what,
                        error = %e,
                        attempts = attempts,
                        waited_secs = waited.as_secs(),
                        "Indexer call failed, giving up"
                    );
                    return Err(e);
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(None);
                    }
                }
            }
            waited += backoff;
            backoff = (backoff * 2).min(self.max_retry_wait);
        }
    }
}

/// `[from, to)` in [`RANGE_SIZE`] steps
fn split_ranges(from: u64, to: u64) -> Vec<(u64, u64)> {
    (from..to)
        .step_by(RANGE_SIZE as usize)
        .map(|start| (start, start.saturating_add(RANGE_SIZE).min(to)))
        .collect()
}

/// Ranges verified concurrently, one batch per history fetch
fn scan_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Sort by serial number and split into one [`BlockInfo`] per height
fn group_by_height(mut messages: Vec<RelayMessage>) -> Vec<BlockInfo> {
    messages.sort_by_key(|m| m.sn);
    let mut blocks: Vec<BlockInfo> = Vec::new();
    for message in messages {
        match blocks.last_mut() {
            Some(block) if block.height == message.message_height => block.messages.push(message),
            _ => blocks.push(BlockInfo {
                height: message.message_height,
                messages: vec![message],
            }),
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::message::ACTION_DEPOSIT;
    use crate::codec::BTC_TOKEN_ID;
    use crate::indexer::{IndexerError, MockIndexer};
    use crate::provider::{deposit_sn, EventType};
    use crate::provider::test_support::{deposit_msg, deposit_tx, provider, CONNECTOR};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_start_height_rules() {
        // Configured start inside the chain
        assert_eq!(start_height(100, 200, 150).unwrap(), 100);
        // Configured start beyond the tip falls through to saved progress
        assert_eq!(start_height(300, 200, 150).unwrap(), 150);
        assert_eq!(start_height(0, 200, 150).unwrap(), 150);
        // Nothing usable: start at the tip
        assert_eq!(start_height(0, 200, 0).unwrap(), 200);
        assert_eq!(start_height(0, 200, 200).unwrap(), 200);
        assert!(matches!(
            start_height(0, 200, 201),
            Err(BridgeError::Validation(_))
        ));
    }

    #[test]
    fn test_split_ranges() {
        assert_eq!(split_ranges(100, 105), vec![(100, 102), (102, 104), (104, 105)]);
        assert!(split_ranges(7, 7).is_empty());
    }

    #[tokio::test]
    async fn test_history_fetched_once_per_batch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let p = scanning_provider(0, vec![], Arc::clone(&calls));

        let (block_tx, _block_rx) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (from, to) = (1_000, 1_000 + 8 * RANGE_SIZE * scan_workers() as u64);
        let outcome = p.scan(from, to, &block_tx, &stop_rx).await.unwrap();

        assert!(matches!(outcome, Scan::Done(end) if end == to));
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        assert_eq!(p.store().last_height().await.unwrap(), Some(to));
    }

    #[test]
    fn test_group_by_height_orders_by_sn() {
        let msg = |height: u64, index: u32| RelayMessage {
            src: "0x2.btc".to_string(),
            dst: "0x2.icon".to_string(),
            sn: deposit_sn(height, index),
            data: vec![],
            message_height: height,
            event_type: EventType::EmitMessage,
        };
        let blocks = group_by_height(vec![msg(11, 0), msg(10, 5), msg(10, 1)]);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].height, 10);
        assert_eq!(
            blocks[0].messages.iter().map(|m| m.sn).collect::<Vec<_>>(),
            vec![deposit_sn(10, 1), deposit_sn(10, 5)]
        );
        assert_eq!(blocks[1].height, 11);
    }

    /// Provider whose indexer reports `latest` and answers each range query
    /// from `txs` by height
    fn scanning_provider(latest: u64, txs: Vec<IndexedTx>, calls: Arc<AtomicUsize>) -> Arc<BridgeProvider> {
        let mut mock = MockIndexer::new();
        mock.expect_latest_height().returning(move || Ok(latest));
        mock.expect_txs_in_range().returning(move |_, start, end| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(txs
                .iter()
                .filter(|t| t.height >= start && t.height < end)
                .cloned()
                .collect())
        });
        Arc::new(provider(0, "master", Arc::new(mock)))
    }

    #[tokio::test]
    async fn test_listener_delivers_deposits_in_order() {
        // Fixture provider only supplies the multisig script for the txs
        let fixture = provider(0, "master", Arc::new(MockIndexer::new()));
        let good = deposit_msg(BTC_TOKEN_ID, 20_000, ACTION_DEPOSIT, CONNECTOR);
        let at = |height: u64, tx_index: u32, paid: u64| IndexedTx {
            tx: deposit_tx(&fixture, &good, paid),
            height,
            tx_index,
        };
        let txs = vec![
            at(104, 9, 20_000),
            at(101, 3, 20_000),
            at(101, 1, 20_000),
            // Underpaid: rejected and skipped
            at(103, 0, 1_000),
        ];

        let calls = Arc::new(AtomicUsize::new(0));
        let p = scanning_provider(106, txs, Arc::clone(&calls));
        p.store().save_last_height(100).await.unwrap();

        let (block_tx, mut block_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let listener = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.listen(block_tx, stop_rx).await })
        };

        let first = block_rx.recv().await.unwrap();
        assert_eq!(first.height, 101);
        assert_eq!(
            first.messages.iter().map(|m| m.sn).collect::<Vec<_>>(),
            vec![(101u64 << 32) | 1, (101u64 << 32) | 3]
        );
        let second = block_rx.recv().await.unwrap();
        assert_eq!(second.height, 104);
        assert_eq!(second.messages.len(), 1);

        stop_tx.send(true).unwrap();
        listener.await.unwrap().unwrap();

        assert_eq!(p.store().last_height().await.unwrap(), Some(106));
        // [100,102) [102,104) [104,106), one history fetch per batch of ranges
        let batches = split_ranges(100, 106).chunks(scan_workers()).count();
        assert_eq!(calls.load(Ordering::SeqCst), batches);
        assert!(p.store().get_deposit(deposit_sn(103, 0)).await.unwrap().is_none());
        assert!(block_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_listener_retries_indexer_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut mock = MockIndexer::new();
        mock.expect_latest_height().returning(|| Ok(12));
        {
            let attempts = Arc::clone(&attempts);
            mock.expect_txs_in_range().returning(move |_, _, _| {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(IndexerError::Parse("bad gateway".to_string()))
                } else {
                    Ok(vec![])
                }
            });
        }
        let p = Arc::new(provider(0, "master", Arc::new(mock)));
        p.store().save_last_height(10).await.unwrap();

        let (block_tx, _block_rx) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let outcome = p.scan(10, 12, &block_tx, &stop_rx).await.unwrap();

        assert!(matches!(outcome, Scan::Done(12)));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(p.store().last_height().await.unwrap(), Some(12));
    }

    #[tokio::test]
    async fn test_listener_gives_up_after_retry_budget() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut mock = MockIndexer::new();
        {
            let attempts = Arc::clone(&attempts);
            mock.expect_latest_height().returning(move || {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(IndexerError::Parse("bad gateway".to_string()))
            });
        }
        let p = Arc::new(provider(0, "master", Arc::new(mock)));

        let (block_tx, _block_rx) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let err = tokio::time::timeout(Duration::from_secs(10), p.listen(block_tx, stop_rx))
            .await
            .expect("listener kept retrying")
            .unwrap_err();

        assert!(matches!(err, BridgeError::Network(_)));
        // waits of 0.5s and 1s fit the 2s budget, a third 1s wait does not
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(p.store().last_height().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_listener_stops_on_shutdown_while_retrying() {
        let mut mock = MockIndexer::new();
        mock.expect_latest_height()
            .returning(|| Err(IndexerError::NotFound("tip".to_string())));
        let p = Arc::new(provider(0, "master", Arc::new(mock)));

        let (block_tx, _block_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let listener = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.listen(block_tx, stop_rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();

        listener.await.unwrap().unwrap();
        assert_eq!(p.store().last_height().await.unwrap(), None);
    }
}
