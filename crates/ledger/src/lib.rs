//! Asynchronous batched usage ledger.
//!
//! `record` is a non-blocking enqueue onto a bounded channel; worker tasks
//! drain it into batches and flush to a durable [`UsageStore`] when a batch
//! fills or the flush interval elapses. A full channel drops the entry with
//! a warning: the ledger favors request availability over durability, and
//! callers must never depend on a ledger write for correctness.
//!
//! ```text
//! record() ──→ bounded channel ──→ worker(s) ──→ batch ──→ UsageStore
//! ```

mod sqlite;
mod store;

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::{Mutex, mpsc};

pub use sqlite::SqliteStore;
pub use store::{Direction, UsageEntry, UsageStore, UsageSummary};

/// Handle to the asynchronous ledger.
pub struct Ledger {
    tx: mpsc::Sender<UsageEntry>,
    workers: Vec<tokio::task::JoinHandle<()>>,
    store: Arc<dyn UsageStore>,
    dropped: Arc<AtomicU64>,
}

impl Ledger {
    /// Start the ledger with the given durable store and tuning.
    pub fn spawn(store: Arc<dyn UsageStore>, config: &config::LedgerConfig) -> Self {
        let (tx, rx) = mpsc::channel::<UsageEntry>(config.channel_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let worker_count = config.workers.max(1);
        let mut workers = Vec::with_capacity(worker_count);

        for id in 0..worker_count {
            workers.push(tokio::spawn(worker_loop(
                id,
                rx.clone(),
                store.clone(),
                config.batch_size.max(1),
                config.flush_interval,
            )));
        }

        log::debug!(
            "ledger started: {worker_count} worker(s), batch_size={}, flush_interval={:?}",
            config.batch_size,
            config.flush_interval
        );

        Self {
            tx,
            workers,
            store,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue a usage entry. Never blocks; a full channel drops the entry
    /// and logs a warning.
    pub fn record(&self, entry: UsageEntry) {
        if let Err(e) = self.tx.try_send(entry) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            log::warn!("usage ledger channel full, dropping entry ({dropped} dropped so far): {e}");
        }
    }

    /// Aggregate a user's usage, reading the durable store directly.
    pub async fn summary(&self, user_id: &str) -> anyhow::Result<UsageSummary> {
        let store = self.store.clone();
        let user_id = user_id.to_string();

        tokio::task::spawn_blocking(move || store.summary(&user_id)).await?
    }

    /// The newest entries for a user, reading the durable store directly.
    pub async fn recent(&self, user_id: &str, limit: usize) -> anyhow::Result<Vec<UsageEntry>> {
        let store = self.store.clone();
        let user_id = user_id.to_string();

        tokio::task::spawn_blocking(move || store.recent(&user_id, limit)).await?
    }

    /// Entries dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting entries, drain the channel, flush every worker and
    /// close the store.
    pub async fn close(self) {
        // Dropping the sender closes the channel; workers drain and exit.
        drop(self.tx);

        for worker in self.workers {
            if let Err(e) = worker.await {
                log::error!("ledger worker panicked during shutdown: {e}");
            }
        }

        if let Err(e) = self.store.close() {
            log::error!("failed to close ledger store: {e}");
        }
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<UsageEntry>>>,
    store: Arc<dyn UsageStore>,
    batch_size: usize,
    flush_interval: std::time::Duration,
) {
    let mut batch: Vec<UsageEntry> = Vec::with_capacity(batch_size);

    loop {
        let received = {
            let mut rx = rx.lock().await;

            if batch.is_empty() {
                // Nothing buffered: wait as long as it takes.
                match rx.recv().await {
                    Some(entry) => Some(entry),
                    None => break,
                }
            } else {
                // Partial batch: wait at most the flush interval.
                match tokio::time::timeout(flush_interval, rx.recv()).await {
                    Ok(Some(entry)) => Some(entry),
                    Ok(None) => break,
                    Err(_) => None,
                }
            }
        };

        match received {
            Some(entry) => {
                batch.push(entry);

                if batch.len() >= batch_size {
                    flush(id, &store, &mut batch).await;
                }
            }
            // Flush interval elapsed with a partial batch.
            None => flush(id, &store, &mut batch).await,
        }
    }

    // Channel closed: final flush.
    flush(id, &store, &mut batch).await;
    log::debug!("ledger worker {id} stopped");
}

async fn flush(id: usize, store: &Arc<dyn UsageStore>, batch: &mut Vec<UsageEntry>) {
    if batch.is_empty() {
        return;
    }

    let entries = std::mem::take(batch);
    let count = entries.len();
    let store = store.clone();

    let result = tokio::task::spawn_blocking(move || store.record_batch(&entries)).await;

    match result {
        Ok(Ok(())) => log::trace!("ledger worker {id} flushed {count} entries"),
        Ok(Err(e)) => log::error!("ledger worker {id} failed to flush {count} entries: {e}"),
        Err(e) => log::error!("ledger worker {id} flush task failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(capacity: usize) -> config::LedgerConfig {
        config::LedgerConfig {
            enabled: true,
            path: "unused.db".into(),
            channel_capacity: capacity,
            workers: 2,
            batch_size: 10,
            flush_interval: Duration::from_millis(50),
        }
    }

    fn entry(user: &str, direction: Direction, prompt: u32, completion: u32) -> UsageEntry {
        UsageEntry::now(user, "gateway", prompt, completion, direction)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recorded_entries_reach_the_summary() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let ledger = Ledger::spawn(store.clone(), &test_config(1000));

        for _ in 0..100 {
            ledger.record(entry("42", Direction::Consume, 100, 50));
        }
        for _ in 0..50 {
            ledger.record(entry("42", Direction::Supply, 60, 20));
        }

        // close() drains the channel and final-flushes before returning.
        ledger.close().await;

        let summary = store.summary("42").unwrap();
        assert_eq!(summary.consumed, 15_000);
        assert_eq!(summary.supplied, 4_000);
        assert_eq!(summary.net, -11_000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn partial_batches_flush_on_interval() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let ledger = Ledger::spawn(store, &test_config(1000));

        // Three entries, well under batch_size.
        for _ in 0..3 {
            ledger.record(entry("7", Direction::Consume, 10, 0));
        }

        // Wait past the flush interval, then query through the live ledger.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let summary = ledger.summary("7").await.unwrap();
        assert_eq!(summary.consumed, 30);

        ledger.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_channel_drops_instead_of_blocking() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());

        // Capacity 1 and slow flushing makes overflow deterministic enough:
        // recording a burst synchronously cannot all fit.
        let mut config = test_config(1);
        config.flush_interval = Duration::from_secs(5);
        config.workers = 1;

        let ledger = Ledger::spawn(store, &config);

        for _ in 0..200 {
            ledger.record(entry("9", Direction::Consume, 1, 0));
        }

        assert!(ledger.dropped() > 0);
        ledger.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recent_reads_newest_entries() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let ledger = Ledger::spawn(store, &test_config(1000));

        ledger.record(entry("11", Direction::Consume, 1, 0));
        ledger.record(entry("11", Direction::Consume, 2, 0));

        tokio::time::sleep(Duration::from_millis(300)).await;

        let recent = ledger.recent("11", 10).await.unwrap();
        assert_eq!(recent.len(), 2);

        ledger.close().await;
    }
}
