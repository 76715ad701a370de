//! Usage ledger configuration.

use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

/// Configuration for the asynchronous batched usage ledger.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    /// Whether usage recording is enabled.
    pub enabled: bool,
    /// Path to the SQLite database file.
    pub path: PathBuf,
    /// Capacity of the in-flight entry channel. When full, new entries are
    /// dropped with a warning rather than blocking request processing.
    pub channel_capacity: usize,
    /// Number of flush worker tasks.
    pub workers: usize,
    /// Entries accumulated per batch before a write.
    pub batch_size: usize,
    /// Maximum time a partial batch waits before being flushed.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub flush_interval: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("./data/usage.db"),
            channel_capacity: 10_000,
            workers: 1,
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
        }
    }
}
