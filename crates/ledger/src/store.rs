//! Usage entry types and the durable store contract.

use std::fmt;

/// Whether an entry consumes or supplies tokens from the user's balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Consume,
    Supply,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Consume => "consume",
            Direction::Supply => "supply",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "consume" => Some(Direction::Consume),
            "supply" => Some(Direction::Supply),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only usage record.
#[derive(Debug, Clone)]
pub struct UsageEntry {
    pub user_id: String,
    pub api_key_id: Option<String>,
    pub service_id: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub direction: Direction,
    pub memo: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

impl UsageEntry {
    /// An entry stamped with the current wall-clock time.
    pub fn now(
        user_id: impl Into<String>,
        service_id: impl Into<String>,
        prompt_tokens: u32,
        completion_tokens: u32,
        direction: Direction,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            api_key_id: None,
            service_id: service_id.into(),
            prompt_tokens,
            completion_tokens,
            direction,
            memo: String::new(),
            created_at: jiff::Timestamp::now().as_millisecond(),
        }
    }

    pub fn total_tokens(&self) -> i64 {
        i64::from(self.prompt_tokens) + i64::from(self.completion_tokens)
    }
}

/// Aggregate view of a user's recorded usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSummary {
    /// Total tokens across `consume` entries.
    pub consumed: i64,
    /// Total tokens across `supply` entries.
    pub supplied: i64,
    /// `supplied - consumed`.
    pub net: i64,
}

/// The durable store behind the async ledger.
///
/// Implementations are called from blocking worker contexts; they may block
/// freely. Summary and recent queries bypass the async batching path and
/// read the store directly.
pub trait UsageStore: Send + Sync {
    /// Persist a batch of entries.
    fn record_batch(&self, entries: &[UsageEntry]) -> anyhow::Result<()>;

    /// Aggregate a user's usage.
    fn summary(&self, user_id: &str) -> anyhow::Result<UsageSummary>;

    /// The newest entries for a user, most recent first.
    fn recent(&self, user_id: &str, limit: usize) -> anyhow::Result<Vec<UsageEntry>>;

    /// Flush and release underlying resources.
    fn close(&self) -> anyhow::Result<()>;
}
