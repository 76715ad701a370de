//! Model metadata source configuration.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the hot-reloadable model metadata catalog.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetadataConfig {
    /// Where to load metadata from: a local file path or an http(s) URL
    /// returning a JSON array of model entries. Unset means only the inline
    /// `models` entries below are used.
    pub source: Option<String>,
    /// How often the catalog is reloaded from `source`.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub reload_interval: Duration,
    /// Inline model entries, merged under any entries loaded from `source`.
    pub models: Vec<ModelEntry>,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            source: None,
            reload_interval: Duration::from_secs(24 * 3600),
            models: Vec::new(),
        }
    }
}

/// A single model metadata entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelEntry {
    /// Model identifier.
    pub model: String,
    /// Vendor family the model belongs to (`openai` or `anthropic`).
    pub provider: String,
    /// Context window size in tokens, when known.
    #[serde(default)]
    pub context_tokens: Option<u32>,
    /// Per-model completion token cap, when known.
    #[serde(default)]
    pub max_completion_cap: Option<u32>,
}
