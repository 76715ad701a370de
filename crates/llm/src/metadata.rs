//! Hot-reloadable model metadata catalog.
//!
//! The catalog maps model identifiers to their vendor family, context window
//! and completion cap. It is replaced wholesale by snapshot swap: readers
//! clone an `Arc` under a short lock and keep working on their snapshot even
//! while a reload is in flight. Reload failures keep the previous snapshot.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::http_client::http_client;

/// Metadata for one model.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelMetadata {
    pub model: String,
    pub provider: String,
    #[serde(default)]
    pub context_tokens: Option<u32>,
    #[serde(default)]
    pub max_completion_cap: Option<u32>,
    #[serde(default)]
    pub updated_at: u64,
}

/// An immutable catalog snapshot.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    models: HashMap<String, ModelMetadata>,
}

impl CatalogSnapshot {
    pub(crate) fn from_entries(entries: Vec<config::ModelEntry>) -> Self {
        let mut models = HashMap::with_capacity(entries.len());

        for entry in entries {
            models.insert(
                entry.model.to_ascii_lowercase(),
                ModelMetadata {
                    model: entry.model,
                    provider: entry.provider,
                    context_tokens: entry.context_tokens,
                    max_completion_cap: entry.max_completion_cap,
                    updated_at: crate::messages::unified::to_openai::unix_timestamp(),
                },
            );
        }

        Self { models }
    }

    /// The vendor family string a model is flagged with, if any.
    pub fn provider(&self, model: &str) -> Option<&str> {
        self.models.get(model).map(|entry| entry.provider.as_str())
    }

    /// The completion token cap for a model. Absent entries mean "unknown"
    /// and the caller skips model-specific clamping.
    pub fn completion_cap(&self, model: &str) -> Option<u32> {
        self.models
            .get(&model.to_ascii_lowercase())
            .and_then(|entry| entry.max_completion_cap)
    }

    /// All entries, for the model listing endpoint.
    pub fn entries(&self) -> impl Iterator<Item = &ModelMetadata> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// The shared, reloadable catalog.
pub struct ModelCatalog {
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    config: config::MetadataConfig,
}

impl ModelCatalog {
    pub fn new(config: config::MetadataConfig) -> Self {
        let snapshot = CatalogSnapshot::from_entries(config.models.clone());

        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            config,
        }
    }

    /// The current snapshot. Cheap: one lock acquisition and an Arc clone.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn swap(&self, snapshot: CatalogSnapshot) {
        *self.snapshot.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(snapshot);
    }

    /// Reload the catalog from the configured source once. Inline entries
    /// stay present; source entries override them on conflicts.
    pub async fn reload(&self) -> anyhow::Result<usize> {
        let Some(source) = self.config.source.clone() else {
            return Ok(self.snapshot().len());
        };

        let raw = if source.starts_with("http://") || source.starts_with("https://") {
            http_client()
                .get(&source)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?
        } else {
            tokio::fs::read_to_string(&source).await?
        };

        let loaded: Vec<ModelMetadata> = serde_json::from_str(&raw)?;

        let mut snapshot = CatalogSnapshot::from_entries(self.config.models.clone());

        for entry in loaded {
            snapshot.models.insert(entry.model.to_ascii_lowercase(), entry);
        }

        let count = snapshot.len();
        self.swap(snapshot);

        Ok(count)
    }

    /// Run the periodic reload loop until cancellation. In-flight requests
    /// keep their captured snapshot; a failed reload logs and keeps the
    /// previous one.
    pub async fn refresh_loop(self: Arc<Self>, token: CancellationToken) {
        if self.config.source.is_none() {
            return;
        }

        let mut interval = tokio::time::interval(self.config.reload_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // The first tick fires immediately and performs the initial load.
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.reload().await {
                        Ok(count) => log::debug!("model metadata reloaded, {count} entries"),
                        Err(e) => log::warn!("model metadata reload failed, keeping previous snapshot: {e}"),
                    }
                }
                _ = token.cancelled() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn entry(model: &str, cap: Option<u32>) -> config::ModelEntry {
        config::ModelEntry {
            model: model.to_string(),
            provider: "openai".to_string(),
            context_tokens: Some(128_000),
            max_completion_cap: cap,
        }
    }

    #[test]
    fn inline_entries_answer_lookups() {
        let catalog = ModelCatalog::new(config::MetadataConfig {
            source: None,
            reload_interval: std::time::Duration::from_secs(3600),
            models: vec![entry("gpt-4o-mini", Some(16_384))],
        });

        let snapshot = catalog.snapshot();
        assert_eq!(snapshot.completion_cap("gpt-4o-mini"), Some(16_384));
        assert_eq!(snapshot.completion_cap("GPT-4O-MINI"), Some(16_384));
        assert_eq!(snapshot.completion_cap("unknown"), None);
    }

    #[tokio::test]
    async fn reload_from_file_swaps_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"model": "gpt-4o", "provider": "openai", "max_completion_cap": 4096}}]"#
        )
        .unwrap();

        let catalog = ModelCatalog::new(config::MetadataConfig {
            source: Some(file.path().display().to_string()),
            reload_interval: std::time::Duration::from_secs(3600),
            models: vec![entry("gpt-4o-mini", Some(16_384))],
        });

        let before = catalog.snapshot();
        assert_eq!(before.completion_cap("gpt-4o"), None);

        catalog.reload().await.unwrap();

        let after = catalog.snapshot();
        assert_eq!(after.completion_cap("gpt-4o"), Some(4096));
        // Inline entries survive the reload.
        assert_eq!(after.completion_cap("gpt-4o-mini"), Some(16_384));
        // The old snapshot is untouched for whoever captured it.
        assert_eq!(before.completion_cap("gpt-4o"), None);
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_snapshot() {
        let catalog = ModelCatalog::new(config::MetadataConfig {
            source: Some("/nonexistent/metadata.json".to_string()),
            reload_interval: std::time::Duration::from_secs(3600),
            models: vec![entry("gpt-4o-mini", Some(16_384))],
        });

        assert!(catalog.reload().await.is_err());
        assert_eq!(catalog.snapshot().completion_cap("gpt-4o-mini"), Some(16_384));
    }
}
