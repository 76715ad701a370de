//! Prism configuration structures mapping the prism.toml configuration.

#![deny(missing_docs)]

mod ledger;
mod llm;
mod loader;
mod metadata;
mod server;

use std::path::Path;

pub use ledger::LedgerConfig;
pub use llm::{AliasRule, LlmConfig, UpstreamConfig, UpstreamsConfig, WorkMode};
pub use metadata::{MetadataConfig, ModelEntry};
use serde::Deserialize;
pub use server::{HealthConfig, ServerConfig};

/// Main configuration structure for the Prism gateway.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    pub server: ServerConfig,
    /// Routing, translation and upstream configuration.
    pub llm: LlmConfig,
    /// Model metadata source configuration.
    pub metadata: MetadataConfig,
    /// Usage ledger configuration.
    pub ledger: LedgerConfig,
}

impl Config {
    /// Load configuration from a file path, applying environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates that the configuration can serve requests.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;

    use crate::Config;

    #[test]
    fn defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_debug_snapshot!(&config, @r#"
        Config {
            server: ServerConfig {
                listen_address: None,
                health: HealthConfig {
                    enabled: true,
                    path: "/health",
                },
            },
            llm: LlmConfig {
                work_mode: Auto,
                aliases: [],
                upstreams: UpstreamsConfig {
                    openai: None,
                    anthropic: None,
                },
                max_output_tokens: None,
                continuation_ttl: 600s,
            },
            metadata: MetadataConfig {
                source: None,
                reload_interval: 86400s,
                models: [],
            },
            ledger: LedgerConfig {
                enabled: true,
                path: "./data/usage.db",
                channel_capacity: 10000,
                workers: 1,
                batch_size: 100,
                flush_interval: 1s,
            },
        }
        "#);
    }

    #[test]
    fn work_mode_parsing() {
        let config: Config = toml::from_str(
            r#"
            [llm]
            work_mode = "translation"
            "#,
        )
        .unwrap();

        assert_eq!(config.llm.work_mode, crate::WorkMode::Translation);
    }
}
