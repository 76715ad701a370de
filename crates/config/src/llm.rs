//! Routing, translation and upstream configuration.

use std::{collections::BTreeMap, fmt, time::Duration};

use secrecy::SecretString;
use serde::Deserialize;

/// Work mode policy selecting which request handling modes are permitted.
///
/// Passthrough means the endpoint dialect matches the model family; translation
/// means the gateway converts the payload between dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkMode {
    /// Both passthrough and translation are allowed.
    #[default]
    Auto,
    /// Only passthrough is allowed; translation requests are rejected.
    Passthrough,
    /// Only translation is allowed; passthrough requests are rejected.
    Translation,
}

impl fmt::Display for WorkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkMode::Auto => write!(f, "auto"),
            WorkMode::Passthrough => write!(f, "passthrough"),
            WorkMode::Translation => write!(f, "translation"),
        }
    }
}

/// A single model alias rewrite rule.
///
/// Patterns are either literal model identifiers or end with a single trailing
/// `*` wildcard. Rules are applied in order; exact matches take precedence over
/// wildcard matches.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AliasRule {
    /// The pattern to match against the incoming model identifier.
    pub pattern: String,
    /// The replacement model identifier.
    pub target: String,
}

/// Configuration for a single upstream provider endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Base URL of the upstream API, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// API key used to authenticate against the upstream.
    #[serde(default)]
    pub api_key: Option<SecretString>,
    /// Extra headers attached to every upstream request.
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
    /// Anthropic API version header value. Only meaningful for the Anthropic
    /// upstream; defaults to `2023-06-01` when unset.
    #[serde(default)]
    pub anthropic_version: Option<String>,
}

/// Upstream targets keyed by vendor family.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamsConfig {
    /// OpenAI-family upstream.
    pub openai: Option<UpstreamConfig>,
    /// Anthropic-family upstream.
    pub anthropic: Option<UpstreamConfig>,
}

/// Core gateway configuration: work mode, aliases, upstreams and caps.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    /// The work mode policy applied to every request.
    pub work_mode: WorkMode,
    /// Ordered model alias rewrite rules. First match wins.
    pub aliases: Vec<AliasRule>,
    /// Upstream provider endpoints.
    pub upstreams: UpstreamsConfig,
    /// Global cap applied to outgoing `max_tokens` values. Unset means no
    /// global clamp.
    pub max_output_tokens: Option<u32>,
    /// Time-to-live of suspended tool-call continuations.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub continuation_ttl: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            work_mode: WorkMode::default(),
            aliases: Vec::new(),
            upstreams: UpstreamsConfig::default(),
            max_output_tokens: None,
            continuation_ttl: Duration::from_secs(600),
        }
    }
}

impl LlmConfig {
    /// Whether any upstream provider is configured.
    pub fn has_upstreams(&self) -> bool {
        self.upstreams.openai.is_some() || self.upstreams.anthropic.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases_in_order() {
        let config: LlmConfig = toml::from_str(
            r#"
            work_mode = "auto"

            [[aliases]]
            pattern = "claude-3-5-sonnet-20241022"
            target = "claude-3-5-haiku-latest"

            [[aliases]]
            pattern = "claude-3-5-sonnet*"
            target = "claude-3-5-haiku-latest"
            "#,
        )
        .unwrap();

        assert_eq!(config.aliases.len(), 2);
        assert_eq!(config.aliases[0].pattern, "claude-3-5-sonnet-20241022");
        assert_eq!(config.aliases[1].pattern, "claude-3-5-sonnet*");
    }

    #[test]
    fn parses_upstreams() {
        let config: LlmConfig = toml::from_str(
            r#"
            [upstreams.openai]
            base_url = "https://api.openai.com/v1"
            api_key = "sk-test"

            [upstreams.anthropic]
            base_url = "https://api.anthropic.com/v1"
            api_key = "sk-ant-test"
            anthropic_version = "2023-06-01"
            "#,
        )
        .unwrap();

        assert!(config.has_upstreams());
        let anthropic = config.upstreams.anthropic.unwrap();
        assert_eq!(anthropic.anthropic_version.as_deref(), Some("2023-06-01"));
    }

    #[test]
    fn continuation_ttl_accepts_human_durations() {
        let config: LlmConfig = toml::from_str(r#"continuation_ttl = "5m""#).unwrap();
        assert_eq!(config.continuation_ttl, Duration::from_secs(300));
    }
}
