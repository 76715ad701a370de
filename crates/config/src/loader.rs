use std::path::Path;

use anyhow::{Context, bail};
use indoc::indoc;
use secrecy::SecretString;

use crate::{Config, UpstreamConfig, WorkMode};

/// Environment variable prefix for configuration overrides.
///
/// Environment values take precedence over file values; only a fixed set of
/// keys is recognized so typos fail loudly in tests rather than silently.
const ENV_PREFIX: &str = "PRISM_";

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| format!("invalid configuration in {}", path.display()))?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;

    Ok(config)
}

pub(crate) fn apply_env_overrides(
    config: &mut Config,
    get: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(listen) = get(&format!("{ENV_PREFIX}LISTEN")) {
        config.server.listen_address = Some(
            listen
                .parse()
                .with_context(|| format!("invalid {ENV_PREFIX}LISTEN address: {listen}"))?,
        );
    }

    if let Some(mode) = get(&format!("{ENV_PREFIX}WORK_MODE")) {
        config.llm.work_mode = match mode.as_str() {
            "auto" => WorkMode::Auto,
            "passthrough" => WorkMode::Passthrough,
            "translation" => WorkMode::Translation,
            other => bail!("invalid {ENV_PREFIX}WORK_MODE value: {other}"),
        };
    }

    if let Some(url) = get(&format!("{ENV_PREFIX}OPENAI_BASE_URL")) {
        upstream_mut(&mut config.llm.upstreams.openai, &url).base_url = url.clone();
    }

    if let Some(key) = get(&format!("{ENV_PREFIX}OPENAI_API_KEY"))
        && let Some(upstream) = config.llm.upstreams.openai.as_mut()
    {
        upstream.api_key = Some(SecretString::from(key));
    }

    if let Some(url) = get(&format!("{ENV_PREFIX}ANTHROPIC_BASE_URL")) {
        upstream_mut(&mut config.llm.upstreams.anthropic, &url).base_url = url.clone();
    }

    if let Some(key) = get(&format!("{ENV_PREFIX}ANTHROPIC_API_KEY"))
        && let Some(upstream) = config.llm.upstreams.anthropic.as_mut()
    {
        upstream.api_key = Some(SecretString::from(key));
    }

    if let Some(path) = get(&format!("{ENV_PREFIX}LEDGER_PATH")) {
        config.ledger.path = path.into();
    }

    if let Some(source) = get(&format!("{ENV_PREFIX}METADATA_SOURCE")) {
        config.metadata.source = Some(source);
    }

    Ok(())
}

fn upstream_mut<'a>(slot: &'a mut Option<UpstreamConfig>, base_url: &str) -> &'a mut UpstreamConfig {
    slot.get_or_insert_with(|| UpstreamConfig {
        base_url: base_url.to_string(),
        api_key: None,
        extra_headers: Default::default(),
        anthropic_version: None,
    })
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    if !config.llm.has_upstreams() {
        // Loopback still works without upstreams, which is useful for smoke
        // tests, so this is a warning rather than a hard failure.
        log::warn!(indoc! {r#"
            No upstream providers configured. Only the reserved `loopback` model will be servable.

            Example configuration:

              [llm.upstreams.openai]
              base_url = "https://api.openai.com/v1"
              api_key = "sk-..."

              [llm.upstreams.anthropic]
              base_url = "https://api.anthropic.com/v1"
              api_key = "sk-ant-..."
        "#});
    }

    for rule in &config.llm.aliases {
        let wildcards = rule.pattern.matches('*').count();

        if wildcards > 1 || (wildcards == 1 && !rule.pattern.ends_with('*')) {
            bail!(
                "invalid alias pattern '{}': wildcards are limited to a single trailing '*'",
                rule.pattern
            );
        }

        if rule.target.contains('*') {
            bail!("invalid alias target '{}': targets must be literal model ids", rule.target);
        }
    }

    if config.ledger.enabled {
        if config.ledger.workers == 0 {
            bail!("ledger.workers must be at least 1");
        }

        if config.ledger.batch_size == 0 {
            bail!("ledger.batch_size must be at least 1");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Config {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = parse(
            r#"
            [server]
            listen_address = "127.0.0.1:8080"

            [llm]
            work_mode = "auto"

            [llm.upstreams.openai]
            base_url = "https://api.openai.com/v1"
            api_key = "from-file"
            "#,
        );

        apply_env_overrides(&mut config, |key| match key {
            "PRISM_LISTEN" => Some("0.0.0.0:9000".to_string()),
            "PRISM_WORK_MODE" => Some("passthrough".to_string()),
            "PRISM_OPENAI_API_KEY" => Some("from-env".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.server.listen_address.unwrap().port(), 9000);
        assert_eq!(config.llm.work_mode, WorkMode::Passthrough);

        use secrecy::ExposeSecret;
        let key = config.llm.upstreams.openai.unwrap().api_key.unwrap();
        assert_eq!(key.expose_secret(), "from-env");
    }

    #[test]
    fn env_base_url_creates_upstream() {
        let mut config = parse("");

        apply_env_overrides(&mut config, |key| match key {
            "PRISM_ANTHROPIC_BASE_URL" => Some("http://localhost:9999/v1".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(
            config.llm.upstreams.anthropic.unwrap().base_url,
            "http://localhost:9999/v1"
        );
    }

    #[test]
    fn rejects_invalid_work_mode_override() {
        let mut config = parse("");

        let result = apply_env_overrides(&mut config, |key| match key {
            "PRISM_WORK_MODE" => Some("yolo".to_string()),
            _ => None,
        });

        assert!(result.is_err());
    }

    #[test]
    fn rejects_interior_wildcard_alias() {
        let config = parse(
            r#"
            [[llm.aliases]]
            pattern = "claude-*-sonnet"
            target = "claude-3-5-haiku-latest"
            "#,
        );

        let error = validate(&config).unwrap_err().to_string();
        assert!(error.contains("single trailing '*'"), "{error}");
    }

    #[test]
    fn rejects_wildcard_alias_target() {
        let config = parse(
            r#"
            [[llm.aliases]]
            pattern = "claude-3-5-sonnet*"
            target = "claude-*"
            "#,
        );

        let error = validate(&config).unwrap_err().to_string();
        assert!(error.contains("targets must be literal"), "{error}");
    }

    #[test]
    fn rejects_zero_ledger_workers() {
        let config = parse(
            r#"
            [ledger]
            workers = 0
            "#,
        );

        assert!(validate(&config).is_err());
    }
}
