//! Model alias resolution and vendor family classification.

use std::fmt;

use crate::metadata::CatalogSnapshot;

/// The reserved model identifier served by the gateway itself.
pub const LOOPBACK_MODEL: &str = "loopback";

/// Vendor family a model identifier belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Openai,
    Anthropic,
    /// The reserved echo model, served without an upstream.
    Loopback,
    /// Not classifiable; the gate rejects these.
    Unknown,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Openai => write!(f, "openai"),
            Family::Anthropic => write!(f, "anthropic"),
            Family::Loopback => write!(f, "loopback"),
            Family::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classify a model identifier into its vendor family.
///
/// Matching is case-insensitive and prefix-based, with model metadata able
/// to flag additional identifiers as OpenAI-served.
pub fn classify(model: &str, catalog: &CatalogSnapshot) -> Family {
    let normalized = model.to_ascii_lowercase();

    if normalized == LOOPBACK_MODEL {
        return Family::Loopback;
    }

    if normalized.starts_with("claude") {
        return Family::Anthropic;
    }

    if normalized.starts_with("gpt")
        || normalized.starts_with("o1")
        || normalized.starts_with("o3")
        || normalized.starts_with("text-embedding-")
    {
        return Family::Openai;
    }

    match catalog.provider(&normalized) {
        Some("openai") => Family::Openai,
        Some("anthropic") => Family::Anthropic,
        _ => Family::Unknown,
    }
}

/// A compiled alias rewrite rule.
#[derive(Debug, Clone)]
struct CompiledAlias {
    /// Lowercased literal, or literal prefix for wildcard rules.
    pattern: String,
    target: String,
    wildcard: bool,
}

/// Config-driven model alias resolver.
///
/// Exact matches beat wildcard matches; among wildcard matches the longest
/// literal prefix wins, with ties broken by source order. Resolution follows
/// alias chains to a fixpoint so that re-resolving a resolved id is a no-op.
#[derive(Debug, Clone, Default)]
pub struct AliasResolver {
    rules: Vec<CompiledAlias>,
}

impl AliasResolver {
    pub fn new(rules: &[config::AliasRule]) -> Self {
        let rules = rules
            .iter()
            .map(|rule| {
                let lowered = rule.pattern.to_ascii_lowercase();
                let wildcard = lowered.ends_with('*');

                CompiledAlias {
                    pattern: if wildcard {
                        lowered[..lowered.len() - 1].to_string()
                    } else {
                        lowered
                    },
                    target: rule.target.clone(),
                    wildcard,
                }
            })
            .collect();

        Self { rules }
    }

    /// Rewrite a model identifier through the alias table. Identifiers with
    /// no applicable rule come back unchanged, original casing included;
    /// lookups themselves are case-insensitive.
    pub fn resolve(&self, model: &str) -> String {
        let mut current = model.to_string();

        // Follow chains to a fixpoint; the hop bound guards against cycles.
        for _ in 0..=self.rules.len() {
            let Some(next) = self.resolve_once(&current.to_ascii_lowercase()) else {
                break;
            };

            if next.eq_ignore_ascii_case(&current) {
                break;
            }

            current = next;
        }

        current
    }

    fn resolve_once(&self, model: &str) -> Option<String> {
        if let Some(rule) = self.rules.iter().find(|rule| !rule.wildcard && rule.pattern == model) {
            return Some(rule.target.clone());
        }

        self.rules
            .iter()
            .filter(|rule| rule.wildcard && model.starts_with(rule.pattern.as_str()))
            // max_by_key keeps the last maximum, so reverse the scan to make
            // source order win ties on prefix length.
            .rev()
            .max_by_key(|rule| rule.pattern.len())
            .map(|rule| rule.target.clone())
    }
}
