//! The work-mode gate: decides per request whether passthrough or
//! translation handling is permitted.

use config::WorkMode;

use crate::{error::LlmError, model::Family};

/// The dialect an endpoint speaks, inferred from the route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `/v1/chat/completions`
    OpenaiChat,
    /// `/v1/responses`
    OpenaiResponses,
    /// `/v1/messages`
    AnthropicMessages,
    /// `/v1/embeddings`
    OpenaiEmbeddings,
}

impl Dialect {
    /// The vendor family of the endpoint's dialect.
    pub fn family(&self) -> Family {
        match self {
            Dialect::OpenaiChat | Dialect::OpenaiResponses | Dialect::OpenaiEmbeddings => Family::Openai,
            Dialect::AnthropicMessages => Family::Anthropic,
        }
    }
}

/// Check a classified request against the configured work mode.
///
/// Runs after alias resolution and classification. Loopback requests pass in
/// every mode; unknown families are rejected before the mode matrix applies.
pub fn check(mode: WorkMode, endpoint: Dialect, family: Family, model: &str) -> Result<(), LlmError> {
    match family {
        Family::Unknown => {
            return Err(LlmError::UnknownModel(model.to_string()));
        }
        Family::Loopback => return Ok(()),
        Family::Openai | Family::Anthropic => {}
    }

    let passthrough = endpoint.family() == family;

    match mode {
        WorkMode::Auto => Ok(()),
        WorkMode::Passthrough if passthrough => Ok(()),
        WorkMode::Passthrough => Err(LlmError::WorkModeRejection(
            "work_mode=passthrough does not support translation".to_string(),
        )),
        WorkMode::Translation if !passthrough => Ok(()),
        WorkMode::Translation => Err(LlmError::WorkModeRejection(
            "work_mode=translation does not support passthrough".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_allows_both_modes() {
        for endpoint in [Dialect::OpenaiChat, Dialect::AnthropicMessages, Dialect::OpenaiResponses] {
            for family in [Family::Openai, Family::Anthropic] {
                assert!(check(WorkMode::Auto, endpoint, family, "m").is_ok());
            }
        }
    }

    #[test]
    fn passthrough_rejects_translation() {
        let error = check(
            WorkMode::Passthrough,
            Dialect::OpenaiResponses,
            Family::Anthropic,
            "claude-3-5-haiku-20241022",
        )
        .unwrap_err();

        assert!(matches!(&error, LlmError::WorkModeRejection(message)
            if message == "work_mode=passthrough does not support translation"));

        assert!(check(WorkMode::Passthrough, Dialect::OpenaiChat, Family::Openai, "gpt-4o").is_ok());
        assert!(check(WorkMode::Passthrough, Dialect::AnthropicMessages, Family::Anthropic, "claude-3").is_ok());
    }

    #[test]
    fn translation_rejects_passthrough() {
        let error = check(WorkMode::Translation, Dialect::OpenaiChat, Family::Openai, "gpt-4o").unwrap_err();

        assert!(matches!(&error, LlmError::WorkModeRejection(message)
            if message == "work_mode=translation does not support passthrough"));

        assert!(check(WorkMode::Translation, Dialect::OpenaiChat, Family::Anthropic, "claude-3").is_ok());
        assert!(check(WorkMode::Translation, Dialect::AnthropicMessages, Family::Openai, "gpt-4o").is_ok());
    }

    #[test]
    fn loopback_passes_every_mode() {
        for mode in [WorkMode::Auto, WorkMode::Passthrough, WorkMode::Translation] {
            assert!(check(mode, Dialect::OpenaiChat, Family::Loopback, "loopback").is_ok());
            assert!(check(mode, Dialect::AnthropicMessages, Family::Loopback, "loopback").is_ok());
        }
    }

    #[test]
    fn unknown_family_is_rejected_first() {
        let error = check(WorkMode::Auto, Dialect::OpenaiChat, Family::Unknown, "mystery").unwrap_err();
        assert!(matches!(error, LlmError::UnknownModel(model) if model == "mystery"));
    }
}
