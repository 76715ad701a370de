//! Per-request context derived from transport headers.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::error::LlmError;

/// Runtime context for one request: the caller's identity for usage
/// attribution, derived from the presented credential.
///
/// The gateway does not validate credentials against a tenant registry (that
/// lives outside the core); it requires one to be present and hashes it into
/// a stable ledger identity.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Stable identifier derived from the credential hash.
    pub user_id: String,
    /// Same derivation, recorded alongside usage entries.
    pub api_key_id: String,
}

/// Extract the request context from headers.
///
/// Accepts `Authorization: Bearer <key>` (OpenAI-family clients) or
/// `x-api-key: <key>` (Anthropic-family clients). Missing both is an
/// authentication failure.
pub fn extract_context(headers: &HeaderMap) -> Result<RequestContext, LlmError> {
    let credential = bearer_token(headers)
        .or_else(|| api_key_header(headers))
        .ok_or_else(|| {
            LlmError::Unauthenticated("provide Authorization: Bearer <key> or x-api-key: <key>".to_string())
        })?;

    if credential.is_empty() {
        return Err(LlmError::Unauthenticated("empty credential".to_string()));
    }

    let digest = Sha256::digest(credential.as_bytes());
    let hash = hex_prefix(&digest, 12);

    Ok(RequestContext {
        user_id: hash.clone(),
        api_key_id: hash,
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

fn api_key_header(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-api-key").and_then(|value| value.to_str().ok()).map(str::trim)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len);

    for byte in bytes {
        if out.len() >= len {
            break;
        }
        out.push_str(&format!("{byte:02x}"));
    }

    out.truncate(len);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_credential_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bearer sk-test"));

        let context = extract_context(&headers).unwrap();
        assert_eq!(context.user_id.len(), 12);
        assert_eq!(context.user_id, context.api_key_id);
    }

    #[test]
    fn api_key_credential_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-ant-test"));

        assert!(extract_context(&headers).is_ok());
    }

    #[test]
    fn missing_credential_is_unauthenticated() {
        let headers = HeaderMap::new();
        let error = extract_context(&headers).unwrap_err();
        assert!(matches!(error, LlmError::Unauthenticated(_)));
    }

    #[test]
    fn same_credential_hashes_to_same_identity() {
        let mut first = HeaderMap::new();
        first.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bearer sk-test"));

        let mut second = HeaderMap::new();
        second.insert("x-api-key", HeaderValue::from_static("sk-test"));

        assert_eq!(
            extract_context(&first).unwrap().user_id,
            extract_context(&second).unwrap().user_id
        );
    }
}
