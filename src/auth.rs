//! Outbound credential resolution.
//!
//! Maps the caller's incoming credential shape and the target model family to
//! the credential the proxy sends upstream. The decision table:
//!
//!   provider-native API key           -> pass through
//!   OAuth token + OAuth-capable model -> pass through as Bearer
//!   OAuth token + other model         -> configured env key, else 401

use axum::http::HeaderMap;

use crate::error::AppError;
use crate::providers::Provider;

/// Prefix Anthropic uses for OAuth ("Max" subscription) access tokens.
const OAUTH_TOKEN_PREFIX: &str = "sk-ant-oat";

/// Credential presented by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingAuth {
    /// A provider-native API key (from `x-api-key` or a bearer header).
    ApiKey(String),
    /// An OAuth access token (detected by the `sk-ant-oat` prefix).
    OAuth(String),
    None,
}

/// Credential the proxy attaches to the outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAuth {
    /// Sent as `x-api-key` (Anthropic) or `Authorization: Bearer` (others).
    ApiKey(String),
    /// Sent as `Authorization: Bearer`.
    Bearer(String),
}

/// Pull the caller's credential out of the request headers. `x-api-key`
/// takes precedence over `Authorization: Bearer`.
pub fn extract_incoming(headers: &HeaderMap) -> IncomingAuth {
    let raw = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        });

    match raw {
        Some(token) if token.starts_with(OAUTH_TOKEN_PREFIX) => IncomingAuth::OAuth(token),
        Some(key) => IncomingAuth::ApiKey(key),
        None => IncomingAuth::None,
    }
}

/// Whether a model accepts OAuth tokens directly. Anthropic's subscription
/// tokens work against the opus/sonnet tiers but not haiku, and no other
/// family accepts them at all.
pub fn supports_oauth(provider: Provider, model: &str) -> bool {
    provider == Provider::Anthropic && !model.contains("haiku")
}

/// Resolve the outbound credential for `model` on `provider`.
///
/// `env_key` is the value of the provider's API-key env var, resolved by the
/// caller so this stays a pure function.
pub fn resolve_outbound(
    incoming: &IncomingAuth,
    provider: Provider,
    model: &str,
    env_key: Option<&str>,
) -> Result<OutboundAuth, AppError> {
    match incoming {
        IncomingAuth::ApiKey(key) => Ok(OutboundAuth::ApiKey(key.clone())),
        IncomingAuth::OAuth(token) => {
            if supports_oauth(provider, model) {
                Ok(OutboundAuth::Bearer(token.clone()))
            } else if let Some(key) = env_key {
                Ok(OutboundAuth::ApiKey(key.to_string()))
            } else {
                Err(AppError::Unauthorized(format!(
                    "your OAuth token cannot be used with {model}; set {} to reach it \
                     with an API key",
                    provider.env_key_var()
                )))
            }
        }
        IncomingAuth::None => {
            if let Some(key) = env_key {
                Ok(OutboundAuth::ApiKey(key.to_string()))
            } else {
                Err(AppError::Unauthorized(format!(
                    "no credential provided and {} is not set",
                    provider.env_key_var()
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_extract_api_key() {
        let headers = headers_with("x-api-key", "sk-ant-api03-abc");
        assert_eq!(
            extract_incoming(&headers),
            IncomingAuth::ApiKey("sk-ant-api03-abc".into())
        );
    }

    #[test]
    fn test_extract_oauth_token() {
        let headers = headers_with("x-api-key", "sk-ant-oat-xyz");
        assert_eq!(
            extract_incoming(&headers),
            IncomingAuth::OAuth("sk-ant-oat-xyz".into())
        );
    }

    #[test]
    fn test_extract_bearer() {
        let headers = headers_with("authorization", "Bearer sk-proj-123");
        assert_eq!(
            extract_incoming(&headers),
            IncomingAuth::ApiKey("sk-proj-123".into())
        );
    }

    #[test]
    fn test_extract_none() {
        assert_eq!(extract_incoming(&HeaderMap::new()), IncomingAuth::None);
    }

    // The four contract cases.

    #[test]
    fn test_native_key_passes_through() {
        let incoming = IncomingAuth::ApiKey("sk-ant-api03-abc".into());
        let out = resolve_outbound(&incoming, Provider::Anthropic, "claude-sonnet-4-6", None)
            .unwrap();
        assert_eq!(out, OutboundAuth::ApiKey("sk-ant-api03-abc".into()));
    }

    #[test]
    fn test_oauth_to_oauth_model_passes_as_bearer() {
        let incoming = IncomingAuth::OAuth("sk-ant-oat-xyz".into());
        let out = resolve_outbound(&incoming, Provider::Anthropic, "claude-sonnet-4-6", None)
            .unwrap();
        assert_eq!(out, OutboundAuth::Bearer("sk-ant-oat-xyz".into()));
    }

    #[test]
    fn test_oauth_to_haiku_uses_env_key() {
        let incoming = IncomingAuth::OAuth("sk-ant-oat-xyz".into());
        let out = resolve_outbound(
            &incoming,
            Provider::Anthropic,
            "claude-haiku-4-5",
            Some("sk-ant-api03-env"),
        )
        .unwrap();
        assert_eq!(out, OutboundAuth::ApiKey("sk-ant-api03-env".into()));
    }

    #[test]
    fn test_oauth_to_haiku_without_env_key_is_401() {
        let incoming = IncomingAuth::OAuth("sk-ant-oat-xyz".into());
        let err = resolve_outbound(&incoming, Provider::Anthropic, "claude-haiku-4-5", None)
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn test_oauth_to_other_family_uses_env_key() {
        let incoming = IncomingAuth::OAuth("sk-ant-oat-xyz".into());
        let out = resolve_outbound(&incoming, Provider::OpenAi, "gpt-4o", Some("sk-proj-env"))
            .unwrap();
        assert_eq!(out, OutboundAuth::ApiKey("sk-proj-env".into()));
    }

    #[test]
    fn test_supports_oauth() {
        assert!(supports_oauth(Provider::Anthropic, "claude-opus-4-6"));
        assert!(supports_oauth(Provider::Anthropic, "claude-sonnet-4-6"));
        assert!(!supports_oauth(Provider::Anthropic, "claude-haiku-4-5"));
        assert!(!supports_oauth(Provider::OpenAi, "gpt-4o"));
    }
}
