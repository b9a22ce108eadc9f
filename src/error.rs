use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::providers::ProviderError;

/// Unified application error type following the OpenAI error format.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unknown model: {model}")]
    UnknownModel {
        model: String,
        suggestions: Vec<String>,
    },

    #[error("Authentication required: {0}")]
    Unauthorized(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("All providers cooling down: {0}")]
    CooldownExhausted(String),

    #[error("Upstream error ({status})")]
    UpstreamStatus { status: u16, body: Vec<u8> },

    #[error("Upstream timeout after {timeout_secs}s")]
    UpstreamTimeout { timeout_secs: u64 },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// OpenAI-compatible error response body, extended with model-name
/// suggestions where applicable.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    r#type: String,
    code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestions: Option<Vec<String>>,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::UnknownModel { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::BudgetExceeded(_) => StatusCode::PAYMENT_REQUIRED,
            Self::CooldownExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::BadRequest(_) | Self::UnknownModel { .. } => "invalid_request_error",
            Self::Unauthorized(_) => "authentication_error",
            Self::BudgetExceeded(_) => "budget_error",
            Self::CooldownExhausted(_) => "overloaded_error",
            Self::UpstreamStatus { .. } | Self::Upstream(_) | Self::UpstreamTimeout { .. } => {
                "api_error"
            }
            Self::Internal(_) => "server_error",
        }
    }

    fn error_code(&self) -> Option<&str> {
        match self {
            Self::UnknownModel { .. } => Some("model_not_found"),
            Self::Unauthorized(_) => Some("invalid_api_key"),
            Self::BudgetExceeded(_) => Some("budget_exceeded"),
            Self::CooldownExhausted(_) => Some("provider_cooldown"),
            Self::UpstreamTimeout { .. } => Some("upstream_timeout"),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Upstream bodies are mirrored verbatim so clients see the provider's
        // own error shape.
        if let Self::UpstreamStatus { status, body } = self {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            return (status, body).into_response();
        }

        let suggestions = match &self {
            Self::UnknownModel { suggestions, .. } if !suggestions.is_empty() => {
                Some(suggestions.clone())
            }
            _ => None,
        };
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorDetail {
                message: self.to_string(),
                r#type: self.error_type().to_string(),
                code: self.error_code().map(String::from),
                suggestions,
            },
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {err}"))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout { timeout_secs } => Self::UpstreamTimeout { timeout_secs },
            ProviderError::Api { status, body } => Self::UpstreamStatus { status, body },
            other => Self::Upstream(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Model-name suggestions
// ---------------------------------------------------------------------------

/// Edit distance used to offer "did you mean" suggestions for mistyped model
/// names.
const MAX_SUGGESTION_DISTANCE: usize = 4;

/// Return known model names within Levenshtein distance 4 of `input`,
/// closest first.
pub fn suggest_models<'a, I>(input: &str, known: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut scored: Vec<(usize, &str)> = known
        .into_iter()
        .filter_map(|candidate| {
            let d = levenshtein(input, candidate);
            (d <= MAX_SUGGESTION_DISTANCE).then_some((d, candidate))
        })
        .collect();
    scored.sort_by_key(|(d, _)| *d);
    scored.into_iter().map(|(_, c)| c.to_string()).collect()
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let sub_cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + sub_cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
