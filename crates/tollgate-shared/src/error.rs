//! OpenAI-shaped error body.
//!
//! Every non-2xx answer from the gateway carries
//! `{"error":{"message":...,"type":...,"code":...}}` so that existing OpenAI
//! client libraries surface it unchanged.

use serde::{Deserialize, Serialize};

/// Top-level error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                kind: kind.into(),
                param: None,
                code: None,
            },
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error.code = Some(code.into());
        self
    }

    /// The 429 body.
    pub fn rate_limit_exceeded() -> Self {
        Self::new("Rate limit exceeded", "rate_limit_exceeded").with_code("rate_limit_exceeded")
    }

    /// 401 for a key that is not in the registry.
    pub fn invalid_api_key() -> Self {
        Self::new("Invalid API key", "invalid_request_error")
    }

    /// 401 for a missing or non-Bearer Authorization header.
    pub fn invalid_authorization() -> Self {
        Self::new("Invalid authorization header", "invalid_request_error")
    }

    /// 400 for a malformed or unsupported request.
    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(detail, "invalid_request_error")
    }

    /// 503 when the coordination store is unreachable under fail-closed policy.
    pub fn service_unavailable() -> Self {
        Self::new("Service temporarily unavailable", "service_unavailable")
    }

    /// 502/504 when the upstream model call failed or timed out.
    pub fn upstream_error(detail: impl Into<String>) -> Self {
        Self::new(detail, "upstream_error")
    }

    /// 500. Details stay in the logs.
    pub fn internal_error() -> Self {
        Self::new("Internal server error", "api_error")
    }
}
