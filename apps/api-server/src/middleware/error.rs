//! Error mapping: the failure taxonomy of the admission path, converted to
//! HTTP statuses with the OpenAI-shaped error body.
//!
//! A rejected admission (429) is not represented here: it carries per-key
//! headers and is built inline by the chat handler.

use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse, ResponseError};

use tollgate_shared::ErrorBody;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed body or unsupported field.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or non-Bearer Authorization header.
    #[error("missing or malformed authorization header")]
    MissingAuthorization,

    /// Key not present in the registry.
    #[error("unknown API key")]
    UnknownKey,

    /// Coordination store unreachable under fail-closed policy.
    #[error("coordination store unavailable")]
    StoreUnavailable,

    /// The upstream model call failed.
    #[error("upstream call failed: {0}")]
    Upstream(String),

    /// The upstream model call exceeded its deadline.
    #[error("upstream call timed out")]
    UpstreamTimeout,

    /// Violated internal invariant. Logged before it is emitted.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::MissingAuthorization | ApiError::UnknownKey => StatusCode::UNAUTHORIZED,
            ApiError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());

        let body = match self {
            ApiError::InvalidRequest(detail) => ErrorBody::invalid_request(detail.clone()),
            ApiError::MissingAuthorization => ErrorBody::invalid_authorization(),
            ApiError::UnknownKey => ErrorBody::invalid_api_key(),
            ApiError::StoreUnavailable => {
                // Fail-closed: tell clients to come back shortly.
                builder.insert_header(("Retry-After", "1"));
                ErrorBody::service_unavailable()
            }
            ApiError::Upstream(detail) => {
                tracing::warn!(detail = %detail, "upstream failure");
                ErrorBody::upstream_error("Upstream request failed")
            }
            ApiError::UpstreamTimeout => ErrorBody::upstream_error("Upstream request timed out"),
            ApiError::Internal(detail) => {
                tracing::error!(detail = %detail, "internal error");
                ErrorBody::internal_error()
            }
        };

        builder.json(body)
    }
}

/// Handler for body-extraction failures so that malformed JSON also answers
/// with the OpenAI error shape.
pub fn json_error_handler(
    err: actix_web::error::JsonPayloadError,
    _req: &HttpRequest,
) -> actix_web::Error {
    ApiError::InvalidRequest(err.to_string()).into()
}
