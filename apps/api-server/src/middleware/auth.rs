//! Authentication extractor.
//!
//! Resolves the Bearer token against the key registry before any counter is
//! touched: unknown or malformed credentials answer 401 without reaching the
//! quota engine.

use std::future::{Ready, ready};

use actix_web::{FromRequest, HttpRequest, dev::Payload, http::header, web};

use tollgate_core::domain::{ApiKey, KeyLimits};

use crate::state::AppState;

use super::error::ApiError;

/// The authenticated key with its ceilings. Use as a handler parameter to
/// require a valid API key.
#[derive(Debug, Clone)]
pub struct KeyIdentity {
    pub api_key: ApiKey,
    pub limits: KeyLimits,
}

impl FromRequest for KeyIdentity {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(resolve(req))
    }
}

fn resolve(req: &HttpRequest) -> Result<KeyIdentity, ApiError> {
    let state = req
        .app_data::<web::Data<AppState>>()
        .ok_or_else(|| ApiError::Internal("AppState not found in app data".to_string()))?;

    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::MissingAuthorization)?;

    let limits = state.keys.get(token).ok_or(ApiError::UnknownKey)?;

    Ok(KeyIdentity {
        api_key: ApiKey::new(token),
        limits,
    })
}
