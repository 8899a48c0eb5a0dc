//! Health check endpoint.

use actix_web::{HttpResponse, web};
use serde::Serialize;

use tollgate_core::ports::CounterStore;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: &'static str,
    pub version: &'static str,
}

/// GET /health - 200 when the node serves and the store answers, 503 when
/// the store does not.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    match state.store.ping().await {
        Ok(()) => HttpResponse::Ok().json(HealthResponse {
            status: "ok",
            store: "reachable",
            version: env!("CARGO_PKG_VERSION"),
        }),
        Err(error) => {
            tracing::warn!(%error, "health check: store unreachable");
            HttpResponse::ServiceUnavailable().json(HealthResponse {
                status: "degraded",
                store: "unreachable",
                version: env!("CARGO_PKG_VERSION"),
            })
        }
    }
}
