//! # Tollgate API Server
//!
//! One admission node of the distributed rate limiter. Any number of these
//! processes can front the same Redis store; per-key decisions stay
//! consistent because every admission is one atomic script execution there.

use actix_web::{App, HttpServer, web};
use tracing_actix_web::TracingLogger;

mod background;
mod config;
mod handlers;
mod middleware;
mod observability;
mod state;
mod telemetry;
mod upstream;

use background::{ReservationSweeper, SweepConfig};
use config::AppConfig;
use observability::RequestTracing;
use state::AppState;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    telemetry::init_telemetry(&telemetry::TelemetryConfig::from_env());

    let config = AppConfig::from_env().unwrap_or_else(|error| {
        tracing::error!(%error, "invalid configuration");
        std::process::exit(1);
    });

    let state = match AppState::new(&config).await {
        Ok(state) => state,
        Err(error) => {
            tracing::error!(%error, "startup failed");
            std::process::exit(1);
        }
    };

    // The sweep keeps abandoned reservations from leaking capacity.
    let sweep_config = SweepConfig {
        interval_secs: config.sweep_interval_secs,
        enabled: config.sweep_enabled,
    };
    let mut sweeper = match ReservationSweeper::start(state.engine.clone(), sweep_config).await {
        Ok(sweeper) => sweeper,
        Err(error) => {
            tracing::error!(%error, "failed to start the reservation sweep");
            std::process::exit(1);
        }
    };

    tracing::info!(
        host = %config.host,
        port = config.port,
        "Tollgate admission node listening"
    );

    let app_state = state.clone();
    let result = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .wrap(RequestTracing)
            .app_data(web::Data::new(app_state.clone()))
            .app_data(
                web::JsonConfig::default().error_handler(middleware::error::json_error_handler),
            )
            .configure(handlers::configure_routes)
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await;

    if let Err(error) = sweeper.shutdown().await {
        tracing::warn!(%error, "sweeper shutdown failed");
    }
    result
}
