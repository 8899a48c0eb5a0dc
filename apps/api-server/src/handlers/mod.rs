//! API route handlers.

mod chat;
mod health;

use actix_web::web;

/// Configure all API routes.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health::health_check))
        .service(
            web::scope("/v1").route("/chat/completions", web::post().to(chat::chat_completions)),
        );
}
