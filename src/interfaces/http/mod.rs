//! JSON-over-HTTP surface: client endpoints, the payment webhook and admin
//! overrides, all served from one [`TrialEngine`].

pub mod error;
pub mod handlers;

use crate::application::engine::TrialEngine;
use axum::Router;
use axum::routing::{get, post};

pub fn router(engine: TrialEngine) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/trial/activate", post(handlers::activate_trial))
        .route("/trial/status", get(handlers::trial_status))
        .route("/trial/consume", post(handlers::consume_report))
        .route("/subscription", get(handlers::active_subscription))
        .route("/subscription/history", get(handlers::subscription_history))
        .route("/subscription/cancel", post(handlers::cancel_subscription))
        .route("/webhooks/payments", post(handlers::payment_webhook))
        .route(
            "/admin/fingerprints/{hash}/block",
            post(handlers::block_fingerprint),
        )
        .route(
            "/admin/fingerprints/{hash}/unblock",
            post(handlers::unblock_fingerprint),
        )
        .route("/admin/trials/{token_id}/revoke", post(handlers::revoke_trial))
        .route("/admin/flags/{flag_id}/resolve", post(handlers::resolve_flag))
        .with_state(engine)
}
