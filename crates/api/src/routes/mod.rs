//! API routes

pub mod billing;
pub mod health;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Billing routes under /api/v1. The webhook endpoint is public and relies
    // on Stripe signature verification; the rest are called by the dashboard.
    let api_v1_routes = Router::new()
        .route("/billing/webhook", post(billing::webhook))
        .route("/billing/subscribe", post(billing::subscribe))
        .route("/billing/change-plan", post(billing::change_plan))
        .route("/billing/cancel", post(billing::cancel))
        .route(
            "/billing/memberships/:venue_id/:member_id",
            get(billing::get_membership),
        )
        .route(
            "/billing/payments/:venue_id/:member_id",
            get(billing::list_payments),
        );

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        // Stripe webhook payloads are small; 1MB is generous headroom
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}
