//! API module - Axum HTTP server and routes

mod handlers;

use crate::store::InventoryStore;
use crate::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main application router with all endpoints
pub fn create_router<S: InventoryStore>(state: Arc<AppState<S>>) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ==========================================
        // Status & Health
        // ==========================================
        .route("/api/health", get(handlers::health_check))

        // ==========================================
        // Direct trades
        // ==========================================
        .route("/api/trades", post(handlers::settle_trade::<S>))
        .route("/api/trades/validate", post(handlers::validate_offer::<S>))
        .route("/api/trades/:trade_id", get(handlers::get_trade::<S>))

        // ==========================================
        // Inventory
        // ==========================================
        .route("/api/users/:user_id/trades", get(handlers::get_user_trades::<S>))
        .route("/api/users/:user_id/duplicates", get(handlers::get_duplicates::<S>))
        .route("/api/instances/:instance_id/affix", post(handlers::affix_instance::<S>))

        // Apply middleware
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
