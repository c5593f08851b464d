//! Router assembly.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::ServerDeps;
use crate::server::{routes, ws};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<ServerDeps>,
}

/// Build the axum application: WebSocket endpoint plus the admin API.
///
/// CORS is permissive; the dashboard is served from anywhere during
/// development and the API carries no credentials.
pub fn build_app(deps: Arc<ServerDeps>) -> Router {
    let state = AppState { deps };

    Router::new()
        .route("/", get(routes::root))
        .route("/ws", get(ws::ws_handler))
        .route("/api/simulations", get(routes::get_simulations))
        .route("/api/sagas", get(routes::get_sagas))
        .route("/api/logs", get(routes::get_logs))
        .route("/api/scenario", get(routes::get_scenario))
        .route("/api/scenarios", get(routes::list_scenarios))
        .route("/api/scenarios/{id}", get(routes::get_scenario_yaml))
        .route("/api/scenarios/upload", post(routes::upload_scenario))
        .route("/api/scenarios/{id}/activate", post(routes::activate_scenario))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
