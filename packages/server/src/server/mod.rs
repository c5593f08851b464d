//! Transport and administration surface: WebSocket connections and the
//! HTTP admin API.

pub mod app;
pub mod routes;
pub mod ws;

pub use app::{build_app, AppState};
