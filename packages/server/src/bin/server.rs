//! Orchestration server binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use simhub_server::config::Config;
use simhub_server::kernel::ServerDeps;
use simhub_server::server::build_app;
use simhub_server::store::SqliteScenarioStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,simhub_server=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let config = Config::from_env()?;

    let store = SqliteScenarioStore::connect(&config.database_url)
        .await
        .context("failed to open scenario database")?;
    let deps = ServerDeps::new(
        config.event_queue_capacity,
        config.log_buffer_capacity,
        Arc::new(store),
    );

    let _processor = deps.start_event_processor();

    // The initial scenario is optional; the server runs without one and an
    // operator can upload a document later.
    if let Some(path) = &config.scenario_file {
        match std::fs::read_to_string(path) {
            Ok(yaml) => match deps.scenarios.load_yaml(&yaml) {
                Ok(scenario) => deps.logs.info(format!(
                    "loaded initial scenario from {path}: {} ({} rules)",
                    scenario.name,
                    scenario.rules.len()
                )),
                Err(err) => {
                    tracing::warn!(error = %err, path = %path, "failed to parse initial scenario")
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, path = %path, "failed to read initial scenario")
            }
        }
    }

    let app = build_app(deps.clone());
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "server listening, websocket endpoint at /ws");

    axum::serve(listener, app).await.context("server failed")?;
    Ok(())
}
