use anyhow::{Context, Result};
use std::env;

use dotenvy::dotenv;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port the HTTP/WebSocket listener binds.
    pub port: u16,
    /// Optional scenario file loaded at startup.
    pub scenario_file: Option<String>,
    /// SQLite database for scenario history: a file path or `sqlite://` URL.
    pub database_url: String,
    /// Capacity of the event intake queue.
    pub event_queue_capacity: usize,
    /// Number of log lines retained for the admin API.
    pub log_buffer_capacity: usize,
}

impl Config {
    /// Load configuration from the environment (and a `.env` file when
    /// present).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("PORT must be a valid port number")?,
            scenario_file: env::var("SCENARIO_FILE").ok().filter(|s| !s.is_empty()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "scenarios.db".to_string()),
            event_queue_capacity: env::var("EVENT_QUEUE_CAPACITY")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("EVENT_QUEUE_CAPACITY must be a number")?,
            log_buffer_capacity: env::var("LOG_BUFFER_CAPACITY")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()
                .context("LOG_BUFFER_CAPACITY must be a number")?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            scenario_file: None,
            database_url: "scenarios.db".to_string(),
            event_queue_capacity: 1000,
            log_buffer_capacity: 10_000,
        }
    }
}
