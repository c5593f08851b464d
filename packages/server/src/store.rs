//! Persistence for uploaded scenario documents.
//!
//! The store keeps the raw YAML of every uploaded scenario so operators can
//! re-activate an earlier version from the dashboard. It is deliberately
//! decoupled from the coordination engine: a store failure surfaces as an
//! API error and never touches a running saga.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

/// A scenario document as persisted.
#[derive(Debug, Clone, Serialize)]
pub struct StoredScenario {
    pub id: i64,
    pub name: String,
    pub yaml_content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid stored timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),
}

/// History of uploaded scenario documents.
#[async_trait]
pub trait ScenarioStore: Send + Sync {
    /// Persist a document; returns its id.
    async fn save(&self, name: &str, yaml: &str) -> Result<i64, StoreError>;

    /// All stored documents, newest first.
    async fn list(&self) -> Result<Vec<StoredScenario>, StoreError>;

    /// One document by id.
    async fn get(&self, id: i64) -> Result<Option<StoredScenario>, StoreError>;
}

/// SQLite-backed store. The database file is created on first use.
pub struct SqliteScenarioStore {
    pool: SqlitePool,
}

impl SqliteScenarioStore {
    /// Open (or create) the database and ensure the schema. Accepts a bare
    /// file path or a `sqlite://` URL.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let path = database_url
            .strip_prefix("sqlite://")
            .unwrap_or(database_url);
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS scenarios (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                yaml_content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

fn scenario_from_row(row: SqliteRow) -> Result<StoredScenario, StoreError> {
    let created_raw: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_raw)?.with_timezone(&Utc);
    Ok(StoredScenario {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        yaml_content: row.try_get("yaml_content")?,
        created_at,
    })
}

#[async_trait]
impl ScenarioStore for SqliteScenarioStore {
    async fn save(&self, name: &str, yaml: &str) -> Result<i64, StoreError> {
        let created_at = Utc::now().to_rfc3339();
        let result =
            sqlx::query("INSERT INTO scenarios (name, yaml_content, created_at) VALUES (?1, ?2, ?3)")
                .bind(name)
                .bind(yaml)
                .bind(&created_at)
                .execute(&self.pool)
                .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list(&self) -> Result<Vec<StoredScenario>, StoreError> {
        // Newest first; id breaks ties between same-timestamp uploads.
        let rows = sqlx::query(
            "SELECT id, name, yaml_content, created_at FROM scenarios
             ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(scenario_from_row).collect()
    }

    async fn get(&self, id: i64) -> Result<Option<StoredScenario>, StoreError> {
        let row =
            sqlx::query("SELECT id, name, yaml_content, created_at FROM scenarios WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(scenario_from_row).transpose()
    }
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Default)]
pub struct InMemoryScenarioStore {
    entries: std::sync::Mutex<Vec<StoredScenario>>,
}

impl InMemoryScenarioStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScenarioStore for InMemoryScenarioStore {
    async fn save(&self, name: &str, yaml: &str) -> Result<i64, StoreError> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = entries.len() as i64 + 1;
        entries.push(StoredScenario {
            id,
            name: name.to_string(),
            yaml_content: yaml.to_string(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn list(&self) -> Result<Vec<StoredScenario>, StoreError> {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Entries are appended in save order; newest first on the way out.
        Ok(entries.iter().rev().cloned().collect())
    }

    async fn get(&self, id: i64) -> Result<Option<StoredScenario>, StoreError> {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(entries.iter().find(|entry| entry.id == id).cloned())
    }
}
