//! HTTP administration surface.
//!
//! Read endpoints expose the live registry, saga records and the log buffer
//! for the dashboard; write endpoints manage scenario documents (upload,
//! activate). None of these touch a running saga.

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::kernel::log_store::LogEntry;
use crate::kernel::registry::SimulationInfo;
use crate::kernel::saga::SagaView;
use crate::server::app::AppState;

/// JSON error response with a status code.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// `GET /`: liveness banner.
pub async fn root() -> &'static str {
    "simhub orchestration server"
}

/// `GET /api/simulations`
pub async fn get_simulations(State(state): State<AppState>) -> Json<Vec<SimulationInfo>> {
    Json(state.deps.registry.snapshot())
}

/// `GET /api/sagas`
pub async fn get_sagas(State(state): State<AppState>) -> Json<Vec<SagaView>> {
    Json(state.deps.sagas.snapshot())
}

/// `GET /api/logs`
pub async fn get_logs(State(state): State<AppState>) -> Json<Vec<LogEntry>> {
    Json(state.deps.logs.snapshot())
}

#[derive(Debug, Serialize)]
pub struct ScenarioInfoResponse {
    pub name: String,
    pub rules: usize,
}

/// `GET /api/scenario`: the currently active rule set.
pub async fn get_scenario(
    State(state): State<AppState>,
) -> Result<Json<ScenarioInfoResponse>, ApiError> {
    match state.deps.scenarios.current() {
        Some(scenario) => Ok(Json(ScenarioInfoResponse {
            name: scenario.name.clone(),
            rules: scenario.rules.len(),
        })),
        None => Err(ApiError::not_found("no scenario loaded")),
    }
}

#[derive(Debug, Serialize)]
pub struct StoredScenarioResponse {
    pub id: i64,
    pub name: String,
    pub created_at: String,
}

/// `GET /api/scenarios`: stored scenario history.
pub async fn list_scenarios(
    State(state): State<AppState>,
) -> Result<Json<Vec<StoredScenarioResponse>>, ApiError> {
    let scenarios = state.deps.store.list().await.map_err(ApiError::internal)?;
    Ok(Json(
        scenarios
            .into_iter()
            .map(|scenario| StoredScenarioResponse {
                id: scenario.id,
                name: scenario.name,
                created_at: format_timestamp(scenario.created_at),
            })
            .collect(),
    ))
}

#[derive(Debug, Serialize)]
pub struct ScenarioYamlResponse {
    pub id: i64,
    pub name: String,
    pub yaml_content: String,
    pub created_at: String,
}

/// `GET /api/scenarios/{id}`: full YAML of one stored scenario.
pub async fn get_scenario_yaml(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ScenarioYamlResponse>, ApiError> {
    let scenario = state
        .deps
        .store
        .get(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("scenario not found"))?;
    Ok(Json(ScenarioYamlResponse {
        id: scenario.id,
        name: scenario.name,
        yaml_content: scenario.yaml_content,
        created_at: format_timestamp(scenario.created_at),
    }))
}

/// `POST /api/scenarios/upload`: multipart upload of a YAML scenario.
///
/// The document is validated by parsing, persisted to the store, and
/// activated in one step. Validation failures are 400s and leave the active
/// scenario untouched.
pub async fn upload_scenario(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<StoredScenarioResponse>, ApiError> {
    let mut upload: Option<(String, String)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("failed to parse form: {err}")))?
    {
        if field.name() == Some("scenario") {
            let filename = field.file_name().unwrap_or_default().to_lowercase();
            let text = field
                .text()
                .await
                .map_err(|err| ApiError::bad_request(format!("failed to read file: {err}")))?;
            upload = Some((filename, text));
            break;
        }
    }

    let Some((filename, yaml)) = upload else {
        return Err(ApiError::bad_request(
            "no file uploaded or invalid form field",
        ));
    };
    if !filename.ends_with(".yaml") && !filename.ends_with(".yml") {
        return Err(ApiError::bad_request(
            "file must be a YAML file (.yaml or .yml)",
        ));
    }

    let scenario = state.deps.scenarios.load_yaml(&yaml).map_err(|err| {
        state
            .deps
            .logs
            .error(format!("failed to validate uploaded scenario: {err}"));
        ApiError::bad_request(format!("failed to validate scenario: {err}"))
    })?;

    let id = state
        .deps
        .store
        .save(&scenario.name, &yaml)
        .await
        .map_err(ApiError::internal)?;
    state.deps.logs.info(format!(
        "scenario uploaded and saved: {} (id {id}, {} rules)",
        scenario.name,
        scenario.rules.len()
    ));

    let stored = state
        .deps
        .store
        .get(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::internal("saved scenario not found"))?;
    Ok(Json(StoredScenarioResponse {
        id: stored.id,
        name: stored.name,
        created_at: format_timestamp(stored.created_at),
    }))
}

/// `POST /api/scenarios/{id}/activate`: swap in a stored scenario.
pub async fn activate_scenario(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ScenarioInfoResponse>, ApiError> {
    let stored = state
        .deps
        .store
        .get(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("scenario not found"))?;

    let scenario = state
        .deps
        .scenarios
        .load_yaml(&stored.yaml_content)
        .map_err(|err| {
            state
                .deps
                .logs
                .error(format!("failed to load stored scenario {id}: {err}"));
            ApiError::internal(format!("failed to load scenario: {err}"))
        })?;

    state.deps.logs.info(format!(
        "scenario activated: {} (id {id}, {} rules)",
        scenario.name,
        scenario.rules.len()
    ));
    Ok(Json(ScenarioInfoResponse {
        name: scenario.name.clone(),
        rules: scenario.rules.len(),
    }))
}
