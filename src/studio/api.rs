use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::db::DbHandle;
use super::models::{Message, Project};
use super::producer::Producer;
use super::ws::WsMessage;
use crate::errors::StudioError;
use crate::explorer::presenter::{ResultPresenter, ViewSnapshot};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<WsMessage>,
    pub producer: Producer,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(db: DbHandle, ws_tx: broadcast::Sender<WsMessage>) -> Self {
        let producer = Producer::new(db.clone()).with_events(ws_tx.clone());
        Self {
            db,
            ws_tx,
            producer,
        }
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    #[serde(default)]
    pub value: String,
}

#[derive(Serialize)]
pub struct ProjectView {
    pub project: Project,
    pub view: ViewSnapshot,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<StudioError> for ApiError {
    fn from(err: StudioError) -> Self {
        match err {
            StudioError::Validation(e) => ApiError::BadRequest(e.to_string()),
            StudioError::ProjectNotFound { .. } => ApiError::NotFound("Project not found".to_string()),
            other => {
                tracing::error!(error = %other, "request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

fn internal(e: anyhow::Error) -> ApiError {
    tracing::error!(error = %format!("{:#}", e), "database call failed");
    ApiError::Internal(e.to_string())
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{id}", get(get_project))
        .route("/api/projects/{id}/messages", get(list_messages))
        .route("/api/projects/{id}/view", get(get_project_view))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_projects(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let projects = state
        .db
        .call(|db| db.list_projects())
        .await
        .map_err(internal)?;
    Ok(Json(projects))
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let submission = state.producer.submit(&req.value).await?;
    Ok((StatusCode::CREATED, Json(submission.project)))
}

async fn load_project(state: &SharedState, id: String) -> Result<(Project, Vec<Message>), ApiError> {
    let detail = state
        .db
        .call(move |db| db.get_project_detail(&id))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound("Project not found".to_string()))?;
    Ok((detail.project, detail.messages))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (project, _) = load_project(&state, id).await?;
    Ok(Json(project))
}

async fn list_messages(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (_, messages) = load_project(&state, id).await?;
    Ok(Json(messages))
}

async fn get_project_view(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (project, messages) = load_project(&state, id).await?;
    let mut presenter = ResultPresenter::new();
    presenter.update(&messages);
    Ok(Json(ProjectView {
        project,
        view: presenter.snapshot(),
    }))
}
