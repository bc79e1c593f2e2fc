use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;

use crate::config::EngineConfig;
use crate::engine::context::{ArtifactMap, ConversationTurn, ExecutionContext};
use crate::engine::dispatch::PhaseDispatcher;
use crate::errors::EngineError;
use crate::store::{DbHandle, Message, Project, Role};
use crate::stream::{StreamEvent, StreamingExecutor};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub dispatcher: PhaseDispatcher,
    pub engine: EngineConfig,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct SetPhaseRequest {
    pub phase: i64,
}

#[derive(Deserialize)]
pub struct DispatchRequest {
    pub content: String,
    /// Defaults to the project's current phase.
    pub phase: Option<i64>,
}

#[derive(serde::Serialize)]
pub struct ProjectDetail {
    pub project: Project,
    pub messages: Vec<Message>,
}

// ── Error handling ────────────────────────────────────────────────────

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

fn internal<T>(result: anyhow::Result<T>) -> Result<T, ApiError> {
    result.map_err(|e| ApiError::Internal(e.to_string()))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{id}", get(get_project).delete(delete_project))
        .route("/api/projects/{id}/phase", patch(set_phase))
        .route("/api/projects/{id}/files", get(list_files))
        .route("/api/projects/{id}/messages", post(dispatch_message))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Caller identity comes from the `X-User-Id` header. There is no auth layer
/// here; upstream middleware is expected to have validated the identity.
fn caller_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest("Missing X-User-Id header".to_string()))
}

/// Load a project the caller owns. A foreign project reads as not-found so
/// the API never confirms its existence to non-owners.
async fn owned_project(
    state: &SharedState,
    id: &str,
    caller: &str,
) -> Result<Project, ApiError> {
    let pid = id.to_string();
    let project = internal(state.db.call(move |db| db.get_project(&pid)).await)?;
    match project {
        Some(p) if p.owner_id == caller => Ok(p),
        _ => Err(ApiError::NotFound(format!("Project {} not found", id))),
    }
}

/// Regroup stored file rows into `collection -> relative path -> content`,
/// the shape handlers consume. Stored paths are `collection/relative`.
fn files_to_artifacts(files: &[crate::store::ProjectFile]) -> ArtifactMap {
    let mut map = ArtifactMap::new();
    for file in files {
        let (collection, rel) = file
            .file_path
            .split_once('/')
            .unwrap_or(("root", file.file_path.as_str()));
        map.entry(collection.to_string())
            .or_default()
            .insert(rel.to_string(), file.content.clone());
    }
    map
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_projects(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Project>>, ApiError> {
    let caller = caller_id(&headers)?;
    let projects = internal(state.db.call(move |db| db.list_projects(&caller)).await)?;
    Ok(Json(projects))
}

async fn create_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let caller = caller_id(&headers)?;
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Project name is required".to_string()));
    }
    let project = internal(
        state
            .db
            .call(move |db| {
                db.create_project(
                    req.name.trim(),
                    req.description.as_deref().unwrap_or(""),
                    &caller,
                )
            })
            .await,
    )?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ProjectDetail>, ApiError> {
    let caller = caller_id(&headers)?;
    let project = owned_project(&state, &id, &caller).await?;
    let pid = project.id.clone();
    let messages = internal(state.db.call(move |db| db.list_messages(&pid)).await)?;
    Ok(Json(ProjectDetail { project, messages }))
}

async fn delete_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = caller_id(&headers)?;
    let project = owned_project(&state, &id, &caller).await?;
    internal(state.db.call(move |db| db.delete_project(&project.id)).await)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_phase(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<SetPhaseRequest>,
) -> Result<Json<Project>, ApiError> {
    let caller = caller_id(&headers)?;
    let project = owned_project(&state, &id, &caller).await?;
    if !(1..=crate::engine::dispatch::PHASE_COUNT).contains(&req.phase) {
        return Err(ApiError::BadRequest(format!(
            "Phase must be between 1 and {}",
            crate::engine::dispatch::PHASE_COUNT
        )));
    }
    let updated = internal(
        state
            .db
            .call(move |db| db.set_current_phase(&project.id, req.phase))
            .await,
    )?;
    Ok(Json(updated))
}

async fn list_files(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<crate::store::ProjectFile>>, ApiError> {
    let caller = caller_id(&headers)?;
    let project = owned_project(&state, &id, &caller).await?;
    let files = internal(state.db.call(move |db| db.list_files(&project.id)).await)?;
    Ok(Json(files))
}

/// The dispatch endpoint. Records the user message, resolves the phase
/// handler, and streams the execution as server-sent events. The user
/// message is durable before any event is emitted, so a dropped connection
/// never loses the caller's input.
async fn dispatch_message(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<DispatchRequest>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let caller = caller_id(&headers)?;
    if req.content.trim().is_empty() {
        return Err(ApiError::BadRequest("Message content is required".to_string()));
    }
    let project = owned_project(&state, &id, &caller).await?;
    let phase = req.phase.unwrap_or(project.current_phase);

    let handler = match state.dispatcher.resolve(phase) {
        Ok(h) => h,
        Err(EngineError::InvalidPhase { phase }) => {
            return Err(ApiError::BadRequest(format!("Unknown phase {}", phase)));
        }
        Err(e) => return Err(ApiError::Internal(e.to_string())),
    };

    // One DB pass: snapshot prior context, then record the user turn.
    let pid = project.id.clone();
    let content = req.content.clone();
    let (prior_messages, prior_artifacts) = internal(
        state
            .db
            .call(move |db| {
                let history = db.list_phase_messages(&pid, phase)?;
                let files = db.list_files(&pid)?;
                db.append_message(&pid, phase, Role::User, &content)?;
                Ok((history, files))
            })
            .await,
    )
    .map(|(history, files)| {
        let turns = history
            .into_iter()
            .map(|m| ConversationTurn {
                role: m.role.as_str().to_string(),
                content: m.content,
            })
            .collect::<Vec<_>>();
        (turns, files_to_artifacts(&files))
    })?;

    let mut ctx = ExecutionContext::new(&project.id, &project.name, &req.content);
    ctx.prior_messages = prior_messages;
    ctx.prior_artifacts = prior_artifacts;

    let executor = StreamingExecutor::new(state.db.clone(), state.engine.clone());
    let (tx, rx) = mpsc::channel::<StreamEvent>(64);
    let project_id = project.id.clone();
    tokio::spawn(async move {
        if let Err(e) = executor.run(&project_id, phase, handler, ctx, tx).await {
            match e {
                EngineError::StreamAborted => {}
                other => error!(%project_id, phase, error = %other, "dispatch failed"),
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(|ev| {
        let data = serde_json::to_string(&ev).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().data(data))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
