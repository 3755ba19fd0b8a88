//! HTTP routes for threads, runs and their event streams.

use super::sse::build_sse_response;
use crate::AppState;
use crate::agent::{HistoryQuery, StateSnapshot};
use crate::domain::events::{EventRecord, event_seq};
use crate::domain::runs::{DisconnectPolicy, Run, RunStatus};
use crate::domain::threads::{Thread, ThreadFilter};
use crate::error::{ApiError, ApiResult};
use crate::runs::manager::{RunCreate, StopAction, ThreadCreate, ThreadPage, ThreadUpdate};
use crate::security::claims::UserContext;
use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chat/new", post(create_thread))
        .route("/chat/search", post(search_threads))
        .route("/chat/{thread_id}", axum::routing::patch(update_thread))
        .route("/chat/{thread_id}/history", post(thread_history))
        .route("/chat/{thread_id}/runs", post(create_run).get(list_runs))
        .route("/chat/{thread_id}/runs/{run_id}", get(get_run).patch(update_run_status))
        .route("/chat/{thread_id}/runs/{run_id}/events", get(run_events))
        .route("/chat/{thread_id}/runs/{run_id}/cancel", post(cancel_run))
        .route("/threads/{thread_id}", delete(delete_thread))
        .route("/threads/{thread_id}/runs/stream", post(create_and_stream))
        .route("/threads/{thread_id}/runs/{run_id}/stream", get(join_stream))
}

// =============================================================================
// Query / body DTOs
// =============================================================================

#[derive(Debug, Deserialize)]
struct StreamQuery {
    after: Option<u64>,
    #[serde(default)]
    on_disconnect: DisconnectPolicy,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    after: u64,
    #[serde(default = "default_events_limit")]
    limit: usize,
}

fn default_events_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
struct CancelQuery {
    #[serde(default)]
    wait: u8,
    #[serde(default)]
    action: StopAction,
}

#[derive(Debug, Deserialize)]
struct RunStatusUpdate {
    status: RunStatus,
}

// =============================================================================
// Threads
// =============================================================================

async fn create_thread(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Json(request): Json<ThreadCreate>,
) -> ApiResult<Json<Thread>> {
    let thread = state.run_manager.create_thread(&user.user_id, request).await?;
    Ok(Json(thread))
}

async fn search_threads(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Json(filter): Json<ThreadFilter>,
) -> ApiResult<Json<ThreadPage>> {
    let page = state.run_manager.search_threads(&user.user_id, filter).await?;
    Ok(Json(page))
}

async fn update_thread(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Path(thread_id): Path<String>,
    Json(request): Json<ThreadUpdate>,
) -> ApiResult<Json<Thread>> {
    let thread = state
        .run_manager
        .update_thread(&user.user_id, &thread_id, request)
        .await?;
    Ok(Json(thread))
}

async fn delete_thread(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Path(thread_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.run_manager.delete_thread(&user.user_id, &thread_id).await?;
    Ok(Json(json!({ "status": "deleted" })))
}

async fn thread_history(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Path(thread_id): Path<String>,
    Json(query): Json<HistoryQuery>,
) -> ApiResult<Json<Vec<StateSnapshot>>> {
    let history = state
        .run_manager
        .thread_history(&user.user_id, &thread_id, query)
        .await?;
    Ok(Json(history))
}

// =============================================================================
// Runs
// =============================================================================

async fn create_run(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Path(thread_id): Path<String>,
    Json(request): Json<RunCreate>,
) -> ApiResult<Json<Run>> {
    let run = state
        .run_manager
        .create_run(&user.user_id, &thread_id, request)
        .await?;
    Ok(Json(run))
}

async fn create_and_stream(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Path(thread_id): Path<String>,
    Json(request): Json<RunCreate>,
) -> ApiResult<Response> {
    let (run, stream) = state
        .run_manager
        .create_and_stream(&user.user_id, &thread_id, request)
        .await?;

    let mut response = build_sse_response(stream, state.config.streaming.keep_alive());
    let base = format!("/threads/{}/runs/{}", run.thread_id, run.run_id);
    let headers = response.headers_mut();
    if let Ok(location) = HeaderValue::from_str(&format!("{base}/stream")) {
        headers.insert(header::LOCATION, location);
    }
    if let Ok(content_location) = HeaderValue::from_str(&base) {
        headers.insert(header::CONTENT_LOCATION, content_location);
    }
    Ok(response)
}

/// Resume offset from `Last-Event-ID`, falling back to the `after` parameter.
fn resume_offset(run_id: &str, headers: &HeaderMap, after: Option<u64>) -> u64 {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|id| event_seq(run_id, id))
        .or(after)
        .unwrap_or(0)
}

async fn join_stream(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Path((thread_id, run_id)): Path<(String, String)>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let after = resume_offset(&run_id, &headers, query.after);
    tracing::info!(run_id = %run_id, after, "client joined run stream");
    let stream = state
        .run_manager
        .join_stream(&user.user_id, &thread_id, &run_id, after, query.on_disconnect)
        .await?;
    Ok(build_sse_response(stream, state.config.streaming.keep_alive()))
}

async fn get_run(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Path((thread_id, run_id)): Path<(String, String)>,
) -> ApiResult<Json<Run>> {
    let run = state
        .run_manager
        .get_run(&user.user_id, &thread_id, &run_id)
        .await?;
    Ok(Json(run))
}

async fn list_runs(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Path(thread_id): Path<String>,
) -> ApiResult<Json<Vec<Run>>> {
    let runs = state.run_manager.list_runs(&user.user_id, &thread_id).await?;
    Ok(Json(runs))
}

async fn run_events(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Path((thread_id, run_id)): Path<(String, String)>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<EventRecord>>> {
    let events = state
        .run_manager
        .run_events(&user.user_id, &thread_id, &run_id, query.after, query.limit)
        .await?;
    Ok(Json(events))
}

async fn cancel_run(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Path((thread_id, run_id)): Path<(String, String)>,
    Query(query): Query<CancelQuery>,
) -> ApiResult<Json<Run>> {
    if query.wait > 1 {
        return Err(ApiError::Unprocessable("wait must be 0 or 1".to_string()));
    }
    let run = state
        .run_manager
        .stop_run(&user.user_id, &thread_id, &run_id, query.action, query.wait == 1)
        .await?;
    Ok(Json(run))
}

/// Cancel or interrupt by setting the status. Other statuses leave the run
/// as it is.
async fn update_run_status(
    State(state): State<AppState>,
    Extension(user): Extension<UserContext>,
    Path((thread_id, run_id)): Path<(String, String)>,
    Json(update): Json<RunStatusUpdate>,
) -> ApiResult<Json<Run>> {
    let manager = &state.run_manager;
    let action = match update.status {
        RunStatus::Cancelled => StopAction::Cancel,
        RunStatus::Interrupted => StopAction::Interrupt,
        _ => return Ok(Json(manager.get_run(&user.user_id, &thread_id, &run_id).await?)),
    };
    let run = manager
        .stop_run(&user.user_id, &thread_id, &run_id, action, false)
        .await?;
    Ok(Json(run))
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
