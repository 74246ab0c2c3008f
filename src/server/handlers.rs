//! REST handlers.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use super::AppState;
use crate::engine::spawn_run;
use crate::validation::validate_inputs;

/// `GET /api/v1/workflows`
pub async fn list_workflows(State(state): State<AppState>) -> Json<Value> {
    let mut workflows = Map::new();
    for (id, workflow) in state.workflows.iter() {
        workflows.insert(
            id.clone(),
            json!({
                "version": workflow.version,
                "name": workflow.name(),
                "description": workflow.description(),
                "steps": workflow.steps.len(),
            }),
        );
    }
    Json(json!({ "workflows": workflows }))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

/// `POST /api/v1/workflows/{id}/execute`
///
/// Validates, claims a concurrency slot, spawns the run and returns
/// immediately; progress is observable via the stream and status endpoints.
pub async fn execute_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let Some(workflow) = state.workflows.get(&id).cloned() else {
        return error_response(StatusCode::NOT_FOUND, "workflow not found");
    };

    // Fast advisory rejection before any payload processing; the
    // authoritative capacity decision happens in start() below.
    if !state.manager.can_start() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "server at capacity");
    }

    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            debug!(workflow_id = %id, error = %rejection, "rejecting malformed execute body");
            return error_response(StatusCode::BAD_REQUEST, "invalid request body");
        }
    };

    let outcome = validate_inputs(&workflow.inputs, &request.inputs);
    if !outcome.valid {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Input validation failed",
                "details": outcome.errors,
            })),
        )
            .into_response();
    }

    let started = match state.manager.start(&id, outcome.processed) {
        Ok(started) => started,
        Err(err) => return error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string()),
    };

    let response = json!({
        "run_id": started.run_id,
        "workflow_id": started.workflow_id,
        "status": "running",
        "started_at": started.started_at,
    });
    spawn_run(
        state.manager.clone(),
        state.runner.clone(),
        workflow,
        started,
    );

    (StatusCode::OK, Json(response)).into_response()
}

/// `GET /api/v1/executions/{run_id}`
pub async fn get_execution(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Response {
    match state.manager.get(&run_id) {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "execution not found"),
    }
}

/// `GET /api/v1/health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "workflows_loaded": state.workflows.len(),
        "active_executions": state.manager.active_count(),
        "timestamp": Utc::now(),
    }))
}

/// `GET /api/v1/metrics`
pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode_text() {
        Ok(text) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

pub(super) fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
