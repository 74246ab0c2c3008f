//! HTTP/WS surface.
//!
//! REST endpoints under `/api/v1` plus a per-run WebSocket event stream.
//! Handlers never run a workflow synchronously: `execute` claims a slot,
//! spawns the run and returns immediately.

pub mod handlers;
pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::Request;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tracing::info;

use crate::config::ServerConfig;
use crate::engine::{ExecutionManager, WorkflowRunner};
use crate::error::LacquerError;
use crate::telemetry::Metrics;
use crate::types::workflow::Workflow;

/// Shared handles for every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub workflows: Arc<HashMap<String, Arc<Workflow>>>,
    pub manager: Arc<ExecutionManager>,
    pub runner: Arc<WorkflowRunner>,
    pub metrics: Arc<Metrics>,
    pub enable_metrics: bool,
}

/// Build the application router.
pub fn router(state: AppState, enable_cors: bool) -> Router {
    let mut api = Router::new()
        .route("/workflows", get(handlers::list_workflows))
        .route("/workflows/{id}/execute", post(handlers::execute_workflow))
        .route("/workflows/{id}/stream", get(ws::stream_workflow))
        .route("/executions/{run_id}", get(handlers::get_execution))
        .route("/health", get(handlers::health));

    // When metrics are disabled the route is absent, not a 404 handler.
    if state.enable_metrics {
        api = api.route("/metrics", get(handlers::metrics));
    }

    let mut app = Router::new().nest("/api/v1", api).with_state(state);
    if enable_cors {
        app = app.layer(middleware::from_fn(cors));
    }
    app
}

async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        apply_cors_headers(&mut response);
        return response;
    }
    let mut response = next.run(request).await;
    apply_cors_headers(&mut response);
    response
}

fn apply_cors_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET,POST,PUT,DELETE,OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type,Authorization"),
    );
}

/// Bind and serve until a shutdown signal arrives, then drain runs.
pub async fn serve(config: &ServerConfig, state: AppState) -> Result<(), LacquerError> {
    let app = router(state.clone(), config.enable_cors);
    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|err| LacquerError::Configuration(format!("binding {address}: {err}")))?;
    info!(address = %address, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| LacquerError::Io(err.to_string()))?;

    info!("shutdown signal received, draining executions");
    state
        .manager
        .shutdown(config.shutdown_timeout_duration())
        .await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
