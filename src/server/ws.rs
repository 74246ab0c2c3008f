//! Per-run WebSocket event stream.
//!
//! On attach the subscriber receives the run's full event log, then live
//! appends until the run terminates. For a run that already terminated it
//! receives the log plus a synthesized terminal event, then the socket is
//! closed. The snapshot and the registration are atomic in the manager, so
//! no event is duplicated or lost across the transition.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::debug;

use super::AppState;
use super::handlers::error_response;
use crate::events::ExecutionEvent;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub run_id: Option<String>,
}

/// `GET /api/v1/workflows/{id}/stream?run_id=…`
pub async fn stream_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // Parameters are validated before the upgrade so plain requests get a
    // proper status code instead of 426.
    let Some(run_id) = query.run_id else {
        return error_response(StatusCode::BAD_REQUEST, "run_id query parameter is required");
    };

    let Some(snapshot) = state.manager.get(&run_id) else {
        return error_response(StatusCode::NOT_FOUND, "execution not found");
    };
    if snapshot.workflow_id != id {
        return error_response(StatusCode::NOT_FOUND, "execution not found");
    }

    match ws {
        Ok(upgrade) => upgrade
            .on_upgrade(move |socket| stream_events(socket, state, run_id))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn stream_events(mut socket: WebSocket, state: AppState, run_id: String) {
    let Some(outcome) = state.manager.subscribe(&run_id) else {
        close(&mut socket, close_code::ERROR, "execution not found").await;
        return;
    };

    for event in &outcome.backlog {
        if send_event(&mut socket, event).await.is_err() {
            return;
        }
    }

    match outcome.live {
        None => {
            if let Some(terminal) = &outcome.terminal {
                if send_event(&mut socket, terminal).await.is_err() {
                    return;
                }
            }
        }
        Some(mut rx) => {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => {
                            if send_event(&mut socket, &event).await.is_err() {
                                return;
                            }
                        }
                        // Channel closed: the run reached a terminal phase.
                        None => break,
                    },
                    message = socket.recv() => match message {
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(run_id = %run_id, "stream client disconnected");
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            debug!(run_id = %run_id, error = %err, "stream socket error");
                            return;
                        }
                    },
                }
            }
        }
    }

    close(&mut socket, close_code::NORMAL, "execution finished").await;
}

async fn send_event(socket: &mut WebSocket, event: &ExecutionEvent) -> Result<(), ()> {
    let text = serde_json::to_string(event).map_err(|_| ())?;
    socket.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn close(socket: &mut WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
