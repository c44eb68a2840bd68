//! Progress WebSocket.
//!
//! One socket per UI client per project. On connect the client receives
//! the current derived state once, then a delta every time the watcher
//! publishes one. The socket closes when the client disconnects or the
//! event channel lags beyond recovery.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use uuid::Uuid;

use cb_core::processes;
use cb_protocol::{ProgressEvent, ProgressSnapshot};

use crate::handlers::{loaded_handle, AppState, ProjectPathQuery};

/// `GET /ws/progress?path=...`: upgrade and stream progress deltas.
pub async fn progress_socket(
    State(state): State<AppState>,
    Query(query): Query<ProjectPathQuery>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| serve_socket(state, PathBuf::from(query.path), socket))
}

async fn serve_socket(state: AppState, root: PathBuf, socket: WebSocket) {
    let subscriber = Uuid::new_v4();
    let handle = match loaded_handle(&state, &root).await {
        Ok(handle) => handle,
        Err(e) => {
            debug!(%subscriber, "progress subscription rejected: {}", e.0);
            let _ = close_with_error(socket, &e.0.to_string()).await;
            return;
        }
    };
    handle.ensure_watching().await;
    let mut events = handle.subscribe();

    let (mut sink, mut stream) = socket.split();

    // Initial state so late subscribers do not wait for the next delta.
    if let Some(initial) = initial_snapshot(&handle, &root).await {
        if send_event(&mut sink, &ProgressEvent::Progress(initial))
            .await
            .is_err()
        {
            return;
        }
    }

    debug!(%subscriber, "progress subscriber attached to {}", root.display());
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%subscriber, "progress stream lagged, skipped {skipped} events");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // clients only listen
                Some(Err(_)) => break,
            },
        }
    }
    debug!(%subscriber, "progress subscriber detached");
}

async fn initial_snapshot(
    handle: &crate::registry::ProjectHandle,
    root: &std::path::Path,
) -> Option<ProgressSnapshot> {
    let project = handle.store.snapshot().await.ok()?;
    let rows = processes::read_processes(root).unwrap_or_default();
    let counters = processes::counters(&rows);
    Some(ProgressSnapshot {
        jobs: processes::derive_statuses(root, &project.selected_jobs, &rows),
        complete: ProgressSnapshot::compute_complete(&counters),
        counters,
    })
}

async fn send_event(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    event: &ProgressEvent,
) -> Result<(), axum::Error> {
    let body = serde_json::to_string(event).unwrap_or_default();
    sink.send(Message::Text(body.into())).await
}

async fn close_with_error(mut socket: WebSocket, message: &str) -> Result<(), axum::Error> {
    socket
        .send(Message::Text(
            serde_json::json!({"error": message}).to_string().into(),
        ))
        .await?;
    socket.close().await
}
