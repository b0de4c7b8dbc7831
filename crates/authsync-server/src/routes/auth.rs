//! Auth sync routes: the message endpoint, status, and the change stream.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use authsync_core::{AuthEvent, SyncMessage, SyncResponse};

use crate::state::AppState;

type SseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/message", post(message))
        .route("/auth/status", get(status))
        .route("/auth/events", get(events))
}

/// POST /api/auth/message: apply one sync message.
///
/// A body that does not parse as a message is declined with
/// `success: false` rather than an HTTP error, so senders do not retry it.
/// Browser requests from origins outside the allow-list are refused outright.
async fn message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<SyncResponse>) {
    if let Some(origin) = headers.get(header::ORIGIN) {
        let origin = origin.to_str().unwrap_or_default();
        if !state.allowed_origins.allows(origin) {
            warn!("Refusing sync message from origin {:?}", origin);
            return (
                StatusCode::FORBIDDEN,
                Json(SyncResponse::rejected("origin not allowed")),
            );
        }
    }

    let message: SyncMessage = match serde_json::from_value(body) {
        Ok(m) => m,
        Err(e) => {
            warn!("Declining malformed sync message: {}", e);
            return (
                StatusCode::OK,
                Json(SyncResponse::rejected(format!("malformed message: {}", e))),
            );
        }
    };
    (StatusCode::OK, Json(state.manager.handle(message).await))
}

/// GET /api/auth/status: canonical store snapshot, never the token.
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.manager.status() {
        Ok(status) => (StatusCode::OK, Json(serde_json::to_value(status).unwrap_or_default())),
        Err(e) => {
            warn!("Status read failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        }
    }
}

/// GET /api/auth/events: change notifications for listening surfaces.
///
/// Credentials are stripped; surfaces re-read the canonical store.
async fn events(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut rx = state.manager.subscribe();
    debug!("Surface subscribed to auth events");

    let stream: SseStream = Box::pin(async_stream::stream! {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Event stream lagged by {}", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let event = match event {
                AuthEvent::Changed { fingerprint, .. } => AuthEvent::Changed {
                    fingerprint,
                    credentials: None,
                },
                other => other,
            };
            match serde_json::to_string(&event) {
                Ok(data) => {
                    yield Ok::<_, Infallible>(Event::default().data(data));
                }
                Err(e) => warn!("Failed to encode auth event: {}", e),
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
