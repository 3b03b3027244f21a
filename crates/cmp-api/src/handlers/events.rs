//! The SSE endpoint.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::auth::AuthUser;
use crate::errors::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct EventsQuery {
    /// Alternate channel for `Last-Event-ID`
    pub last_event_id: Option<String>,
}

/// `GET /events`: open an SSE stream.
///
/// Replays missed events when the client supplies `Last-Event-ID` (header
/// preferred, query fallback), then delivers live. The response is an
/// unbounded `text/event-stream`; frames are rendered by the multiplexer so
/// the non-standard `compressed:` line survives intact.
pub async fn events(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .or(query.last_event_id);

    info!(
        user_id = %user.user_id,
        workspace_id = ?user.workspace_id,
        resuming = last_event_id.is_some(),
        "SSE connection accepted"
    );

    let (connection, receiver) = state
        .multiplexer
        .register(user.user_id, user.workspace_id, last_event_id)
        .await;

    let stream =
        ReceiverStream::new(receiver).map(|frame| Ok::<Bytes, Infallible>(Bytes::from(frame)));

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "Cache-Control, Last-Event-ID",
        )
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(stream))
        .map_err(|e| {
            connection.cancel.cancel();
            ApiError::internal(format!("failed to build SSE response: {e}"))
        })?;

    Ok(response)
}
