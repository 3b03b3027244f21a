//! Router assembly.

use axum::http::header::{HeaderName, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers::{events, subscriptions, system};
use crate::state::AppState;

/// Build the service router with tracing and a CORS policy that lets
/// browsers send and read `Last-Event-ID`.
pub fn router(state: AppState) -> Router {
    let last_event_id = HeaderName::from_static("last-event-id");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE, CACHE_CONTROL, last_event_id.clone()])
        .expose_headers([last_event_id]);

    Router::new()
        .route("/events", get(events::events))
        .route("/events/stats", get(system::stats))
        .route("/subscribe", post(subscriptions::subscribe))
        .route("/unsubscribe", post(subscriptions::unsubscribe))
        .route("/connection", get(subscriptions::connection_info))
        .route("/healthz", get(system::healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
