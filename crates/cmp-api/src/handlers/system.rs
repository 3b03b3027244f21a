//! Health and stats surface.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /healthz`: liveness of the bus, the event store, and the registry.
/// Degraded dependencies are reported, not failed: the process keeps
/// serving live events without Redis.
pub async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let bus = state.bus.health();
    let store_available = state.multiplexer.store().is_some();
    let active_connections = state.multiplexer.registry().len().await;

    let healthy = bus.connected;
    Json(json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "bus": bus,
        "event_store": { "available": store_available },
        "active_connections": active_connections,
    }))
}

/// `GET /events/stats`: multiplexer, queue, and outbox counters.
pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    let multiplexer = state.multiplexer.stats().await;
    let queues = state.bus.queue_stats();
    let outbox = state.outbox_worker.as_ref().map(|w| w.stats());

    Json(json!({
        "multiplexer": multiplexer,
        "queue_subscriptions": queues,
        "outbox": outbox,
    }))
}
