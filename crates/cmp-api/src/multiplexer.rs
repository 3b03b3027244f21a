//! SSE multiplexer: fan-out from the bus to live connections.
//!
//! The multiplexer subscribes to the full `cmp.events.>` subject space,
//! matches every delivered event against each live connection's
//! subscription state, writes frames to the matching clients, and persists
//! delivered events into the per-user history so reconnecting clients can
//! replay.
//!
//! The struct is cheap to clone; all state lives behind `Arc`s so spawned
//! tasks (delivery, heartbeat, cleanup) share one registry and one counter
//! set.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use cmp_events::{handler_fn, EventBus, EventBusError, SseFrameCodec};
use cmp_eventstore::EventStore;
use cmp_types::{topics, Event};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BatchConfig, SseConfig};
use crate::frame::SseFrame;
use crate::registry::{ConnectionRegistry, SendOutcome, SseConnection};

static LAST_EVENT_ID: AtomicI64 = AtomicI64::new(0);

/// Process-local monotonic event id for live deliveries. Nanosecond clock,
/// bumped past the previous id when the clock stalls or steps back.
fn next_event_id() -> i64 {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    loop {
        let last = LAST_EVENT_ID.load(Ordering::SeqCst);
        let next = now.max(last + 1);
        if LAST_EVENT_ID
            .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return next;
        }
    }
}

/// Counters exposed on the stats endpoint.
#[derive(Debug, Default)]
pub struct MultiplexerStats {
    pub connections_total: AtomicU64,
    pub events_delivered: AtomicU64,
    pub events_dropped: AtomicU64,
    pub events_replayed: AtomicU64,
    pub connections_closed: AtomicU64,
}

/// Serializable view of [`MultiplexerStats`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSnapshot {
    pub active_connections: usize,
    pub connections_total: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub events_replayed: u64,
    pub connections_closed: u64,
}

/// Fan-out engine owning the registry, the optional event store, and the
/// batching buffer.
#[derive(Clone)]
pub struct SseMultiplexer {
    registry: Arc<ConnectionRegistry>,
    store: Option<EventStore>,
    codec: SseFrameCodec,
    sse: SseConfig,
    batch: BatchConfig,
    stats: Arc<MultiplexerStats>,
    buffer: Arc<Mutex<Vec<Event>>>,
}

impl SseMultiplexer {
    pub fn new(
        store: Option<EventStore>,
        codec: SseFrameCodec,
        sse: SseConfig,
        batch: BatchConfig,
    ) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            store,
            codec,
            sse,
            batch,
            stats: Arc::new(MultiplexerStats::default()),
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn store(&self) -> Option<&EventStore> {
        self.store.as_ref()
    }

    pub async fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_connections: self.registry.len().await,
            connections_total: self.stats.connections_total.load(Ordering::Relaxed),
            events_delivered: self.stats.events_delivered.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            events_replayed: self.stats.events_replayed.load(Ordering::Relaxed),
            connections_closed: self.stats.connections_closed.load(Ordering::Relaxed),
        }
    }

    /// Subscribe to the full event space and start the periodic tasks.
    /// A failed bus registration is fatal to start-up.
    pub async fn start(
        &self,
        bus: Arc<dyn EventBus>,
        cancel: CancellationToken,
    ) -> Result<(), EventBusError> {
        let mux = self.clone();
        bus.subscribe(
            ">",
            handler_fn(move |event| {
                let mux = mux.clone();
                async move {
                    mux.enqueue(event).await;
                    Ok(())
                }
            }),
        )
        .await?;

        if self.batch.enabled {
            self.spawn_flush_ticker(cancel.clone());
        }
        self.spawn_cleanup_sweep(cancel);

        info!(batching = self.batch.enabled, "SSE multiplexer started");
        Ok(())
    }

    /// Buffer or immediately deliver one bus event.
    async fn enqueue(&self, event: Event) {
        if !self.batch.enabled {
            self.deliver(&event).await;
            return;
        }

        let flush: Option<Vec<Event>> = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(event);
            if buffer.len() >= self.batch.max_size {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };
        if let Some(events) = flush {
            self.deliver_batch(events).await;
        }
    }

    async fn flush_buffer(&self) {
        let events = std::mem::take(&mut *self.buffer.lock().await);
        if !events.is_empty() {
            self.deliver_batch(events).await;
        }
    }

    /// Matching and emission run per-event; order inside the batch holds.
    async fn deliver_batch(&self, events: Vec<Event>) {
        for event in events {
            self.deliver(&event).await;
        }
    }

    /// Fan one event out to every matching live connection and persist it
    /// for each reached user.
    async fn deliver(&self, event: &Event) {
        let label = topics::sse_event_label(&event.event_type);
        let json = Value::Object(event.data.clone()).to_string();
        let event_id = next_event_id().to_string();

        let frame = match SseFrame::event(&self.codec, &event_id, &label, &json) {
            Ok(frame) => frame,
            Err(e) => {
                error!(event_type = %event.event_type, error = %e, "failed to frame event");
                return;
            }
        };

        let mut reached_users: Vec<String> = Vec::new();
        for connection in self.registry.all().await {
            if connection.cancel.is_cancelled() {
                continue;
            }
            // User-scoped events stay with their user.
            if let Some(user_id) = &event.user_id {
                if user_id != &connection.user_id {
                    continue;
                }
            }

            let subscription = connection.subscription().await;
            if !crate::matching::event_matches(event, &label, &subscription) {
                continue;
            }

            match connection.send(&frame) {
                SendOutcome::Delivered => {
                    self.stats.events_delivered.fetch_add(1, Ordering::Relaxed);
                    if !reached_users.contains(&connection.user_id) {
                        reached_users.push(connection.user_id.clone());
                    }
                }
                SendOutcome::Dropped => {
                    self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(connection_id = %connection.id, event = %label, "frame dropped: channel full");
                }
                SendOutcome::Closed => {
                    debug!(connection_id = %connection.id, "send on closed connection");
                }
            }
        }

        // History writes never block delivery.
        if let Some(store) = &self.store {
            for user_id in reached_users {
                let store = store.clone();
                let label = label.clone();
                let event_id = event_id.clone();
                let json = json.clone();
                tokio::spawn(async move {
                    if let Err(e) = store.append(&user_id, &label, &event_id, &json).await {
                        debug!(user_id = %user_id, error = %e, "history append skipped");
                    }
                });
            }
        }
    }

    /// Accept a connection: register it, emit the retry directive and the
    /// `connected` event, then run replay/heartbeat in a service task. The
    /// returned receiver feeds the HTTP response body.
    pub async fn register(
        &self,
        user_id: String,
        workspace_id: Option<String>,
        last_event_id: Option<String>,
    ) -> (Arc<SseConnection>, mpsc::Receiver<String>) {
        let connection_id = format!("conn-{}", uuid::Uuid::new_v4());
        let (connection, receiver) = SseConnection::new(
            connection_id.clone(),
            user_id,
            workspace_id,
            self.sse.channel_capacity,
        );

        self.registry.insert(connection.clone()).await;
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);

        connection.send(&SseFrame::Retry {
            millis: self.sse.retry_ms,
        });

        let connected_payload = serde_json::json!({
            "connection_id": connection_id,
            "timestamp": Utc::now().timestamp(),
        })
        .to_string();
        match SseFrame::event(
            &self.codec,
            next_event_id().to_string(),
            "connected",
            &connected_payload,
        ) {
            Ok(frame) => {
                connection.send(&frame);
            }
            Err(e) => error!(error = %e, "failed to frame connected event"),
        }

        self.mirror(&connection);
        self.spawn_service_task(connection.clone(), last_event_id);

        (connection, receiver)
    }

    /// Replay, then heartbeats until cancellation; cleanup on exit.
    fn spawn_service_task(&self, connection: Arc<SseConnection>, last_event_id: Option<String>) {
        let mux = self.clone();
        tokio::spawn(async move {
            if let Some(last_id) = last_event_id {
                mux.replay(&connection, &last_id).await;
            }

            let mut ticker = tokio::time::interval(mux.sse.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so heartbeats start
            // one interval after connect.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = connection.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if connection.send(&SseFrame::Heartbeat) == SendOutcome::Closed {
                            break;
                        }
                        mux.mirror(&connection);
                    }
                }
            }

            mux.finalize(&connection).await;
        });
    }

    /// Drain history strictly after `last_event_id` into the connection,
    /// preserving per-stream order and the stored event ids.
    async fn replay(&self, connection: &Arc<SseConnection>, last_event_id: &str) {
        let Some(store) = &self.store else { return };

        let records = match store
            .read_all_after(&connection.user_id, Some(last_event_id))
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    connection_id = %connection.id,
                    error = %e,
                    "replay unavailable, continuing live-only"
                );
                return;
            }
        };

        let mut replayed = 0u64;
        for (event_type, record) in records {
            let frame = match SseFrame::event(&self.codec, &record.id, &event_type, &record.data) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(stream_id = %record.id, error = %e, "skipping unframeable record");
                    continue;
                }
            };
            match connection.send(&frame) {
                SendOutcome::Delivered => replayed += 1,
                SendOutcome::Dropped => {
                    self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                }
                SendOutcome::Closed => return,
            }
        }

        self.stats
            .events_replayed
            .fetch_add(replayed, Ordering::Relaxed);
        if replayed > 0 {
            info!(connection_id = %connection.id, replayed, "replayed missed events");
        }
    }

    /// Refresh the Redis mirror in the background.
    pub fn mirror(&self, connection: &Arc<SseConnection>) {
        let Some(store) = &self.store else { return };
        let store = store.clone();
        let connection = connection.clone();
        tokio::spawn(async move {
            let snapshot = connection.snapshot().await;
            if let Err(e) = store.save_connection(&snapshot).await {
                debug!(connection_id = %connection.id, error = %e, "mirror refresh skipped");
            }
        });
    }

    /// Remove a connection from the registry and the Redis mirror.
    pub async fn finalize(&self, connection: &Arc<SseConnection>) {
        connection.cancel.cancel();
        if self.registry.remove(&connection.id).await.is_some() {
            self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(store) = &self.store {
            let store = store.clone();
            let connection_id = connection.id.clone();
            let user_id = connection.user_id.clone();
            tokio::spawn(async move {
                if let Err(e) = store.delete_connection(&connection_id, &user_id).await {
                    debug!(connection_id = %connection_id, error = %e, "mirror delete skipped");
                }
            });
        }

        debug!(connection_id = %connection.id, "connection finalized");
    }

    fn spawn_flush_ticker(&self, cancel: CancellationToken) {
        let mux = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(mux.batch.flush_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => mux.flush_buffer().await,
                }
            }
            // Drain whatever the shutdown left behind.
            mux.flush_buffer().await;
        });
    }

    /// Close idle and cancelled connections on the cleanup cadence.
    fn spawn_cleanup_sweep(&self, cancel: CancellationToken) {
        let mux = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(mux.sse.cleanup_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let idle_limit = mux.sse.idle_timeout.as_secs() as i64;
                        for connection in mux.registry.all().await {
                            if connection.cancel.is_cancelled()
                                || connection.idle_secs() > idle_limit
                            {
                                debug!(
                                    connection_id = %connection.id,
                                    idle_secs = connection.idle_secs(),
                                    "sweeping connection"
                                );
                                mux.finalize(&connection).await;
                            }
                        }
                    }
                }
            }

            // Shutdown: close every connection and delete its mirror.
            for connection in mux.registry.all().await {
                mux.finalize(&connection).await;
            }
        });
    }
}
