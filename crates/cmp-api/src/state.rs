//! Shared application state.

use std::sync::Arc;

use cmp_events::EventBus;
use cmp_outbox::OutboxWorker;

use crate::config::AppConfig;
use crate::multiplexer::SseMultiplexer;

/// Handles shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub bus: Arc<dyn EventBus>,
    pub multiplexer: SseMultiplexer,
    /// Present only when an outbox database is configured
    pub outbox_worker: Option<Arc<OutboxWorker>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        bus: Arc<dyn EventBus>,
        multiplexer: SseMultiplexer,
        outbox_worker: Option<Arc<OutboxWorker>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            bus,
            multiplexer,
            outbox_worker,
        }
    }
}
