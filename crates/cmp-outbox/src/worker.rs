//! Background publisher for outbox rows.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cmp_events::EventBus;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::OutboxResult;
use crate::repository::OutboxRepository;

/// Worker tuning. Defaults match the operational profile of the event plane:
/// small batches on a short poll so a committed row reaches the bus within
/// seconds.
#[derive(Debug, Clone)]
pub struct OutboxWorkerConfig {
    /// Rows claimed per poll
    pub batch_size: i64,
    /// Delay between polls
    pub poll_interval: Duration,
    /// Failed publishes before a row goes terminal
    pub max_retries: i32,
    /// Pause after a failed publish before the next row
    pub retry_delay: Duration,
    /// Age at which a `processing` row is considered abandoned
    pub reclaim_grace: Duration,
    /// Retention for terminal rows; `None` disables pruning
    pub prune_after: Option<Duration>,
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            reclaim_grace: Duration::from_secs(60),
            prune_after: None,
        }
    }
}

impl OutboxWorkerConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(Ok(size)) = std::env::var("OUTBOX_BATCH_SIZE").map(|v| v.parse()) {
            config.batch_size = size;
        }
        if let Ok(Ok(secs)) = std::env::var("OUTBOX_POLL_INTERVAL_SECS").map(|v| v.parse()) {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Ok(Ok(retries)) = std::env::var("OUTBOX_MAX_RETRIES").map(|v| v.parse()) {
            config.max_retries = retries;
        }
        if let Ok(Ok(ms)) = std::env::var("OUTBOX_RETRY_DELAY_MS").map(|v| v.parse()) {
            config.retry_delay = Duration::from_millis(ms);
        }
        if let Ok(Ok(secs)) = std::env::var("OUTBOX_RECLAIM_GRACE_SECS").map(|v| v.parse()) {
            config.reclaim_grace = Duration::from_secs(secs);
        }
        if let Ok(Ok(secs)) = std::env::var("OUTBOX_PRUNE_AFTER_SECS").map(|v| v.parse::<u64>()) {
            config.prune_after = Some(Duration::from_secs(secs));
        }

        config
    }
}

/// Counters exposed on the stats surface.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStatsSnapshot {
    pub published: u64,
    pub failed: u64,
    pub running: bool,
}

/// Polls the outbox and publishes claimed rows to the bus.
///
/// A single row failure never stops the worker; the row either returns to
/// `pending` for a later attempt or goes terminal `failed` once the retry
/// budget is spent.
pub struct OutboxWorker {
    repository: Arc<dyn OutboxRepository>,
    bus: Arc<dyn EventBus>,
    config: OutboxWorkerConfig,
    running: AtomicBool,
    published: AtomicU64,
    failed: AtomicU64,
}

impl OutboxWorker {
    pub fn new(
        repository: Arc<dyn OutboxRepository>,
        bus: Arc<dyn EventBus>,
        config: OutboxWorkerConfig,
    ) -> Self {
        Self {
            repository,
            bus,
            config,
            running: AtomicBool::new(false),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
        }
    }

    /// Run until the token is cancelled.
    pub async fn start(&self, cancel: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_retries = self.config.max_retries,
            "outbox worker starting"
        );
        self.running.store(true, Ordering::Relaxed);

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.repository.reclaim_stale(self.config.reclaim_grace).await {
                        error!(error = %e, "stale row reclaim failed");
                    }

                    match self.process_batch().await {
                        Ok(0) => debug!("no pending outbox rows"),
                        Ok(count) => info!(published = count, "published outbox batch"),
                        Err(e) => error!(error = %e, "outbox batch failed"),
                    }

                    if let Some(older_than) = self.config.prune_after {
                        match self.repository.prune_terminal(older_than).await {
                            Ok(0) => {}
                            Ok(pruned) => debug!(pruned, "pruned terminal outbox rows"),
                            Err(e) => error!(error = %e, "outbox prune failed"),
                        }
                    }
                }
            }
        }

        self.running.store(false, Ordering::Relaxed);
        info!("outbox worker stopped");
    }

    /// Claim one batch and publish each row. Returns the publish count.
    pub async fn process_batch(&self) -> OutboxResult<u64> {
        let rows = self.repository.claim_pending(self.config.batch_size).await?;
        let mut published_count = 0;

        for row in rows {
            let event = row.to_event();

            match self.bus.publish(&event).await {
                Ok(()) => {
                    if let Err(e) = self.repository.mark_published(row.id).await {
                        // The event reached the bus; losing the status update
                        // means a duplicate publish on the next claim, which
                        // consumers tolerate (at-least-once).
                        error!(event_id = %row.id, error = %e, "failed to mark row published");
                    } else {
                        published_count += 1;
                        self.published.fetch_add(1, Ordering::Relaxed);
                        debug!(event_id = %row.id, topic = %row.topic, "outbox row published");
                    }
                }
                Err(e) => {
                    let attempts = row.retry_count + 1;
                    if attempts >= self.config.max_retries {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        error!(
                            event_id = %row.id,
                            topic = %row.topic,
                            retry_count = attempts,
                            error = %e,
                            "outbox row exhausted retries"
                        );
                        if let Err(mark_err) =
                            self.repository.mark_failed(row.id, &e.to_string()).await
                        {
                            error!(event_id = %row.id, error = %mark_err, "failed to mark row failed");
                        }
                    } else {
                        warn!(
                            event_id = %row.id,
                            topic = %row.topic,
                            retry_count = attempts,
                            error = %e,
                            "outbox publish failed, row returned to pending"
                        );
                        if let Err(mark_err) =
                            self.repository.release_for_retry(row.id, &e.to_string()).await
                        {
                            error!(event_id = %row.id, error = %mark_err, "failed to release row");
                        }
                    }

                    // Keep a failing bus from spinning the batch loop.
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }

        Ok(published_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{OutboxEvent, OutboxStatus};
    use crate::repository::OutboxRepository;
    use async_trait::async_trait;
    use chrono::Utc;
    use cmp_events::{
        handler_fn, BusHealth, EventBusError, LocalEventBus, QueueStatsSnapshot,
    };
    use cmp_types::Event;
    use parking_lot::Mutex;
    use serde_json::json;
    use sqlx::{Postgres, Transaction};
    use std::sync::atomic::AtomicU32;
    use uuid::Uuid;

    /// In-memory repository mirroring the Postgres state machine.
    #[derive(Default)]
    struct MemoryRepository {
        rows: Mutex<Vec<OutboxEvent>>,
    }

    impl MemoryRepository {
        fn push(&self, event: OutboxEvent) {
            self.rows.lock().push(event);
        }

        fn get(&self, id: Uuid) -> Option<OutboxEvent> {
            self.rows.lock().iter().find(|r| r.id == id).cloned()
        }
    }

    #[async_trait]
    impl OutboxRepository for MemoryRepository {
        async fn insert(
            &self,
            _tx: &mut Transaction<'_, Postgres>,
            _event: &OutboxEvent,
        ) -> OutboxResult<()> {
            unimplemented!("tests insert via push")
        }

        async fn claim_pending(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>> {
            let mut rows = self.rows.lock();
            let mut claimed = Vec::new();
            let mut indices: Vec<usize> = rows
                .iter()
                .enumerate()
                .filter(|(_, r)| r.status == OutboxStatus::Pending)
                .map(|(i, _)| i)
                .collect();
            indices.sort_by_key(|&i| rows[i].created_at);
            for i in indices.into_iter().take(limit as usize) {
                rows[i].status = OutboxStatus::Processing;
                rows[i].updated_at = Utc::now();
                claimed.push(rows[i].clone());
            }
            Ok(claimed)
        }

        async fn mark_published(&self, id: Uuid) -> OutboxResult<()> {
            let mut rows = self.rows.lock();
            let row = rows
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(crate::OutboxError::EventNotFound(id))?;
            row.status = OutboxStatus::Published;
            Ok(())
        }

        async fn release_for_retry(&self, id: Uuid, error: &str) -> OutboxResult<()> {
            let mut rows = self.rows.lock();
            let row = rows
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(crate::OutboxError::EventNotFound(id))?;
            row.status = OutboxStatus::Pending;
            row.retry_count += 1;
            row.last_error = Some(error.to_string());
            Ok(())
        }

        async fn mark_failed(&self, id: Uuid, error: &str) -> OutboxResult<()> {
            let mut rows = self.rows.lock();
            let row = rows
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(crate::OutboxError::EventNotFound(id))?;
            row.status = OutboxStatus::Failed;
            row.retry_count += 1;
            row.last_error = Some(error.to_string());
            Ok(())
        }

        async fn reclaim_stale(&self, _grace: Duration) -> OutboxResult<u64> {
            Ok(0)
        }

        async fn prune_terminal(&self, _older_than: Duration) -> OutboxResult<u64> {
            Ok(0)
        }

        async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
            let rows = self.rows.lock();
            let pending = rows
                .iter()
                .filter(|r| r.status == OutboxStatus::Pending)
                .count() as i64;
            Ok((pending, 0))
        }
    }

    /// Bus whose publish always fails, for exhaustion tests.
    struct RejectingBus;

    #[async_trait]
    impl EventBus for RejectingBus {
        async fn publish(&self, event: &Event) -> Result<(), EventBusError> {
            Err(EventBusError::Publish {
                subject: event.event_type.clone(),
                message: "bus offline".to_string(),
            })
        }

        async fn subscribe(
            &self,
            _event_type: &str,
            _handler: Arc<dyn cmp_events::EventHandler>,
        ) -> Result<(), EventBusError> {
            Ok(())
        }

        async fn subscribe_queue(
            &self,
            _subject: &str,
            _queue_name: &str,
            _handler: Arc<dyn cmp_events::EventHandler>,
            _options: cmp_events::QueueOptions,
        ) -> Result<(), EventBusError> {
            Ok(())
        }

        async fn unsubscribe(&self, _subject: &str, _queue: &str) -> Result<(), EventBusError> {
            Ok(())
        }

        fn health(&self) -> BusHealth {
            BusHealth {
                connected: false,
                transport: "rejecting",
            }
        }

        fn queue_stats(&self) -> Vec<QueueStatsSnapshot> {
            Vec::new()
        }
    }

    fn fast_config(max_retries: i32) -> OutboxWorkerConfig {
        OutboxWorkerConfig {
            batch_size: 10,
            poll_interval: Duration::from_millis(10),
            max_retries,
            retry_delay: Duration::from_millis(10),
            reclaim_grace: Duration::from_secs(60),
            prune_after: None,
        }
    }

    #[tokio::test]
    async fn test_happy_path_publishes_and_marks_row() {
        let repo = Arc::new(MemoryRepository::default());
        let bus = Arc::new(LocalEventBus::new());

        let delivered = Arc::new(AtomicU32::new(0));
        let delivered_clone = delivered.clone();
        bus.subscribe(
            "network.aws.cred-1.us-east-1.vpcs.created",
            handler_fn(move |event| {
                let delivered = delivered_clone.clone();
                async move {
                    assert_eq!(event.data_str("vpc_id"), Some("v1"));
                    delivered.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        let row = OutboxEvent::new(
            "network.aws.cred-1.us-east-1.vpcs.created",
            json!({"provider": "aws", "credential_id": "cred-1", "region": "us-east-1", "vpc_id": "v1"}),
        );
        let id = row.id;
        repo.push(row);

        let worker = OutboxWorker::new(repo.clone(), bus, fast_config(3));
        let published = worker.process_batch().await.unwrap();

        assert_eq!(published, 1);
        assert_eq!(repo.get(id).unwrap().status, OutboxStatus::Published);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(worker.stats().published, 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_goes_terminal() {
        let repo = Arc::new(MemoryRepository::default());
        let row = OutboxEvent::new("workspace.ws-1.updated", json!({}));
        let id = row.id;
        repo.push(row);

        let worker = OutboxWorker::new(repo.clone(), Arc::new(RejectingBus), fast_config(2));

        // First attempt: back to pending with retry_count 1.
        worker.process_batch().await.unwrap();
        let after_first = repo.get(id).unwrap();
        assert_eq!(after_first.status, OutboxStatus::Pending);
        assert_eq!(after_first.retry_count, 1);
        assert!(after_first.last_error.is_some());

        // Second attempt: retry budget spent, terminal failure.
        worker.process_batch().await.unwrap();
        let after_second = repo.get(id).unwrap();
        assert_eq!(after_second.status, OutboxStatus::Failed);
        assert_eq!(after_second.retry_count, 2);
        assert!(after_second.last_error.as_deref().unwrap().contains("bus offline"));

        // Terminal rows are never reclaimed by the batch loop.
        assert_eq!(worker.process_batch().await.unwrap(), 0);
        assert_eq!(repo.get(id).unwrap().retry_count, 2);
        assert_eq!(worker.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_single_row_failure_does_not_block_batch() {
        let repo = Arc::new(MemoryRepository::default());
        let bus = Arc::new(LocalEventBus::new());

        // Oldest row first; both publish fine on the local bus, the point is
        // that batch order follows created_at.
        let mut first = OutboxEvent::new("workspace.ws-1.created", json!({}));
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = OutboxEvent::new("workspace.ws-2.created", json!({}));
        let (first_id, second_id) = (first.id, second.id);
        repo.push(second);
        repo.push(first);

        let worker = OutboxWorker::new(repo.clone(), bus, fast_config(3));
        let published = worker.process_batch().await.unwrap();

        assert_eq!(published, 2);
        assert_eq!(repo.get(first_id).unwrap().status, OutboxStatus::Published);
        assert_eq!(repo.get(second_id).unwrap().status, OutboxStatus::Published);
    }

    #[tokio::test]
    async fn test_worker_loop_honors_cancellation() {
        let repo = Arc::new(MemoryRepository::default());
        let worker = Arc::new(OutboxWorker::new(
            repo,
            Arc::new(LocalEventBus::new()),
            fast_config(3),
        ));

        let cancel = CancellationToken::new();
        let handle = {
            let worker = worker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.start(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(worker.stats().running);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
        assert!(!worker.stats().running);
    }
}
