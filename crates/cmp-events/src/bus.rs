//! Event bus contract shared by the NATS and local implementations.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cmp_types::Event;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::EventBusError;

/// Every bus subject is published under this prefix.
pub const SUBJECT_PREFIX: &str = "cmp.events.";

/// Handler invoked for each delivered event.
///
/// Queue subscriptions retry failed handlers in-process; plain subscriptions
/// are best-effort and only log the error.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Tuning knobs for a queue subscription.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Maximum handlers in flight for this subscription
    pub concurrency: usize,
    /// Retry attempts per message before it is dropped
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `retry_delay * n`
    pub retry_delay: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Live counters for one queue subscription.
#[derive(Debug, Default)]
pub struct QueueCounters {
    pub active: AtomicI64,
    pub processed: AtomicU64,
    pub failed: AtomicU64,
}

/// Point-in-time view of a queue subscription's counters.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct QueueStatsSnapshot {
    pub subject: String,
    pub queue: String,
    pub active: i64,
    pub processed: u64,
    pub failed: u64,
}

/// Bookkeeping held per registered queue subscription.
pub(crate) struct QueueSubscription {
    pub(crate) counters: Arc<QueueCounters>,
    pub(crate) semaphore: Arc<Semaphore>,
    pub(crate) cancel: CancellationToken,
    pub(crate) options: QueueOptions,
}

impl QueueSubscription {
    pub(crate) fn new(options: QueueOptions) -> Self {
        Self {
            counters: Arc::new(QueueCounters::default()),
            semaphore: Arc::new(Semaphore::new(options.concurrency.max(1))),
            cancel: CancellationToken::new(),
            options,
        }
    }

    pub(crate) fn snapshot(&self, subject: &str, queue: &str) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            subject: subject.to_string(),
            queue: queue.to_string(),
            active: self.counters.active.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

/// Connection liveness report.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BusHealth {
    pub connected: bool,
    pub transport: &'static str,
}

/// Publish/subscribe contract for the event plane.
///
/// Implementations deliver events named by dotted subjects under
/// [`SUBJECT_PREFIX`]; subscribe patterns may use `*` and `>` wildcards.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event on `cmp.events.{event.event_type}`. Fire-and-forget:
    /// delivery to any particular subscriber is not confirmed, but transport
    /// errors are surfaced so outbox producers can leave the row pending.
    async fn publish(&self, event: &Event) -> Result<(), EventBusError>;

    /// Register a best-effort, non-queued subscriber for one event type.
    async fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), EventBusError>;

    /// Register a queue-group subscriber. Within a `(subject, queue)` group,
    /// each message is delivered to at most one member across all processes.
    async fn subscribe_queue(
        &self,
        subject: &str,
        queue_name: &str,
        handler: Arc<dyn EventHandler>,
        options: QueueOptions,
    ) -> Result<(), EventBusError>;

    /// Cancel and remove a queue subscription.
    async fn unsubscribe(&self, subject: &str, queue_name: &str) -> Result<(), EventBusError>;

    /// Transport liveness.
    fn health(&self) -> BusHealth;

    /// Counters for every registered queue subscription.
    fn queue_stats(&self) -> Vec<QueueStatsSnapshot>;
}

/// Run a handler with the queue retry policy: linear backoff
/// `retry_delay * attempt`, up to `max_retries` attempts, then drop.
pub(crate) async fn dispatch_with_retry(
    subject: &str,
    handler: &dyn EventHandler,
    event: &Event,
    counters: &QueueCounters,
    options: &QueueOptions,
) {
    counters.active.fetch_add(1, Ordering::Relaxed);

    let mut attempt: u32 = 1;
    loop {
        match handler.handle(event).await {
            Ok(()) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
                debug!(subject, attempt, "queue handler processed event");
                break;
            }
            Err(e) if attempt >= options.max_retries.max(1) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    subject,
                    attempt,
                    error = %e,
                    "queue handler exhausted retries, dropping message"
                );
                break;
            }
            Err(e) => {
                warn!(
                    subject,
                    attempt,
                    error = %e,
                    "queue handler failed, retrying"
                );
                tokio::time::sleep(options.retry_delay * attempt).await;
                attempt += 1;
            }
        }
    }

    counters.active.fetch_sub(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_dispatch_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let handler = handler_fn(move |_event| {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("transient");
                }
                Ok(())
            }
        });

        let counters = QueueCounters::default();
        let options = QueueOptions {
            concurrency: 1,
            max_retries: 5,
            retry_delay: Duration::from_millis(1),
        };
        let event = Event::new("system.alert", cmp_types::event::EventData::new());

        dispatch_with_retry("s", handler.as_ref(), &event, &counters, &options).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(counters.processed.load(Ordering::Relaxed), 1);
        assert_eq!(counters.failed.load(Ordering::Relaxed), 0);
        assert_eq!(counters.active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_dispatch_exhausts_retries() {
        let handler = handler_fn(|_event| async { anyhow::bail!("permanent") });
        let counters = QueueCounters::default();
        let options = QueueOptions {
            concurrency: 1,
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
        };
        let event = Event::new("system.alert", cmp_types::event::EventData::new());

        dispatch_with_retry("s", handler.as_ref(), &event, &counters, &options).await;

        assert_eq!(counters.processed.load(Ordering::Relaxed), 0);
        assert_eq!(counters.failed.load(Ordering::Relaxed), 1);
    }
}
