//! In-process event bus.
//!
//! Mirrors the NATS bus API for tests and single-process deployments.
//! Fan-out happens on spawned tasks; plain-subscriber handler errors are
//! swallowed after logging, queue subscribers keep the full retry policy so
//! counters behave identically to the NATS transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cmp_types::{subject_matches, Event};
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::bus::{
    dispatch_with_retry, BusHealth, EventBus, EventHandler, QueueOptions, QueueStatsSnapshot,
    QueueSubscription, SUBJECT_PREFIX,
};
use crate::error::EventBusError;

struct PlainSubscription {
    pattern: String,
    handler: Arc<dyn EventHandler>,
}

struct LocalQueueSubscription {
    state: Arc<QueueSubscription>,
    handler: Arc<dyn EventHandler>,
}

/// In-memory bus with the same contract as [`crate::NatsEventBus`].
#[derive(Default)]
pub struct LocalEventBus {
    plain: RwLock<Vec<PlainSubscription>>,
    queues: DashMap<(String, String), Arc<LocalQueueSubscription>>,
    rr: AtomicUsize,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, event: &Event) -> Result<(), EventBusError> {
        let subject = format!("{SUBJECT_PREFIX}{}", event.event_type);

        let plain = self.plain.read().await;
        for sub in plain.iter() {
            if !subject_matches(&sub.pattern, &subject) {
                continue;
            }
            let handler = sub.handler.clone();
            let event = event.clone();
            let subject = subject.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle(&event).await {
                    warn!(subject = %subject, error = %e, "subscriber handler failed");
                }
            });
        }
        drop(plain);

        // One delivery per queue group. Grouping is by queue name so group
        // membership behaves like the NATS transport.
        let mut matched: Vec<(String, Arc<LocalQueueSubscription>)> = Vec::new();
        for entry in self.queues.iter() {
            let (pattern, queue) = entry.key();
            let full_pattern = format!("{SUBJECT_PREFIX}{pattern}");
            if subject_matches(&full_pattern, &subject) && !entry.value().state.cancel.is_cancelled()
            {
                matched.push((queue.clone(), entry.value().clone()));
            }
        }
        matched.sort_by(|a, b| a.0.cmp(&b.0));

        let mut index = 0;
        while index < matched.len() {
            let queue = matched[index].0.clone();
            let mut members = Vec::new();
            while index < matched.len() && matched[index].0 == queue {
                members.push(matched[index].1.clone());
                index += 1;
            }
            let pick = self.rr.fetch_add(1, Ordering::Relaxed) % members.len();
            let member = members[pick].clone();
            let event = event.clone();
            let subject = subject.clone();
            tokio::spawn(async move {
                let permit = match member.state.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                dispatch_with_retry(
                    &subject,
                    member.handler.as_ref(),
                    &event,
                    &member.state.counters,
                    &member.state.options,
                )
                .await;
                drop(permit);
            });
        }

        debug!(subject = %subject, "event published locally");
        Ok(())
    }

    async fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), EventBusError> {
        let pattern = format!("{SUBJECT_PREFIX}{event_type}");
        self.plain
            .write()
            .await
            .push(PlainSubscription { pattern, handler });
        Ok(())
    }

    async fn subscribe_queue(
        &self,
        subject: &str,
        queue_name: &str,
        handler: Arc<dyn EventHandler>,
        options: QueueOptions,
    ) -> Result<(), EventBusError> {
        let key = (subject.to_string(), queue_name.to_string());
        if self.queues.contains_key(&key) {
            return Err(EventBusError::DuplicateSubscription {
                subject: subject.to_string(),
                queue: queue_name.to_string(),
            });
        }
        self.queues.insert(
            key,
            Arc::new(LocalQueueSubscription {
                state: Arc::new(QueueSubscription::new(options)),
                handler,
            }),
        );
        Ok(())
    }

    async fn unsubscribe(&self, subject: &str, queue_name: &str) -> Result<(), EventBusError> {
        let key = (subject.to_string(), queue_name.to_string());
        match self.queues.remove(&key) {
            Some((_, subscription)) => {
                subscription.state.cancel.cancel();
                Ok(())
            }
            None => Err(EventBusError::UnknownSubscription {
                subject: subject.to_string(),
                queue: queue_name.to_string(),
            }),
        }
    }

    fn health(&self) -> BusHealth {
        BusHealth {
            connected: true,
            transport: "local",
        }
    }

    fn queue_stats(&self) -> Vec<QueueStatsSnapshot> {
        self.queues
            .iter()
            .map(|entry| {
                let (subject, queue) = entry.key();
                entry.value().state.snapshot(subject, queue)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler_fn;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn test_event(event_type: &str) -> Event {
        Event::from_json(event_type, json!({"provider": "aws"}))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_plain_subscription_receives_matching_events() {
        let bus = LocalEventBus::new();
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = seen.clone();

        bus.subscribe(
            "system.notification",
            handler_fn(move |_| {
                let seen = seen_clone.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        bus.publish(&test_event("system.notification")).await.unwrap();
        bus.publish(&test_event("system.alert")).await.unwrap();
        settle().await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wildcard_subscription() {
        let bus = LocalEventBus::new();
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = seen.clone();

        bus.subscribe(
            ">",
            handler_fn(move |_| {
                let seen = seen_clone.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        bus.publish(&test_event("vm.aws.cred-1.created")).await.unwrap();
        bus.publish(&test_event("network.gcp.cred-2.europe-west1.vpcs.created"))
            .await
            .unwrap();
        settle().await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_errors_are_swallowed() {
        let bus = LocalEventBus::new();
        bus.subscribe("system.alert", handler_fn(|_| async { anyhow::bail!("boom") }))
            .await
            .unwrap();

        // Publish succeeds regardless of the failing handler.
        bus.publish(&test_event("system.alert")).await.unwrap();
        settle().await;
    }

    #[tokio::test]
    async fn test_queue_subscription_counts_and_retries() {
        let bus = LocalEventBus::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        bus.subscribe_queue(
            "vm.>",
            "workers",
            handler_fn(move |_| {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        anyhow::bail!("first attempt fails");
                    }
                    Ok(())
                }
            }),
            QueueOptions {
                concurrency: 2,
                max_retries: 3,
                retry_delay: Duration::from_millis(1),
            },
        )
        .await
        .unwrap();

        bus.publish(&test_event("vm.aws.cred-1.created")).await.unwrap();
        settle().await;

        let stats = bus.queue_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].processed, 1);
        assert_eq!(stats[0].failed, 0);
        assert_eq!(stats[0].active, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_duplicate_queue_subscription_rejected() {
        let bus = LocalEventBus::new();
        let handler = handler_fn(|_| async { Ok(()) });
        bus.subscribe_queue("vm.>", "workers", handler.clone(), QueueOptions::default())
            .await
            .unwrap();
        let err = bus
            .subscribe_queue("vm.>", "workers", handler, QueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::DuplicateSubscription { .. }));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = LocalEventBus::new();
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = seen.clone();

        bus.subscribe_queue(
            "system.*",
            "workers",
            handler_fn(move |_| {
                let seen = seen_clone.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            QueueOptions::default(),
        )
        .await
        .unwrap();

        bus.unsubscribe("system.*", "workers").await.unwrap();
        bus.publish(&test_event("system.alert")).await.unwrap();
        settle().await;

        assert_eq!(seen.load(Ordering::SeqCst), 0);

        let err = bus.unsubscribe("system.*", "workers").await.unwrap_err();
        assert!(matches!(err, EventBusError::UnknownSubscription { .. }));
    }
}
