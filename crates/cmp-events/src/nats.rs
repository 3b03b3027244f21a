//! NATS-backed event bus.
//!
//! Uses the core NATS client: plain subjects for fan-out subscriptions and
//! queue groups for load-balanced consumers. Durability is not provided
//! here; the outbox (upstream) and the Redis event history (downstream)
//! carry the at-least-once guarantee.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cmp_types::Event;
use dashmap::DashMap;
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::bus::{
    dispatch_with_retry, BusHealth, EventBus, EventHandler, QueueOptions, QueueStatsSnapshot,
    QueueSubscription, SUBJECT_PREFIX,
};
use crate::codec::FrameCodec;
use crate::error::EventBusError;

/// Connection settings for the NATS transport.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// Server URL, e.g. `nats://localhost:4222`
    pub url: String,
    /// Client name reported to the server
    pub client_name: String,
    /// Connect timeout
    pub connection_timeout: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            client_name: "cmp-event-bus".to_string(),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl NatsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Event bus over a core NATS connection.
pub struct NatsEventBus {
    client: async_nats::Client,
    codec: FrameCodec,
    queues: DashMap<(String, String), Arc<QueueSubscription>>,
    decode_failures: Arc<AtomicU64>,
}

impl NatsEventBus {
    /// Connect to the configured server.
    pub async fn connect(config: NatsConfig, codec: FrameCodec) -> Result<Self, EventBusError> {
        info!(url = %config.url, "connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .name(&config.client_name)
            .connection_timeout(config.connection_timeout)
            .retry_on_initial_connect()
            .connect(&config.url)
            .await
            .map_err(|e| EventBusError::Connect(e.to_string()))?;

        info!(url = %config.url, "connected to NATS");

        Ok(Self {
            client,
            codec,
            queues: DashMap::new(),
            decode_failures: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Messages dropped because their payload failed to decode.
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    fn decode_or_drop(
        codec: &FrameCodec,
        failures: &AtomicU64,
        subject: &str,
        payload: &[u8],
    ) -> Option<Event> {
        match codec.decode(payload) {
            Ok(event) => Some(event),
            Err(e) => {
                failures.fetch_add(1, Ordering::Relaxed);
                error!(subject, error = %e, "dropping undecodable message");
                None
            }
        }
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish(&self, event: &Event) -> Result<(), EventBusError> {
        let subject = format!("{SUBJECT_PREFIX}{}", event.event_type);
        let payload = self.codec.encode(event)?;

        debug!(subject = %subject, bytes = payload.len(), "publishing event");

        self.client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| EventBusError::Publish {
                subject,
                message: e.to_string(),
            })
    }

    async fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), EventBusError> {
        let subject = format!("{SUBJECT_PREFIX}{event_type}");
        let mut subscriber =
            self.client
                .subscribe(subject.clone())
                .await
                .map_err(|e| EventBusError::Subscribe {
                    subject: subject.clone(),
                    message: e.to_string(),
                })?;

        let codec = self.codec.clone();
        let failures = self.decode_failures.clone();

        tokio::spawn(async move {
            debug!(subject = %subject, "subscription started");
            while let Some(message) = subscriber.next().await {
                let Some(event) =
                    Self::decode_or_drop(&codec, &failures, &subject, &message.payload)
                else {
                    continue;
                };
                if let Err(e) = handler.handle(&event).await {
                    warn!(subject = %subject, error = %e, "subscriber handler failed");
                }
            }
            debug!(subject = %subject, "subscription closed");
        });

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

        let full_subject = format!("{SUBJECT_PREFIX}{subject}");
        let mut subscriber = self
            .client
            .queue_subscribe(full_subject.clone(), queue_name.to_string())
            .await
            .map_err(|e| EventBusError::Subscribe {
                subject: full_subject.clone(),
                message: e.to_string(),
            })?;

        let subscription = Arc::new(QueueSubscription::new(options));
        self.queues.insert(key, subscription.clone());

        let codec = self.codec.clone();
        let failures = self.decode_failures.clone();
        let cancel = subscription.cancel.clone();
        let queue = queue_name.to_string();

        tokio::spawn(async move {
            info!(subject = %full_subject, queue = %queue, "queue subscription started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = subscriber.next() => {
                        let Some(message) = message else { break };
                        let Some(event) = Self::decode_or_drop(
                            &codec,
                            &failures,
                            &full_subject,
                            &message.payload,
                        ) else {
                            continue;
                        };

                        let permit = match subscription.semaphore.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        };
                        let handler = handler.clone();
                        let counters = subscription.counters.clone();
                        let options = subscription.options.clone();
                        let subject = full_subject.clone();
                        tokio::spawn(async move {
                            dispatch_with_retry(
                                &subject,
                                handler.as_ref(),
                                &event,
                                &counters,
                                &options,
                            )
                            .await;
                            drop(permit);
                        });
                    }
                }
            }
            if let Err(e) = subscriber.unsubscribe().await {
                debug!(subject = %full_subject, error = %e, "unsubscribe after close failed");
            }
            info!(subject = %full_subject, queue = %queue, "queue subscription stopped");
        });

        Ok(())
    }

    async fn unsubscribe(&self, subject: &str, queue_name: &str) -> Result<(), EventBusError> {
        let key = (subject.to_string(), queue_name.to_string());
        match self.queues.remove(&key) {
            Some((_, subscription)) => {
                subscription.cancel.cancel();
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
            connected: self.client.connection_state()
                == async_nats::connection::State::Connected,
            transport: "nats",
        }
    }

    fn queue_stats(&self) -> Vec<QueueStatsSnapshot> {
        self.queues
            .iter()
            .map(|entry| {
                let (subject, queue) = entry.key();
                entry.value().snapshot(subject, queue)
            })
            .collect()
    }
}
