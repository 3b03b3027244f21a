//! Durable outbox row.

use chrono::{DateTime, Utc};
use cmp_types::{Event, EventData};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Publication state of an outbox row.
///
/// `Published` and `Failed` are terminal; a `Processing` row older than the
/// reclaim grace period is eligible for re-claim by any worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "outbox_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Published | OutboxStatus::Failed)
    }
}

/// An event pending publication, created inside the producer's transaction.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEvent {
    pub id: Uuid,

    /// Dotted subject produced by the canonical topic builders
    pub topic: String,

    /// Human-readable tag, usually the SSE label for the topic
    pub event_type: String,

    /// Opaque JSON payload
    pub data: Value,

    pub workspace_id: Option<Uuid>,

    pub status: OutboxStatus,

    pub retry_count: i32,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Create a pending row for a topic built by `cmp_types::topics`.
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        let topic = topic.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            event_type: cmp_types::topics::sse_event_label(&topic),
            topic,
            data,
            workspace_id: None,
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_workspace(mut self, workspace_id: Uuid) -> Self {
        self.workspace_id = Some(workspace_id);
        self
    }

    /// Build the on-wire envelope for this row. The event type is the topic
    /// itself; the bus subject and SSE label both derive from it.
    pub fn to_event(&self) -> Event {
        let data = match &self.data {
            Value::Object(map) => map.clone(),
            _ => EventData::new(),
        };
        let mut event = Event::new(self.topic.clone(), data);
        if let Some(workspace_id) = self.workspace_id {
            event = event.with_workspace(workspace_id.to_string());
        }
        event
    }
}
