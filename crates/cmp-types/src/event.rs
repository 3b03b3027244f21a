//! Event envelope types shared by the bus, outbox, and SSE layers.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// String-keyed payload carried by every event.
pub type EventData = serde_json::Map<String, Value>;

/// The on-wire event envelope.
///
/// `event_type` is a dotted topic (for structured resource events) or a legacy
/// tag such as `system.notification`. It determines both the bus subject the
/// event is published on and the SSE `event:` label delivered downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Topic or legacy event tag
    #[serde(rename = "type")]
    pub event_type: String,

    /// Opaque string-keyed payload
    pub data: EventData,

    /// Unix seconds at creation time
    pub timestamp: i64,

    /// Workspace scope, when the originating resource has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,

    /// Target user, for user-scoped deliveries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Event {
    /// Create a new event stamped with the current time.
    pub fn new(event_type: impl Into<String>, data: EventData) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now().timestamp(),
            workspace_id: None,
            user_id: None,
        }
    }

    /// Build the payload map from a JSON object literal.
    ///
    /// Non-object values produce an empty payload; producers always send
    /// objects, so this keeps call sites terse.
    pub fn from_json(event_type: impl Into<String>, payload: Value) -> Self {
        let data = match payload {
            Value::Object(map) => map,
            _ => EventData::new(),
        };
        Self::new(event_type, data)
    }

    /// Attach a workspace scope.
    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    /// Attach a target user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Fetch a string field from the payload.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_creation() {
        let event = Event::from_json(
            "network.aws.cred-1.us-east-1.vpcs.created",
            json!({"provider": "aws", "vpc_id": "v1"}),
        );

        assert_eq!(event.event_type, "network.aws.cred-1.us-east-1.vpcs.created");
        assert_eq!(event.data_str("provider"), Some("aws"));
        assert!(event.workspace_id.is_none());
        assert!(event.timestamp > 0);
    }

    #[test]
    fn test_event_scoping() {
        let event = Event::new("workspace.ws-1.updated", EventData::new())
            .with_workspace("ws-1")
            .with_user("u1");

        assert_eq!(event.workspace_id.as_deref(), Some("ws-1"));
        assert_eq!(event.user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn test_serde_round_trip() {
        let event = Event::from_json("system.notification", json!({"message": "hi"}));
        let bytes = serde_json::to_vec(&event).unwrap();
        let decoded: Event = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(decoded, event);
    }

    #[test]
    fn test_optional_fields_omitted_on_wire() {
        let event = Event::new("system.alert", EventData::new());
        let json = serde_json::to_string(&event).unwrap();

        assert!(!json.contains("workspace_id"));
        assert!(!json.contains("user_id"));
        assert!(json.contains("\"type\":\"system.alert\""));
    }
}
