//! Connection snapshot mirror and subscription tracking sets.

use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EventStoreResult;
use crate::store::EventStore;

/// The four orthogonal filter sets a connection can narrow delivery by.
/// Empty sets do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSets {
    #[serde(default)]
    pub providers: HashSet<String>,
    #[serde(default)]
    pub credential_ids: HashSet<String>,
    #[serde(default)]
    pub regions: HashSet<String>,
    #[serde(default)]
    pub resource_types: HashSet<String>,
}

impl FilterSets {
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
            && self.credential_ids.is_empty()
            && self.regions.is_empty()
            && self.resource_types.is_empty()
    }

    /// Union another set of filters into this one.
    pub fn merge(&mut self, other: FilterSets) {
        self.providers.extend(other.providers);
        self.credential_ids.extend(other.credential_ids);
        self.regions.extend(other.regions);
        self.resource_types.extend(other.resource_types);
    }
}

/// Redis-mirrored view of a live SSE connection. The writer handle and
/// cancel function stay process-local; everything else is shared so any
/// instance can enumerate a user's sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub connection_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub subscribed_event_types: HashSet<String>,
    #[serde(default)]
    pub subscribed_vm_ids: HashSet<String>,
    #[serde(default)]
    pub subscribed_provider_ids: HashSet<String>,
    #[serde(default)]
    pub filters: FilterSets,
    /// Unix seconds of the last successful write to this client
    pub last_seen: i64,
}

impl ConnectionSnapshot {
    pub fn new(connection_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            workspace_id: None,
            subscribed_event_types: HashSet::new(),
            subscribed_vm_ids: HashSet::new(),
            subscribed_provider_ids: HashSet::new(),
            filters: FilterSets::default(),
            last_seen: Utc::now().timestamp(),
        }
    }
}

fn connection_key(connection_id: &str) -> String {
    format!("sse:connection:{connection_id}")
}

fn user_connections_key(user_id: &str) -> String {
    format!("sse:user:{user_id}:connections")
}

fn subscription_key(resource_type: &str, credential_id: &str, region: &str) -> String {
    format!("sse:subscriptions:{resource_type}:{credential_id}:{region}")
}

impl EventStore {
    /// Upsert a connection snapshot and register it in the user's set.
    pub async fn save_connection(&self, snapshot: &ConnectionSnapshot) -> EventStoreResult<()> {
        let json = serde_json::to_string(snapshot)?;
        let ttl = self.config().connection_ttl.as_secs();
        let key = connection_key(&snapshot.connection_id);
        let set_key = user_connections_key(&snapshot.user_id);
        let mut conn = self.connection();

        let _: () = redis::pipe()
            .cmd("SET")
            .arg(&key)
            .arg(json)
            .arg("EX")
            .arg(ttl)
            .ignore()
            .cmd("SADD")
            .arg(&set_key)
            .arg(&snapshot.connection_id)
            .ignore()
            .cmd("EXPIRE")
            .arg(&set_key)
            .arg(ttl)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(connection_id = %snapshot.connection_id, "connection snapshot saved");
        Ok(())
    }

    /// Fetch a connection snapshot by id.
    pub async fn get_connection(
        &self,
        connection_id: &str,
    ) -> EventStoreResult<Option<ConnectionSnapshot>> {
        let mut conn = self.connection();
        let json: Option<String> = redis::cmd("GET")
            .arg(connection_key(connection_id))
            .query_async(&mut conn)
            .await?;

        Ok(json.and_then(|j| serde_json::from_str(&j).ok()))
    }

    /// Remove a connection snapshot and its membership in the user's set.
    pub async fn delete_connection(
        &self,
        connection_id: &str,
        user_id: &str,
    ) -> EventStoreResult<()> {
        let mut conn = self.connection();
        let _: () = redis::pipe()
            .cmd("DEL")
            .arg(connection_key(connection_id))
            .ignore()
            .cmd("SREM")
            .arg(user_connections_key(user_id))
            .arg(connection_id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(connection_id, "connection snapshot deleted");
        Ok(())
    }

    /// Connection ids currently registered for a user.
    pub async fn user_connections(&self, user_id: &str) -> EventStoreResult<Vec<String>> {
        let mut conn = self.connection();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(user_connections_key(user_id))
            .query_async(&mut conn)
            .await?;
        Ok(ids)
    }

    /// Record that a connection wants events for
    /// `(resource_type, credential_id, region)`.
    pub async fn track_subscription(
        &self,
        resource_type: &str,
        credential_id: &str,
        region: &str,
        connection_id: &str,
    ) -> EventStoreResult<()> {
        let key = subscription_key(resource_type, credential_id, region);
        let mut conn = self.connection();
        let _: () = redis::pipe()
            .cmd("SADD")
            .arg(&key)
            .arg(connection_id)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.config().subscription_ttl.as_secs())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Drop a connection from a tracking set.
    pub async fn untrack_subscription(
        &self,
        resource_type: &str,
        credential_id: &str,
        region: &str,
        connection_id: &str,
    ) -> EventStoreResult<()> {
        let mut conn = self.connection();
        let _: () = redis::cmd("SREM")
            .arg(subscription_key(resource_type, credential_id, region))
            .arg(connection_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Connection ids subscribed to `(resource_type, credential_id, region)`.
    pub async fn subscribed_connections(
        &self,
        resource_type: &str,
        credential_id: &str,
        region: &str,
    ) -> EventStoreResult<Vec<String>> {
        let mut conn = self.connection();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(subscription_key(resource_type, credential_id, region))
            .query_async(&mut conn)
            .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layouts() {
        assert_eq!(connection_key("c-1"), "sse:connection:c-1");
        assert_eq!(user_connections_key("u1"), "sse:user:u1:connections");
        assert_eq!(
            subscription_key("kubernetes", "cred-1", "us-east-1"),
            "sse:subscriptions:kubernetes:cred-1:us-east-1"
        );
    }

    #[test]
    fn test_filter_sets_merge() {
        let mut filters = FilterSets::default();
        assert!(filters.is_empty());

        filters.merge(FilterSets {
            providers: ["aws".to_string()].into(),
            ..Default::default()
        });
        filters.merge(FilterSets {
            providers: ["gcp".to_string()].into(),
            credential_ids: ["cred-1".to_string()].into(),
            ..Default::default()
        });

        assert!(!filters.is_empty());
        assert_eq!(filters.providers.len(), 2);
        assert!(filters.credential_ids.contains("cred-1"));
    }

    #[test]
    fn test_snapshot_serde_round_trip() {
        let mut snapshot = ConnectionSnapshot::new("c-1", "u1");
        snapshot.subscribed_event_types.insert("vm-created".to_string());
        snapshot.filters.regions.insert("us-east-1".to_string());

        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: ConnectionSnapshot = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.connection_id, "c-1");
        assert!(decoded.subscribed_event_types.contains("vm-created"));
        assert!(decoded.filters.regions.contains("us-east-1"));
        // workspace_id is omitted from the wire when unset
        assert!(!json.contains("workspace_id"));
    }
}
