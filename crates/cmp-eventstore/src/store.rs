//! Per-user event history on Redis Streams.

use std::time::Duration;

use redis::aio::ConnectionManager;
use tracing::{debug, info};

use crate::error::EventStoreResult;

/// Retention knobs. Defaults encode the event plane's replay window: a
/// stream keeps at most ~1000 entries for at most one hour, whichever bound
/// is hit first.
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// Redis URL, e.g. `redis://localhost:6379`
    pub url: String,
    /// Approximate per-stream length cap
    pub stream_max_len: usize,
    /// Stream TTL, refreshed on every append
    pub stream_ttl: Duration,
    /// Connection snapshot TTL
    pub connection_ttl: Duration,
    /// Subscription tracking set TTL
    pub subscription_ttl: Duration,
    /// Maximum entries returned by a single replay read
    pub read_limit: usize,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            stream_max_len: 1000,
            stream_ttl: Duration::from_secs(3600),
            connection_ttl: Duration::from_secs(3600),
            subscription_ttl: Duration::from_secs(7200),
            read_limit: 1000,
        }
    }
}

impl EventStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// One retained event, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHistoryRecord {
    /// Stream-assigned id (`millis-seq`); what `Last-Event-ID` resumes from
    pub id: String,
    /// Application-side id recorded at append time
    pub event_id: String,
    /// JSON payload as delivered to the client
    pub data: String,
    /// Unix seconds at append time
    pub timestamp: i64,
}

/// Handle to the Redis-backed history and connection mirror.
#[derive(Clone)]
pub struct EventStore {
    manager: ConnectionManager,
    config: EventStoreConfig,
}

fn stream_key(user_id: &str, event_type: &str) -> String {
    format!("sse:events:{user_id}:{event_type}")
}

/// A usable `Last-Event-ID` is a native stream id: `millis` or `millis-seq`.
fn is_stream_id(id: &str) -> bool {
    let mut parts = id.splitn(2, '-');
    let millis_ok = parts
        .next()
        .is_some_and(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    let seq_ok = match parts.next() {
        Some(seq) => !seq.is_empty() && seq.bytes().all(|b| b.is_ascii_digit()),
        None => true,
    };
    millis_ok && seq_ok
}

impl EventStore {
    /// Connect to Redis. Failure here puts the multiplexer in live-only
    /// mode; the caller decides whether that is fatal.
    pub async fn connect(config: EventStoreConfig) -> EventStoreResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let manager = ConnectionManager::new(client).await?;
        info!(url = %config.url, "connected to event store");
        Ok(Self { manager, config })
    }

    pub fn config(&self) -> &EventStoreConfig {
        &self.config
    }

    pub(crate) fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Append an event to `sse:events:{user_id}:{event_type}`, trimming the
    /// stream approximately and refreshing its TTL. Returns the assigned
    /// stream id.
    pub async fn append(
        &self,
        user_id: &str,
        event_type: &str,
        event_id: &str,
        data: &str,
    ) -> EventStoreResult<String> {
        let key = stream_key(user_id, event_type);
        let mut conn = self.connection();

        let stream_id: String = redis::cmd("XADD")
            .arg(&key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.stream_max_len)
            .arg("*")
            .arg("event_id")
            .arg(event_id)
            .arg("data")
            .arg(data)
            .arg("timestamp")
            .arg(chrono::Utc::now().timestamp())
            .query_async(&mut conn)
            .await?;

        let _: () = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(self.config.stream_ttl.as_secs())
            .query_async(&mut conn)
            .await?;

        debug!(key = %key, stream_id = %stream_id, "event appended to history");
        Ok(stream_id)
    }

    /// Read entries strictly after `last_event_id`. An absent or malformed
    /// id reads the retained window from its start.
    pub async fn read_after(
        &self,
        user_id: &str,
        event_type: &str,
        last_event_id: Option<&str>,
        max: usize,
    ) -> EventStoreResult<Vec<EventHistoryRecord>> {
        let key = stream_key(user_id, event_type);
        self.read_stream_after(&key, last_event_id, max).await
    }

    /// Union of every `sse:events:{user_id}:*` stream after the given id,
    /// tagged with the event type each stream retains. Order holds within
    /// each stream but not across streams; clients deduplicate by event id.
    pub async fn read_all_after(
        &self,
        user_id: &str,
        last_event_id: Option<&str>,
    ) -> EventStoreResult<Vec<(String, EventHistoryRecord)>> {
        let mut keys = self.scan_user_streams(user_id).await?;
        keys.sort();

        let prefix = format!("sse:events:{user_id}:");
        let mut records = Vec::new();
        for key in keys {
            let event_type = key.strip_prefix(&prefix).unwrap_or(&key).to_string();
            let chunk = self
                .read_stream_after(&key, last_event_id, self.config.read_limit)
                .await?;
            records.extend(chunk.into_iter().map(|r| (event_type.clone(), r)));
        }
        Ok(records)
    }

    async fn read_stream_after(
        &self,
        key: &str,
        last_event_id: Option<&str>,
        max: usize,
    ) -> EventStoreResult<Vec<EventHistoryRecord>> {
        let start = match last_event_id {
            Some(id) if is_stream_id(id) => format!("({id}"),
            _ => "-".to_string(),
        };

        let mut conn = self.connection();
        let entries: Vec<(String, Vec<(String, String)>)> = redis::cmd("XRANGE")
            .arg(key)
            .arg(&start)
            .arg("+")
            .arg("COUNT")
            .arg(max)
            .query_async(&mut conn)
            .await?;

        Ok(entries
            .into_iter()
            .map(|(id, fields)| {
                let mut record = EventHistoryRecord {
                    id,
                    event_id: String::new(),
                    data: String::new(),
                    timestamp: 0,
                };
                for (field, value) in fields {
                    match field.as_str() {
                        "event_id" => record.event_id = value,
                        "data" => record.data = value,
                        "timestamp" => record.timestamp = value.parse().unwrap_or(0),
                        _ => {}
                    }
                }
                record
            })
            .collect())
    }

    async fn scan_user_streams(&self, user_id: &str) -> EventStoreResult<Vec<String>> {
        let pattern = format!("sse:events:{user_id}:*");
        let mut conn = self.connection();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, chunk): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(chunk);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }
}
