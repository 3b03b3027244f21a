//! # CMP Event Store
//!
//! Redis-backed retention for the SSE layer.
//!
//! Three key families live here:
//!
//! - `sse:events:{user_id}:{event_type}`: one capped stream per user and
//!   event type, enabling `Last-Event-ID` replay after reconnect
//! - `sse:connection:{id}` / `sse:user:{user_id}:connections`: snapshots of
//!   live connections so any process can enumerate a user's sessions
//! - `sse:subscriptions:{resource_type}:{credential_id}:{region}`: sets of
//!   connection ids used to target delivery by filter
//!
//! The store is strictly optional: when Redis is missing the multiplexer
//! runs live-only, replay returns empty, and mirroring is skipped. Nothing
//! here is allowed to stall live delivery; callers invoke writes from
//! fire-and-forget tasks.

pub mod connections;
pub mod error;
pub mod store;

pub use connections::{ConnectionSnapshot, FilterSets};
pub use error::{EventStoreError, EventStoreResult};
pub use store::{EventHistoryRecord, EventStore, EventStoreConfig};
