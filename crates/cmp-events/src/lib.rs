//! # CMP Events
//!
//! Event bus and frame codec for the CMP event plane.
//!
//! The bus delivers [`cmp_types::Event`]s named by dotted subjects under the
//! `cmp.events.` prefix. Two interchangeable implementations exist:
//!
//! - [`NatsEventBus`]: core NATS transport with queue groups for
//!   load-balanced consumers across processes
//! - [`LocalEventBus`]: in-process fan-out with the identical API, used by
//!   tests and single-process deployments
//!
//! Payloads cross the wire through [`FrameCodec`], which JSON-serializes the
//! envelope and transparently compresses large frames (gzip or framed
//! snappy). Decoding sniffs the compression from the frame's leading bytes,
//! so mixed fleets can change compression settings without coordination.

pub mod bus;
pub mod codec;
pub mod error;
pub mod local;
pub mod nats;

pub use bus::{
    handler_fn, BusHealth, EventBus, EventHandler, QueueOptions, QueueStatsSnapshot,
    SUBJECT_PREFIX,
};
pub use codec::{Compression, FrameCodec, SseFrameCodec};
pub use error::{CodecError, EventBusError};
pub use local::LocalEventBus;
pub use nats::{NatsConfig, NatsEventBus};

/// Full bus subject for an event type.
pub fn bus_subject(event_type: &str) -> String {
    format!("{SUBJECT_PREFIX}{event_type}")
}
