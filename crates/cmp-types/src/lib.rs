//! # CMP Types
//!
//! Shared types for the CMP event plane. This crate provides the on-wire
//! event envelope, the dotted subject grammar, and the canonical topic
//! builders used by every producer in the control plane.
//!
//! ## Organization
//!
//! - `event`: the `Event` envelope delivered over the bus and to SSE clients
//! - `subject`: subject matching with `*` (single segment) and `>` (tail)
//! - `topics`: canonical topic builders and SSE event-type labels

pub mod event;
pub mod subject;
pub mod topics;

// Re-export commonly used types
pub use event::{Event, EventData};
pub use subject::subject_matches;
pub use topics::{
    Action, EventFamily, TopicError, SYSTEM_ALERT, SYSTEM_NOTIFICATION, TOPIC_PROVIDER_INSTANCE,
    TOPIC_PROVIDER_STATUS, TOPIC_VM_RESOURCE, TOPIC_VM_STATUS,
};
