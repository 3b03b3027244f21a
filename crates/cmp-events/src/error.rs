//! Error types for the codec and bus layers.

use thiserror::Error;

/// Frame encode/decode failures.
///
/// Encoding failures are producer bugs and are surfaced synchronously;
/// decoding failures are logged by the bus and the offending message is
/// dropped.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to serialize event: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize event: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("{algorithm} compression failed: {source}")]
    Compress {
        algorithm: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{algorithm} decompression failed: {source}")]
    Decompress {
        algorithm: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown compression type: {0:?}")]
    UnknownCompression(String),
}

/// Bus operation failures.
#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("failed to connect to event bus: {0}")]
    Connect(String),

    #[error("failed to publish to {subject}: {message}")]
    Publish { subject: String, message: String },

    #[error("failed to subscribe to {subject}: {message}")]
    Subscribe { subject: String, message: String },

    #[error("no queue subscription registered for {subject} / {queue}")]
    UnknownSubscription { subject: String, queue: String },

    #[error("queue subscription already registered for {subject} / {queue}")]
    DuplicateSubscription { subject: String, queue: String },

    #[error(transparent)]
    Codec(#[from] CodecError),
}
