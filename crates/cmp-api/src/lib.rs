//! # CMP API
//!
//! HTTP surface of the CMP event plane: the SSE multiplexer, its control
//! endpoints, and the wiring that connects the event bus, the outbox
//! worker, and the Redis event store into one process.

pub mod auth;
pub mod config;
pub mod errors;
pub mod frame;
pub mod handlers;
pub mod matching;
pub mod multiplexer;
pub mod registry;
pub mod routes;
pub mod state;

pub use config::AppConfig;
pub use errors::ApiError;
pub use state::AppState;
