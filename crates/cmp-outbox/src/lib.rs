//! # CMP Outbox
//!
//! Transactional outbox for the CMP event plane.
//!
//! REST handlers insert an [`OutboxEvent`] in the same database transaction
//! that commits the domain change; the [`OutboxWorker`] later claims pending
//! rows and publishes them over the event bus. This converts a cross-system
//! write (database + bus) into one local transactional write plus
//! asynchronous publication with at-least-once delivery.
//!
//! A row is owned by at most one worker at a time: the claim is a single
//! `UPDATE ... FOR UPDATE SKIP LOCKED` statement, and rows stuck in
//! `processing` past a grace horizon are reclaimed on the worker's ticker.

pub mod error;
pub mod event;
pub mod repository;
pub mod worker;

pub use error::{OutboxError, OutboxResult};
pub use event::{OutboxEvent, OutboxStatus};
pub use repository::{OutboxRepository, PgOutboxRepository};
pub use worker::{OutboxWorker, OutboxWorkerConfig, WorkerStatsSnapshot};
