//! Outbox persistence.
//!
//! The repository trait exists so the worker can be exercised against an
//! in-memory double; production uses [`PgOutboxRepository`] over a
//! PostgreSQL pool.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{OutboxError, OutboxResult};
use crate::event::OutboxEvent;

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Insert a row inside the producer's transaction so the domain write
    /// and the event commit or roll back together.
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> OutboxResult<()>;

    /// Atomically claim up to `limit` pending rows, oldest first, marking
    /// them `processing`. A row is claimed by at most one worker.
    async fn claim_pending(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>>;

    /// Transition a claimed row to `published`.
    async fn mark_published(&self, id: Uuid) -> OutboxResult<()>;

    /// Return a claimed row to `pending` after a failed publish, recording
    /// the error and bumping the retry counter.
    async fn release_for_retry(&self, id: Uuid, error: &str) -> OutboxResult<()>;

    /// Transition a claimed row to terminal `failed`.
    async fn mark_failed(&self, id: Uuid, error: &str) -> OutboxResult<()>;

    /// Return `processing` rows older than the grace period to `pending`.
    /// Covers workers that crashed mid-claim.
    async fn reclaim_stale(&self, grace: std::time::Duration) -> OutboxResult<u64>;

    /// Delete terminal rows older than the retention horizon.
    async fn prune_terminal(&self, older_than: std::time::Duration) -> OutboxResult<u64>;

    /// Pending row count and the age in seconds of the oldest pending row.
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}

/// PostgreSQL-backed repository.
pub struct PgOutboxRepository {
    pool: PgPool,
}

impl PgOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn cutoff(age: std::time::Duration) -> DateTime<Utc> {
        Utc::now() - ChronoDuration::from_std(age).unwrap_or_else(|_| ChronoDuration::seconds(0))
    }
}

#[async_trait]
impl OutboxRepository for PgOutboxRepository {
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id, topic, event_type, data, workspace_id,
                status, retry_count, last_error, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.id)
        .bind(&event.topic)
        .bind(&event.event_type)
        .bind(&event.data)
        .bind(event.workspace_id)
        .bind(event.status)
        .bind(event.retry_count)
        .bind(&event.last_error)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(&mut **tx)
        .await?;

        debug!(event_id = %event.id, topic = %event.topic, "event inserted into outbox");
        Ok(())
    }

    async fn claim_pending(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>> {
        // Single compound statement: the inner SELECT locks the candidate
        // rows (skipping rows other workers hold) and the UPDATE flips them
        // to processing before anyone else can see them as pending.
        let rows = sqlx::query_as::<_, OutboxEvent>(
            r#"
            UPDATE outbox_events
            SET status = 'processing', updated_at = NOW()
            WHERE id IN (
                SELECT id FROM outbox_events
                WHERE status = 'pending'
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, topic, event_type, data, workspace_id,
                      status, retry_count, last_error, created_at, updated_at
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        debug!(count = rows.len(), "claimed pending outbox rows");
        Ok(rows)
    }

    async fn mark_published(&self, id: Uuid) -> OutboxResult<()> {
        let result = sqlx::query(
            "UPDATE outbox_events SET status = 'published', updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EventNotFound(id));
        }
        Ok(())
    }

    async fn release_for_retry(&self, id: Uuid, error: &str) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'pending',
                retry_count = retry_count + 1,
                last_error = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EventNotFound(id));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'failed',
                retry_count = retry_count + 1,
                last_error = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EventNotFound(id));
        }

        warn!(event_id = %id, error, "outbox event marked failed");
        Ok(())
    }

    async fn reclaim_stale(&self, grace: std::time::Duration) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'pending', updated_at = NOW()
            WHERE status = 'processing' AND updated_at < $1
            "#,
        )
        .bind(Self::cutoff(grace))
        .execute(&self.pool)
        .await?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            warn!(reclaimed, "reclaimed stale processing rows");
        }
        Ok(reclaimed)
    }

    async fn prune_terminal(&self, older_than: std::time::Duration) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_events
            WHERE status IN ('published', 'failed') AND updated_at < $1
            "#,
        )
        .bind(Self::cutoff(older_than))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let row: (i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*)::BIGINT,
                EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT
            FROM outbox_events
            WHERE status = 'pending'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok((row.0, row.1.unwrap_or(0)))
    }
}
