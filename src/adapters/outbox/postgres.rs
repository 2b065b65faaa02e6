//! PostgreSQL implementation of OutboxStore.
//!
//! Persists outbox events to the `event_outbox` table (see migrations).
//! `create_in_tx` binds the event to the caller's transaction so the
//! business row and the intent-to-publish commit atomically.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::domain::foundation::{EventId, Timestamp};
use crate::ports::{OutboxError, OutboxEvent, OutboxStatus, OutboxStore};

/// PostgreSQL implementation of OutboxStore.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Creates a new PostgresOutboxStore over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const INSERT_SQL: &str = r#"
    INSERT INTO event_outbox (
        event_id, event_type, aggregate_id, aggregate_type,
        payload, status, retry_count, error_message, created_at
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
"#;

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn create(&self, event: &OutboxEvent) -> Result<(), OutboxError> {
        event.validate()?;
        bind_insert(event).execute(&self.pool).await?;
        Ok(())
    }

    async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> Result<(), OutboxError> {
        event.validate()?;
        bind_insert(event).execute(&mut **tx).await?;
        Ok(())
    }

    async fn get_pending(
        &self,
        limit: u32,
        max_retries: u32,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, event_type, aggregate_id, aggregate_type,
                   payload, status, retry_count, error_message,
                   created_at, published_at, deleted_at
            FROM event_outbox
            WHERE status = 'pending'
              AND retry_count < $1
              AND deleted_at IS NULL
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(max_retries as i32)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_event).collect()
    }

    async fn mark_published(&self, event_id: &EventId) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'published', published_at = now()
            WHERE event_id = $1 AND published_at IS NULL
            "#,
        )
        .bind(event_id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Already published (idempotent no-op) or genuinely missing.
            return self.require_exists(event_id).await;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: &EventId,
        error: &str,
        max_retries: u32,
    ) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE event_outbox
            SET retry_count = retry_count + 1,
                error_message = $2,
                status = CASE
                    WHEN retry_count + 1 >= $3 THEN 'failed'
                    ELSE 'pending'
                END
            WHERE event_id = $1 AND published_at IS NULL
            "#,
        )
        .bind(event_id.as_str())
        .bind(error)
        .bind(max_retries as i32)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self.require_exists(event_id).await;
        }
        Ok(())
    }

    async fn delete_published_before(&self, cutoff: Timestamp) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r#"
            DELETE FROM event_outbox
            WHERE status = 'published' AND published_at < $1
            "#,
        )
        .bind(cutoff.as_datetime())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

impl PostgresOutboxStore {
    async fn require_exists(&self, event_id: &EventId) -> Result<(), OutboxError> {
        let found: Option<(i64,)> = sqlx::query_as("SELECT id FROM event_outbox WHERE event_id = $1")
            .bind(event_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match found {
            Some(_) => Ok(()),
            None => Err(OutboxError::NotFound(event_id.clone())),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Helper functions
// ════════════════════════════════════════════════════════════════════════════

fn bind_insert(
    event: &OutboxEvent,
) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(INSERT_SQL)
        .bind(event.event_id.as_str())
        .bind(&event.event_type)
        .bind(&event.aggregate_id)
        .bind(&event.aggregate_type)
        .bind(&event.payload)
        .bind(status_to_str(event.status))
        .bind(event.retry_count as i32)
        .bind(event.error_message.as_deref())
        .bind(event.created_at.as_datetime())
}

fn status_to_str(status: OutboxStatus) -> &'static str {
    match status {
        OutboxStatus::Pending => "pending",
        OutboxStatus::Published => "published",
        OutboxStatus::Failed => "failed",
        OutboxStatus::DqPending => "dq_pending",
        OutboxStatus::DqPublished => "dq_published",
        OutboxStatus::DqFailed => "dq_failed",
    }
}

fn str_to_status(s: &str) -> Result<OutboxStatus, OutboxError> {
    match s {
        "pending" => Ok(OutboxStatus::Pending),
        "published" => Ok(OutboxStatus::Published),
        "failed" => Ok(OutboxStatus::Failed),
        "dq_pending" => Ok(OutboxStatus::DqPending),
        "dq_published" => Ok(OutboxStatus::DqPublished),
        "dq_failed" => Ok(OutboxStatus::DqFailed),
        _ => Err(OutboxError::Validation(format!("invalid status: {}", s))),
    }
}

fn row_to_event(row: sqlx::postgres::PgRow) -> Result<OutboxEvent, OutboxError> {
    let status_str: String = row.try_get("status")?;
    let retry_count: i32 = row.try_get("retry_count")?;
    let created_at: chrono::DateTime<chrono::Utc> = row.try_get("created_at")?;
    let published_at: Option<chrono::DateTime<chrono::Utc>> = row.try_get("published_at")?;
    let deleted_at: Option<chrono::DateTime<chrono::Utc>> = row.try_get("deleted_at")?;
    let event_id: String = row.try_get("event_id")?;

    Ok(OutboxEvent {
        id: row.try_get("id")?,
        event_id: EventId::from_string(event_id),
        event_type: row.try_get("event_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        payload: row.try_get("payload")?,
        status: str_to_status(&status_str)?,
        retry_count: retry_count as u32,
        error_message: row.try_get("error_message")?,
        created_at: Timestamp::from_datetime(created_at),
        published_at: published_at.map(Timestamp::from_datetime),
        deleted_at: deleted_at.map(Timestamp::from_datetime),
    })
}
