// Durable event queue
//
// Inbound events live in the `events` table, keyed by
// (service, event_id, owner_id). Insert is idempotent against that key:
// a duplicate is swallowed and reported as success, which is what gives
// the engine its at-most-once promise per external event.

use relay_shared::{Event, NewEvent};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

const MAX_DISPATCH_RETRIES: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted(Uuid),
    Duplicate,
}

/// Insert an event, deduplicating on the unique key.
pub async fn enqueue(pool: &PgPool, event: &NewEvent) -> Result<EnqueueOutcome, sqlx::Error> {
    let id = Uuid::new_v4();
    let result = sqlx::query(
        r#"
        INSERT INTO events (id, owner_id, service, event_type, event_id, event_data)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (service, event_id, owner_id) DO NOTHING
        "#,
    )
    .bind(id)
    .bind(event.owner_id)
    .bind(&event.service)
    .bind(&event.event_type)
    .bind(&event.event_id)
    .bind(&event.event_data)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        debug!(
            service = %event.service,
            event_id = %event.event_id,
            "duplicate event swallowed"
        );
        Ok(EnqueueOutcome::Duplicate)
    } else {
        Ok(EnqueueOutcome::Inserted(id))
    }
}

/// Atomically claim up to `limit` unprocessed events, oldest first.
/// Claiming marks the row processed up front: dispatch is at-most-once, and
/// a failed dispatch is explicitly released for retry.
pub async fn claim_batch(pool: &PgPool, limit: i64) -> Result<Vec<Event>, sqlx::Error> {
    sqlx::query_as::<_, Event>(
        r#"
        UPDATE events
        SET processed = TRUE, processed_at = NOW()
        WHERE id IN (
            SELECT id FROM events
            WHERE NOT processed
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING *
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Put a claimed event back for another attempt. Returns false once the
/// retry budget is exhausted (the event stays processed).
pub async fn release_for_retry(pool: &PgPool, event_id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE events
        SET processed = FALSE, processed_at = NULL, retry_count = retry_count + 1
        WHERE id = $1 AND retry_count < $2
        "#,
    )
    .bind(event_id)
    .bind(MAX_DISPATCH_RETRIES)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}
