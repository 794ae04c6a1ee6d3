// Automation record loading and selection
//
// The automation row is the single source of truth for runtime decisions.
// Rows with malformed JSON columns are skipped with a warning rather than
// failing a whole selection cycle.

use chrono::{DateTime, Utc};
use relay_shared::{Action, AutomationRecord, AutomationStatus, TriggerType};
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

type AutomationRow = (
    Uuid,                   // id
    Uuid,                   // owner_id
    String,                 // name
    String,                 // status
    bool,                   // active
    String,                 // trigger_type
    Value,                  // trigger_config
    Value,                  // actions
    Value,                  // variables
    Option<DateTime<Utc>>,  // next_poll_at
    Option<String>,         // last_poll_cursor
    Option<i32>,            // polling_interval_minutes
    DateTime<Utc>,          // created_at
    Option<DateTime<Utc>>,  // updated_at
);

const COLUMNS: &str = "id, owner_id, name, status, active, trigger_type, trigger_config, \
                       actions, variables, next_poll_at, last_poll_cursor, \
                       polling_interval_minutes, created_at, updated_at";

fn from_row(row: AutomationRow) -> Option<AutomationRecord> {
    let trigger_type = match TriggerType::parse(&row.5) {
        Some(t) => t,
        None => {
            warn!(automation_id = %row.0, trigger_type = %row.5, "unknown trigger type, skipping");
            return None;
        }
    };
    let actions: Vec<Action> = match serde_json::from_value(row.7) {
        Ok(a) => a,
        Err(e) => {
            warn!(automation_id = %row.0, "malformed actions column, skipping: {e}");
            return None;
        }
    };
    let status: AutomationStatus =
        serde_json::from_value(Value::String(row.3)).unwrap_or(AutomationStatus::Active);

    Some(AutomationRecord {
        id: row.0,
        owner_id: row.1,
        name: row.2,
        status,
        active: row.4,
        trigger_type,
        trigger_config: row.6,
        actions,
        variables: row.8,
        next_poll_at: row.9,
        last_poll_cursor: row.10,
        polling_interval_minutes: row.11,
        created_at: row.12,
        updated_at: row.13,
    })
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<AutomationRecord>, sqlx::Error> {
    let row = sqlx::query_as::<_, AutomationRow>(&format!(
        "SELECT {COLUMNS} FROM automations WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.and_then(from_row))
}

pub async fn get_owned(
    pool: &PgPool,
    id: Uuid,
    owner_id: Uuid,
) -> Result<Option<AutomationRecord>, sqlx::Error> {
    let row = sqlx::query_as::<_, AutomationRow>(&format!(
        "SELECT {COLUMNS} FROM automations WHERE id = $1 AND owner_id = $2"
    ))
    .bind(id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.and_then(from_row))
}

/// Active webhook automations for an owner whose configured service matches
/// (case-insensitively).
pub async fn webhook_automations(
    pool: &PgPool,
    owner_id: Uuid,
    service: &str,
) -> Result<Vec<AutomationRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, AutomationRow>(&format!(
        r#"
        SELECT {COLUMNS} FROM automations
        WHERE owner_id = $1
          AND active
          AND trigger_type = 'webhook'
          AND LOWER(trigger_config->>'service') = LOWER($2)
        ORDER BY created_at ASC
        "#
    ))
    .bind(owner_id)
    .bind(service)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().filter_map(from_row).collect())
}

/// Active polling automations for an owner and service, for dispatcher
/// fallback routing.
pub async fn polling_automations(
    pool: &PgPool,
    owner_id: Uuid,
    service: &str,
) -> Result<Vec<AutomationRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, AutomationRow>(&format!(
        r#"
        SELECT {COLUMNS} FROM automations
        WHERE owner_id = $1
          AND active
          AND trigger_type = 'polling'
          AND LOWER(trigger_config->>'service') = LOWER($2)
        ORDER BY created_at ASC
        "#
    ))
    .bind(owner_id)
    .bind(service)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().filter_map(from_row).collect())
}

/// Active polling automations that are due: `next_poll_at` unset or past.
pub async fn due_polls(
    pool: &PgPool,
    now: DateTime<Utc>,
) -> Result<Vec<AutomationRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, AutomationRow>(&format!(
        r#"
        SELECT {COLUMNS} FROM automations
        WHERE active
          AND trigger_type = 'polling'
          AND (next_poll_at IS NULL OR next_poll_at <= $1)
        ORDER BY next_poll_at ASC NULLS FIRST
        "#
    ))
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().filter_map(from_row).collect())
}

/// Active schedule automations in one cadence bucket. Legacy rows with the
/// pre-split "schedule" trigger type are included.
pub async fn schedule_bucket(
    pool: &PgPool,
    interval: &str,
) -> Result<Vec<AutomationRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, AutomationRow>(&format!(
        r#"
        SELECT {COLUMNS} FROM automations
        WHERE active
          AND trigger_type IN ('schedule_once', 'schedule_recurring', 'schedule')
          AND trigger_config->>'interval' = $1
        ORDER BY created_at ASC
        "#
    ))
    .bind(interval)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().filter_map(from_row).collect())
}

/// Advance a polling automation's cursor and next poll time.
pub async fn update_poll_state(
    pool: &PgPool,
    id: Uuid,
    cursor: Option<&str>,
    next_poll_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE automations
        SET last_poll_cursor = COALESCE($2, last_poll_cursor),
            next_poll_at = $3,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(cursor)
    .bind(next_poll_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// One-time schedules deactivate after a successful dispatch.
pub async fn deactivate(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE automations SET active = FALSE, updated_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Most recent scheduled execution for dueness checks. Manual runs do not
/// block scheduling, so only schedule-flavored trigger types count; the
/// legacy "schedule" label is included for old log rows.
pub async fn last_scheduled_execution(
    pool: &PgPool,
    automation_id: Uuid,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    sqlx::query_scalar::<_, DateTime<Utc>>(
        r#"
        SELECT started_at FROM execution_logs
        WHERE automation_id = $1
          AND trigger_type IN ('schedule', 'schedule_once', 'schedule_recurring')
        ORDER BY started_at DESC
        LIMIT 1
        "#,
    )
    .bind(automation_id)
    .fetch_optional(pool)
    .await
}
