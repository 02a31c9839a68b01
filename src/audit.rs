//! Audit log.
//!
//! Every state transition, payment attach/detach and paid-status flip writes
//! one row with the acting user, the entity touched and a human-readable
//! change description.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgExecutor, PgPool};
use uuid::Uuid;

use crate::error::AppResult;

#[derive(Clone, Debug, FromRow, Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub actor: String,
    pub entity_kind: String,
    pub entity_id: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Writes one audit row. Takes any executor so callers can record inside the
/// transaction that performs the change.
pub async fn record<'e>(
    executor: impl PgExecutor<'e>,
    actor: &str,
    entity_kind: &str,
    entity_id: &str,
    message: &str,
) -> AppResult<AuditRecord> {
    let row = sqlx::query_as::<_, AuditRecord>(
        r#"
        INSERT INTO audit_log (id, actor, entity_kind, entity_id, message)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(actor)
    .bind(entity_kind)
    .bind(entity_id)
    .bind(message)
    .fetch_one(executor)
    .await?;
    Ok(row)
}

/// Change history of one entity, newest first.
pub async fn entity_history(
    pool: &PgPool,
    entity_kind: &str,
    entity_id: &str,
    limit: i64,
) -> AppResult<Vec<AuditRecord>> {
    let rows = sqlx::query_as::<_, AuditRecord>(
        r#"
        SELECT * FROM audit_log
        WHERE entity_kind = $1 AND entity_id = $2
        ORDER BY occurred_at DESC
        LIMIT $3
        "#,
    )
    .bind(entity_kind)
    .bind(entity_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
