//! Fee table lookups.

use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use crate::billing::models::Fee;
use crate::error::{AppError, AppResult};
use crate::membership::models::MemberType;

/// Latest fee row for `member_type` with `effective_from <= as_of`. A
/// missing fee is fatal to cycle creation; there is no default fee and no
/// retry.
pub async fn lookup<'e>(
    executor: impl PgExecutor<'e>,
    member_type: MemberType,
    as_of: DateTime<Utc>,
) -> AppResult<Fee> {
    let row = sqlx::query(
        r#"
        SELECT * FROM fees
        WHERE member_type = $1 AND effective_from <= $2
        ORDER BY effective_from DESC
        LIMIT 1
        "#,
    )
    .bind(member_type.as_str())
    .bind(as_of)
    .fetch_optional(executor)
    .await?;
    match row {
        Some(row) => Fee::from_row(&row),
        None => Err(AppError::NoFeeDefined {
            member_type: member_type.to_string(),
            as_of: as_of.to_rfc3339(),
        }),
    }
}

/// Registers a new fee effective from `effective_from`. Fee rows are
/// immutable once created.
pub async fn insert_fee<'e>(
    executor: impl PgExecutor<'e>,
    member_type: MemberType,
    effective_from: DateTime<Utc>,
    amount_cents: i64,
    vat_percentage: i32,
) -> AppResult<Fee> {
    let row = sqlx::query(
        r#"
        INSERT INTO fees (member_type, effective_from, amount_cents, vat_percentage)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(member_type.as_str())
    .bind(effective_from)
    .bind(amount_cents)
    .bind(vat_percentage)
    .fetch_one(executor)
    .await?;
    Fee::from_row(&row)
}
