//! Billing cycle creation and paid-status bookkeeping.

use chrono::{DateTime, Datelike, Duration, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::audit;
use crate::billing::fees;
use crate::billing::models::BillingCycle;
use crate::error::AppResult;
use crate::membership::models::Membership;
use crate::reference;

/// End of a yearly cycle: start plus 365 days, plus one extra day when the
/// span crossed a leap day and the day-of-month would otherwise shift.
pub fn cycle_end(start: DateTime<Utc>) -> DateTime<Utc> {
    let mut end = start + Duration::days(365);
    if end.day() != start.day() {
        end += Duration::days(1);
    }
    end
}

#[derive(Clone)]
pub struct CycleService {
    pool: PgPool,
}

impl CycleService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a new cycle for a membership. The sum is fixed from the fee
    /// table as of `start` and the reference number is derived from the
    /// member id and the start year. Status checks are the caller's job;
    /// this only guarantees arithmetic and reference correctness.
    pub async fn open_cycle(
        &self,
        membership: &Membership,
        start: Option<DateTime<Utc>>,
    ) -> AppResult<BillingCycle> {
        let start = start.unwrap_or_else(Utc::now);
        let end = cycle_end(start);
        let fee = fees::lookup(&self.pool, membership.member_type, start).await?;
        let reference_number = reference::generate(membership.id, start.year());

        let cycle = sqlx::query_as::<_, BillingCycle>(
            r#"
            INSERT INTO billing_cycles (
                id, membership_id, start, "end", sum_cents, is_paid, reference_number
            ) VALUES ($1, $2, $3, $4, $5, false, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(membership.id)
        .bind(start)
        .bind(end)
        .bind(fee.amount_cents)
        .bind(&reference_number)
        .fetch_one(&self.pool)
        .await?;
        tracing::info!(
            membership_id = membership.id,
            cycle = %cycle.id,
            reference = %cycle.reference_number,
            sum_cents = cycle.sum_cents,
            "opened billing cycle"
        );
        Ok(cycle)
    }

    /// Opens the follow-up cycle starting where the latest cycle ends, or
    /// now for a membership with no billing history.
    pub async fn open_next_cycle(&self, membership: &Membership) -> AppResult<BillingCycle> {
        let start = self
            .latest_cycle(membership.id)
            .await?
            .map(|cycle| cycle.end);
        self.open_cycle(membership, start).await
    }

    pub async fn fetch_cycle(&self, cycle_id: Uuid) -> AppResult<Option<BillingCycle>> {
        let row = sqlx::query_as::<_, BillingCycle>("SELECT * FROM billing_cycles WHERE id = $1")
            .bind(cycle_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn latest_cycle(&self, membership_id: i32) -> AppResult<Option<BillingCycle>> {
        let row = sqlx::query_as::<_, BillingCycle>(
            r#"
            SELECT * FROM billing_cycles
            WHERE membership_id = $1
            ORDER BY start DESC
            LIMIT 1
            "#,
        )
        .bind(membership_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Sum of non-ignored payments attached to the cycle, zero if none.
    pub async fn amount_paid(&self, cycle_id: Uuid) -> AppResult<i64> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount_cents), 0)::BIGINT FROM payments
            WHERE billingcycle_id = $1 AND ignore = false
            "#,
        )
        .bind(cycle_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    /// Recomputes `is_paid` under a row lock. Idempotent; the only
    /// observable mutation is a paid/unpaid flip, which is logged and
    /// audited.
    pub async fn recompute_paid(&self, cycle_id: Uuid, actor: &str) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        let cycle = lock_cycle(&mut tx, cycle_id).await?;
        let is_paid = recompute_paid_locked(&mut tx, &cycle, actor).await?;
        tx.commit().await?;
        Ok(is_paid)
    }
}

/// Fetches a cycle row with `FOR UPDATE`, serializing attach/detach and
/// paid-status recomputation per cycle.
pub(crate) async fn lock_cycle(
    conn: &mut PgConnection,
    cycle_id: Uuid,
) -> AppResult<BillingCycle> {
    let row = sqlx::query_as::<_, BillingCycle>(
        "SELECT * FROM billing_cycles WHERE id = $1 FOR UPDATE",
    )
    .bind(cycle_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(crate::error::AppError::NotFound)?;
    Ok(row)
}

pub(crate) async fn amount_paid_locked(
    conn: &mut PgConnection,
    cycle_id: Uuid,
) -> AppResult<i64> {
    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(amount_cents), 0)::BIGINT FROM payments
        WHERE billingcycle_id = $1 AND ignore = false
        "#,
    )
    .bind(cycle_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(total)
}

/// The read-compare-write on `is_paid`, run against an already locked cycle
/// row inside the caller's transaction.
pub(crate) async fn recompute_paid_locked(
    conn: &mut PgConnection,
    cycle: &BillingCycle,
    actor: &str,
) -> AppResult<bool> {
    let total_paid = amount_paid_locked(conn, cycle.id).await?;
    let now_paid = total_paid >= cycle.sum_cents;
    if now_paid != cycle.is_paid {
        sqlx::query("UPDATE billing_cycles SET is_paid = $1 WHERE id = $2")
            .bind(now_paid)
            .bind(cycle.id)
            .execute(&mut *conn)
            .await?;
        let message = if now_paid {
            "marked as paid"
        } else {
            "marked as unpaid"
        };
        tracing::info!(
            cycle = %cycle.id,
            total_paid_cents = total_paid,
            sum_cents = cycle.sum_cents,
            "billing cycle {message}"
        );
        audit::record(
            &mut *conn,
            actor,
            "billing_cycle",
            &cycle.id.to_string(),
            message,
        )
        .await?;
    }
    Ok(now_paid)
}

/// Cancels the latest outstanding bill of the latest cycle when a member is
/// dissociated. Reminders are never cancelled; a paid or bill-less cycle is
/// left alone. Returns the cancelled bill id, if any.
pub(crate) async fn cancel_outstanding_bills(
    conn: &mut PgConnection,
    membership_id: i32,
    actor: &str,
) -> AppResult<Option<Uuid>> {
    let cycle = sqlx::query_as::<_, BillingCycle>(
        r#"
        SELECT * FROM billing_cycles
        WHERE membership_id = $1
        ORDER BY start DESC
        LIMIT 1
        "#,
    )
    .bind(membership_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(cycle) = cycle else {
        return Ok(None);
    };
    if cycle.is_paid {
        return Ok(None);
    }

    let bill = sqlx::query(
        r#"
        SELECT * FROM bills
        WHERE billingcycle_id = $1
        ORDER BY due_date ASC
        LIMIT 1
        "#,
    )
    .bind(cycle.id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(bill) = bill else {
        return Ok(None);
    };
    let bill = crate::billing::models::Bill::from_row(&bill)?;
    if bill.is_reminder() {
        return Ok(None);
    }

    sqlx::query(
        r#"
        INSERT INTO cancelled_bills (id, bill_id)
        VALUES ($1, $2)
        ON CONFLICT (bill_id) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(bill.id)
    .execute(&mut *conn)
    .await?;
    tracing::info!(
        membership_id,
        bill = %bill.id,
        cycle = %cycle.id,
        "cancelled outstanding bill"
    );
    audit::record(
        &mut *conn,
        actor,
        "bill",
        &bill.id.to_string(),
        "bill cancelled on dissociation",
    )
    .await?;
    Ok(Some(bill.id))
}
