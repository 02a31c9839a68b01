//! Bill and reminder issuance.

use chrono::{DateTime, Duration, Timelike, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::audit;
use crate::billing::cycles::CycleService;
use crate::billing::models::{Bill, BillType, BillingCycle};
use crate::config::BillingConfig;
use crate::error::{AppError, AppResult};
use crate::membership::models::Membership;
use crate::notifications::{NotificationDispatcher, NotificationEvent};

/// Due date for a bill issued at `now`: the configured number of days out,
/// at 23:59, with the seconds set to `reminder_count mod 60`. The seconds
/// encoding keeps due dates strictly increasing across reminders issued on
/// the same clock tick; it caps usable distinctness at 60 reminders per
/// cycle, which is a documented limitation.
pub fn due_date_for(now: DateTime<Utc>, bill_days_to_due: i64, reminder_count: i32) -> DateTime<Utc> {
    (now + Duration::days(bill_days_to_due))
        .with_hour(23)
        .and_then(|date| date.with_minute(59))
        .and_then(|date| date.with_second(reminder_count.rem_euclid(60) as u32))
        .and_then(|date| date.with_nanosecond(0))
        .expect("23:59 exists in every day")
}

#[derive(Clone)]
pub struct BillGenerator {
    pool: PgPool,
    config: BillingConfig,
    notifier: NotificationDispatcher,
}

impl BillGenerator {
    pub fn new(pool: PgPool, config: BillingConfig, notifier: NotificationDispatcher) -> Self {
        Self {
            pool,
            config,
            notifier,
        }
    }

    /// Creates a bill record inside the cycle. The partial unique index on
    /// `(billingcycle_id, reminder_count)` guards reminder levels against
    /// concurrent double-issuance; `None` means another issuer won the race.
    pub async fn issue(
        &self,
        cycle: &BillingCycle,
        reminder_count: i32,
        bill_type: BillType,
    ) -> AppResult<Option<Bill>> {
        let due_date = due_date_for(Utc::now(), self.config.bill_days_to_due, reminder_count);
        let row = sqlx::query(
            r#"
            INSERT INTO bills (id, billingcycle_id, reminder_count, due_date, bill_type)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (billingcycle_id, reminder_count) WHERE reminder_count > 0 DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(cycle.id)
        .bind(reminder_count)
        .bind(due_date)
        .bind(bill_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            tracing::debug!(
                cycle = %cycle.id,
                reminder_count,
                "reminder level already issued, skipping"
            );
            return Ok(None);
        };
        let bill = Bill::from_row(&row)?;
        tracing::info!(
            bill = %bill.id,
            cycle = %cycle.id,
            reminder_count,
            bill_type = %bill_type,
            "issued bill"
        );
        Ok(Some(bill))
    }

    /// Hands a freshly issued bill to the notification handlers. A zero-sum
    /// cycle (fee waived) is marked paid immediately and never produces a
    /// notice.
    pub async fn send(&self, bill: &Bill, cycle: &BillingCycle) -> AppResult<()> {
        if cycle.sum_cents > 0 {
            self.notifier
                .emit(&NotificationEvent::BillIssued {
                    bill: bill.clone(),
                    cycle: cycle.clone(),
                })
                .await?;
            audit::record(
                &self.pool,
                "system",
                "bill",
                &bill.id.to_string(),
                "bill sent",
            )
            .await?;
        } else {
            // Zero paid covers a zero sum; the flip goes through the same
            // locked, audited path as every other paid-status change.
            CycleService::new(self.pool.clone())
                .recompute_paid(cycle.id, "system")
                .await?;
            tracing::info!(
                cycle = %cycle.id,
                membership_id = cycle.membership_id,
                "bill not sent: membership fee is zero"
            );
        }
        Ok(())
    }

    /// Issues and sends the original bill for a cycle.
    pub async fn issue_and_send(
        &self,
        cycle: &BillingCycle,
        bill_type: BillType,
    ) -> AppResult<Bill> {
        let bill = self
            .issue(cycle, 0, bill_type)
            .await?
            .ok_or_else(|| AppError::Validation("original bill insert returned no row".into()))?;
        self.send(&bill, cycle).await?;
        Ok(bill)
    }

    /// Starts the next yearly cycle where the previous one ended and sends
    /// its first bill.
    pub async fn renew_cycle(&self, membership: &Membership) -> AppResult<(BillingCycle, Bill)> {
        let cycles = CycleService::new(self.pool.clone());
        let cycle = cycles.open_next_cycle(membership).await?;
        let bill = self.issue_and_send(&cycle, BillType::Email).await?;
        Ok((cycle, bill))
    }
}

/// Whether a bill carries a cancellation marker.
pub async fn is_bill_cancelled(pool: &PgPool, bill_id: Uuid) -> AppResult<bool> {
    let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cancelled_bills WHERE bill_id = $1")
        .bind(bill_id)
        .fetch_one(pool)
        .await?;
    Ok(exists > 0)
}

/// Cancels an original bill. Reminders can never be cancelled.
pub async fn cancel_bill(pool: &PgPool, bill: &Bill, actor: &str) -> AppResult<()> {
    if bill.is_reminder() {
        return Err(AppError::Validation("can not cancel reminder bills".into()));
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
    .execute(pool)
    .await?;
    audit::record(pool, actor, "bill", &bill.id.to_string(), "bill cancelled").await?;
    Ok(())
}
