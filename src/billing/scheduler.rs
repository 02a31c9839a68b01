//! Reminder escalation scheduling.
//!
//! A read-mostly batch pass selects unpaid cycles eligible for the next
//! reminder level and issues them. Eligibility follows the billing rules:
//! reminders must be enabled, the membership must be approved, more than two
//! bills must already be out, and cycles with a Paper bill are never
//! auto-escalated.

use chrono::{Duration, Utc};
use sqlx::PgPool;
use tokio::time::{self, Duration as TokioDuration};
use tracing::warn;
use uuid::Uuid;

use crate::billing::bills::BillGenerator;
use crate::billing::cycles;
use crate::billing::models::{Bill, BillType, BillingCycle};
use crate::config::BillingConfig;
use crate::error::AppResult;
use crate::notifications::NotificationDispatcher;

#[derive(Clone)]
pub struct ReminderScheduler {
    pool: PgPool,
    config: BillingConfig,
    generator: BillGenerator,
}

impl ReminderScheduler {
    pub fn new(pool: PgPool, config: BillingConfig, notifier: NotificationDispatcher) -> Self {
        let generator = BillGenerator::new(pool.clone(), config.clone(), notifier);
        Self {
            pool,
            config,
            generator,
        }
    }

    /// Cycles eligible for reminder escalation. Scoped to one membership:
    /// all its unpaid cycles without a Paper bill. Unscoped: unpaid cycles
    /// of approved memberships with more than two bills already issued,
    /// again excluding any cycle that contains a Paper bill.
    pub async fn eligible_cycles(
        &self,
        membership_id: Option<i32>,
    ) -> AppResult<Vec<BillingCycle>> {
        if !self.config.enable_reminders {
            return Ok(Vec::new());
        }
        let rows = match membership_id {
            Some(membership_id) => {
                sqlx::query_as::<_, BillingCycle>(
                    r#"
                    SELECT c.* FROM billing_cycles c
                    WHERE c.membership_id = $1
                      AND c.is_paid = false
                      AND NOT EXISTS (
                          SELECT 1 FROM bills b
                          WHERE b.billingcycle_id = c.id AND b.bill_type = 'paper'
                      )
                    ORDER BY c.start
                    "#,
                )
                .bind(membership_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, BillingCycle>(
                    r#"
                    SELECT c.* FROM billing_cycles c
                    JOIN memberships m ON m.id = c.membership_id
                    WHERE c.is_paid = false
                      AND m.status = 'approved'
                      AND (SELECT COUNT(*) FROM bills b WHERE b.billingcycle_id = c.id) > 2
                      AND NOT EXISTS (
                          SELECT 1 FROM bills b
                          WHERE b.billingcycle_id = c.id AND b.bill_type = 'paper'
                      )
                    ORDER BY c.start
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    /// Issues the next reminder level for one cycle. Serialized per cycle:
    /// the cycle row is locked while the level is picked, and the
    /// `(billingcycle_id, reminder_count)` insert-once guard catches a
    /// concurrent scheduler pass that slipped past the lock. Returns `None`
    /// when the cycle was paid in the meantime or the level already exists.
    pub async fn issue_next_reminder(&self, cycle_id: Uuid) -> AppResult<Option<Bill>> {
        let next_level = {
            let mut tx = self.pool.begin().await?;
            let cycle = cycles::lock_cycle(&mut tx, cycle_id).await?;
            if cycle.is_paid {
                tx.commit().await?;
                return Ok(None);
            }
            let latest: i32 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(reminder_count), 0) FROM bills WHERE billingcycle_id = $1",
            )
            .bind(cycle_id)
            .fetch_one(&mut tx)
            .await?;
            tx.commit().await?;
            latest + 1
        };

        let cycle = sqlx::query_as::<_, BillingCycle>(
            "SELECT * FROM billing_cycles WHERE id = $1",
        )
        .bind(cycle_id)
        .fetch_one(&self.pool)
        .await?;
        let Some(bill) = self
            .generator
            .issue(&cycle, next_level, BillType::Email)
            .await?
        else {
            return Ok(None);
        };
        self.generator.send(&bill, &cycle).await?;
        Ok(Some(bill))
    }

    /// One full escalation pass. Returns the number of reminders issued.
    pub async fn run_pass(&self) -> AppResult<usize> {
        let mut issued = 0;
        for cycle in self.eligible_cycles(None).await? {
            if self.issue_next_reminder(cycle.id).await?.is_some() {
                issued += 1;
            }
        }
        if issued > 0 {
            tracing::info!(issued, "reminder pass issued bills");
        }
        Ok(issued)
    }

    /// Reminder-eligible cycles that should go out on paper instead: the
    /// caller hands these to the document renderer as one batch. The
    /// eligibility query already excludes cycles that got a Paper bill.
    pub async fn paper_reminder_candidates(
        &self,
        membership_id: Option<i32>,
    ) -> AppResult<Vec<BillingCycle>> {
        self.eligible_cycles(membership_id).await
    }

    /// Memberships still approved whose paper reminder has sat unpaid past
    /// the grace period. Input for manual follow-up.
    pub async fn overdue_paper_memberships(&self, grace_days: i64) -> AppResult<Vec<i32>> {
        let cutoff = Utc::now() - Duration::days(grace_days);
        let ids: Vec<i32> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT c.membership_id
            FROM bills b
            JOIN billing_cycles c ON c.id = b.billingcycle_id
            JOIN memberships m ON m.id = c.membership_id
            WHERE b.bill_type = 'paper'
              AND b.due_date < $1
              AND c.is_paid = false
              AND m.status = 'approved'
            ORDER BY c.membership_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

/// Spawns the background escalation loop.
pub fn spawn(pool: PgPool, config: BillingConfig, notifier: NotificationDispatcher) {
    let interval = TokioDuration::from_secs(config.reminder_scan_interval_secs);
    let scheduler = ReminderScheduler::new(pool, config, notifier);
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = scheduler.run_pass().await {
                warn!(?err, "reminder escalation pass failed");
            }
        }
    });
}
