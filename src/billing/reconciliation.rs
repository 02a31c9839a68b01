//! Payment-to-cycle reconciliation.
//!
//! Payments arrive from batch imports with a free-text reference number and
//! no cycle association. Matching compares the whitespace-normalized
//! reference against `billing_cycles.reference_number`; amount mismatches do
//! not block attachment, partial payments accumulate until the cycle is
//! covered. Attach/detach and the paid-status recomputation run inside one
//! transaction holding the cycle row lock.

use sqlx::PgPool;
use uuid::Uuid;

use crate::audit;
use crate::billing::cycles;
use crate::billing::models::{BillingCycle, NewPayment, Payment};
use crate::error::{AppError, AppResult};
use crate::notifications::{NotificationDispatcher, NotificationEvent};
use crate::reference;

/// Outcome of one matching sweep over unattached payments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MatchReport {
    pub attached: usize,
    pub duplicates: usize,
    pub unmatched: usize,
    pub invalid_reference: usize,
}

#[derive(Clone)]
pub struct PaymentReconciler {
    pool: PgPool,
    notifier: NotificationDispatcher,
}

impl PaymentReconciler {
    pub fn new(pool: PgPool, notifier: NotificationDispatcher) -> Self {
        Self { pool, notifier }
    }

    /// Records an imported payment. `transaction_id` is unique; an import
    /// replaying the same bank transaction is rejected by the constraint.
    pub async fn record_payment(&self, new: &NewPayment) -> AppResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (
                id, reference_number, message, transaction_id,
                payment_day, amount_cents, payment_type, payer_name
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.reference_number)
        .bind(&new.message)
        .bind(&new.transaction_id)
        .bind(new.payment_day)
        .bind(new.amount_cents)
        .bind(&new.payment_type)
        .bind(&new.payer_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(payment)
    }

    pub async fn fetch_payment(&self, payment_id: Uuid) -> AppResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)?;
        Ok(payment)
    }

    /// Attaches a payment to a cycle and recomputes the cycle's paid status
    /// atomically. Fails with `PaymentAlreadyAttached` if the payment is
    /// already associated with any cycle.
    pub async fn attach(
        &self,
        payment_id: Uuid,
        cycle_id: Uuid,
        actor: &str,
    ) -> AppResult<Payment> {
        let mut tx = self.pool.begin().await?;
        let cycle = cycles::lock_cycle(&mut tx, cycle_id).await?;
        let payment = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE id = $1 FOR UPDATE",
        )
        .bind(payment_id)
        .fetch_optional(&mut tx)
        .await?
        .ok_or(AppError::NotFound)?;
        if payment.billingcycle_id.is_some() {
            return Err(AppError::PaymentAlreadyAttached { payment_id });
        }

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments SET billingcycle_id = $1, ignore = false
            WHERE id = $2
            RETURNING *
            "#,
        )
        .bind(cycle.id)
        .bind(payment_id)
        .fetch_one(&mut tx)
        .await?;
        tracing::info!(
            payment = %payment.id,
            cycle = %cycle.id,
            membership_id = cycle.membership_id,
            "payment attached to billing cycle"
        );
        audit::record(
            &mut tx,
            actor,
            "payment",
            &payment.id.to_string(),
            "attached to billing cycle",
        )
        .await?;
        cycles::recompute_paid_locked(&mut tx, &cycle, actor).await?;
        tx.commit().await?;
        Ok(payment)
    }

    /// Detaches a payment from its cycle, then recomputes the old cycle's
    /// paid status. A no-op for unattached payments.
    pub async fn detach(&self, payment_id: Uuid, actor: &str) -> AppResult<()> {
        let payment = self.fetch_payment(payment_id).await?;
        let Some(cycle_id) = payment.billingcycle_id else {
            return Ok(());
        };

        let mut tx = self.pool.begin().await?;
        let cycle = cycles::lock_cycle(&mut tx, cycle_id).await?;
        // Re-read under the cycle lock; a concurrent detach may have won.
        let payment = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE id = $1 FOR UPDATE",
        )
        .bind(payment_id)
        .fetch_optional(&mut tx)
        .await?
        .ok_or(AppError::NotFound)?;
        if payment.billingcycle_id != Some(cycle_id) {
            tx.commit().await?;
            return Ok(());
        }

        sqlx::query("UPDATE payments SET billingcycle_id = NULL WHERE id = $1")
            .bind(payment_id)
            .execute(&mut tx)
            .await?;
        tracing::info!(payment = %payment_id, cycle = %cycle_id, "payment detached from cycle");
        audit::record(
            &mut tx,
            actor,
            "payment",
            &payment_id.to_string(),
            "detached from billing cycle",
        )
        .await?;
        cycles::recompute_paid_locked(&mut tx, &cycle, actor).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Flags a payment as a duplicate and surfaces a notice to the
    /// notification handlers. A zero-sum cycle (fee waived) never triggers
    /// a notice.
    pub async fn record_duplicate(&self, payment_id: Uuid, actor: &str) -> AppResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(
            "UPDATE payments SET duplicate = true WHERE id = $1 RETURNING *",
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound)?;

        if let Some(cycle) = self.cycle_for_reference(&payment.reference_number).await? {
            if cycle.sum_cents > 0 {
                self.notifier
                    .emit(&NotificationEvent::DuplicatePaymentNotice {
                        payment: payment.clone(),
                        cycle,
                        actor: actor.to_string(),
                    })
                    .await?;
                audit::record(
                    &self.pool,
                    actor,
                    "payment",
                    &payment.id.to_string(),
                    "duplicate payment notice sent",
                )
                .await?;
            }
        }
        Ok(payment)
    }

    /// Cycle whose reference number equals the whitespace-normalized free
    /// text, if the text is a well-formed reference at all.
    pub async fn cycle_for_reference(
        &self,
        raw_reference: &str,
    ) -> AppResult<Option<BillingCycle>> {
        let Ok(normalized) = reference::normalize(raw_reference) else {
            return Ok(None);
        };
        let cycle = sqlx::query_as::<_, BillingCycle>(
            "SELECT * FROM billing_cycles WHERE reference_number = $1",
        )
        .bind(&normalized)
        .fetch_optional(&self.pool)
        .await?;
        Ok(cycle)
    }

    /// Walks payments that are unattached, not ignored and not already
    /// flagged, and matches them to cycles by reference number. A match
    /// against an already-paid cycle marks the payment as a duplicate
    /// instead of attaching it.
    pub async fn match_unattached_payments(&self, actor: &str) -> AppResult<MatchReport> {
        let pending = sqlx::query_as::<_, Payment>(
            r#"
            SELECT * FROM payments
            WHERE billingcycle_id IS NULL AND ignore = false AND duplicate = false
            ORDER BY payment_day ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut report = MatchReport::default();
        for payment in pending {
            match reference::validate(&payment.reference_number) {
                Ok(true) => {}
                Ok(false) | Err(AppError::InvalidReferenceFormat(_)) => {
                    report.invalid_reference += 1;
                    continue;
                }
                Err(err) => return Err(err),
            }
            let Some(cycle) = self.cycle_for_reference(&payment.reference_number).await? else {
                report.unmatched += 1;
                continue;
            };
            if cycle.is_paid {
                self.record_duplicate(payment.id, actor).await?;
                report.duplicates += 1;
            } else {
                self.attach(payment.id, cycle.id, actor).await?;
                report.attached += 1;
            }
        }
        tracing::info!(
            attached = report.attached,
            duplicates = report.duplicates,
            unmatched = report.unmatched,
            invalid_reference = report.invalid_reference,
            "payment matching sweep finished"
        );
        Ok(report)
    }
}
