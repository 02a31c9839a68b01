//! Computed figures for printable bills and the renderer seam.
//!
//! Rendering itself (PDF, plain text) is an external collaborator; this
//! module only resolves the amounts, references and contact details a
//! renderer needs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

use crate::billing::cycles::CycleService;
use crate::billing::models::{Bill, BillingCycle};
use crate::config::BillingConfig;
use crate::contacts;
use crate::error::{AppError, AppResult};
use crate::membership::models::Membership;
use crate::reference;

/// Everything a renderer needs for one bill or reminder. For reminders the
/// amounts are the remaining balance after payments received so far.
#[derive(Clone, Debug, Serialize)]
pub struct BillDocumentFields {
    pub bill_id: uuid::Uuid,
    pub member_id: i32,
    pub member_name: String,
    pub billing_name: String,
    pub street_address: String,
    pub postal_code: String,
    pub post_office: String,
    pub country: String,
    pub reference_number: String,
    pub reference_number_grouped: String,
    pub rf_reference: String,
    pub iban_account_number: String,
    pub bic_code: String,
    pub due_date: Option<DateTime<Utc>>,
    pub original_sum_cents: i64,
    pub amount_paid_cents: i64,
    pub sum_cents: i64,
    pub non_vat_cents: i64,
    pub vat_cents: i64,
    pub vat_percentage: i32,
    pub latest_payment_day: Option<DateTime<Utc>>,
}

/// Splits a VAT-inclusive amount into its net and VAT parts, rounding the
/// net part half up at the final division.
pub fn split_vat(sum_cents: i64, vat_percentage: i32) -> (i64, i64) {
    let divisor = 100 + i64::from(vat_percentage);
    let non_vat = (sum_cents * 100 + divisor / 2) / divisor;
    (non_vat, sum_cents - non_vat)
}

/// Resolves the renderable fields for a bill. Reminders carry no due date of
/// their own on paper and state the remaining balance instead of the
/// original sum.
pub async fn bill_document_fields(
    pool: &PgPool,
    config: &BillingConfig,
    membership: &Membership,
    cycle: &BillingCycle,
    bill: &Bill,
) -> AppResult<BillDocumentFields> {
    let billing_contact = contacts::resolve_billing_contact(pool, membership)
        .await?
        .ok_or_else(|| AppError::Validation("membership has no billing contact".into()))?;
    let fee = crate::billing::fees::lookup(pool, membership.member_type, cycle.start).await?;

    let amount_paid_cents = if bill.is_reminder() {
        CycleService::new(pool.clone()).amount_paid(cycle.id).await?
    } else {
        0
    };
    let sum_cents = cycle.sum_cents - amount_paid_cents;
    let (non_vat_cents, vat_cents) = split_vat(sum_cents, fee.vat_percentage);

    Ok(BillDocumentFields {
        bill_id: bill.id,
        member_id: membership.id,
        member_name: billing_contact.name(),
        billing_name: billing_contact.name(),
        street_address: billing_contact.street_address.clone(),
        postal_code: billing_contact.postal_code.clone(),
        post_office: billing_contact.post_office.clone(),
        country: billing_contact.country.clone(),
        reference_number: cycle.reference_number.clone(),
        reference_number_grouped: reference::group_right(&cycle.reference_number),
        rf_reference: reference::to_international(&cycle.reference_number)?,
        iban_account_number: config.iban_account_number.clone(),
        bic_code: config.bic_code.clone(),
        due_date: if bill.is_reminder() {
            None
        } else {
            Some(bill.due_date)
        },
        original_sum_cents: cycle.sum_cents,
        amount_paid_cents,
        sum_cents,
        non_vat_cents,
        vat_cents,
        vat_percentage: fee.vat_percentage,
        latest_payment_day: latest_payment_day(pool).await?,
    })
}

/// Day of the most recent recorded payment, shown on reminders.
pub async fn latest_payment_day(pool: &PgPool) -> AppResult<Option<DateTime<Utc>>> {
    let day: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT MAX(payment_day) FROM payments")
            .fetch_one(pool)
            .await?;
    Ok(day)
}

/// External document renderer. Given resolved fields it returns printable
/// bytes; given a reminder batch it returns `None` for an empty set.
pub trait DocumentRenderer: Send + Sync {
    fn render_bill(&self, fields: &BillDocumentFields) -> anyhow::Result<Vec<u8>>;
    fn render_reminder_batch(
        &self,
        entries: &[BillDocumentFields],
    ) -> anyhow::Result<Option<Vec<u8>>>;
}
