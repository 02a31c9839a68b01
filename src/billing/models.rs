use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::membership::models::MemberType;

/// Fee and VAT rate effective for a membership type from a given moment.
/// Rows are immutable; the applicable fee for a cycle is the latest row with
/// `effective_from <= cycle.start`.
#[derive(Clone, Debug, Serialize)]
pub struct Fee {
    pub id: i32,
    pub member_type: MemberType,
    pub effective_from: DateTime<Utc>,
    pub amount_cents: i64,
    pub vat_percentage: i32,
}

impl Fee {
    pub fn from_row(row: &PgRow) -> AppResult<Self> {
        let type_raw: String = row.try_get("member_type")?;
        let member_type = MemberType::from_str(&type_raw)
            .ok_or_else(|| AppError::Validation(format!("illegal fee type '{type_raw}'")))?;
        Ok(Fee {
            id: row.try_get("id")?,
            member_type,
            effective_from: row.try_get("effective_from")?,
            amount_cents: row.try_get("amount_cents")?,
            vat_percentage: row.try_get("vat_percentage")?,
        })
    }
}

/// One membership-year's fee obligation window. `sum_cents` is fixed at
/// creation from the fee table; `is_paid` is recomputed by the reconciler.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct BillingCycle {
    pub id: Uuid,
    pub membership_id: i32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub sum_cents: i64,
    pub is_paid: bool,
    pub reference_number: String,
    pub created: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillType {
    Email,
    Paper,
    Sms,
}

impl BillType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillType::Email => "email",
            BillType::Paper => "paper",
            BillType::Sms => "sms",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "email" => Some(BillType::Email),
            "paper" => Some(BillType::Paper),
            "sms" => Some(BillType::Sms),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bill or reminder inside a cycle. `reminder_count` zero is the original
/// bill; positive values are escalation levels with strictly increasing due
/// dates.
#[derive(Clone, Debug, Serialize)]
pub struct Bill {
    pub id: Uuid,
    pub billingcycle_id: Uuid,
    pub reminder_count: i32,
    pub due_date: DateTime<Utc>,
    pub bill_type: BillType,
    pub created: DateTime<Utc>,
    pub last_changed: DateTime<Utc>,
}

impl Bill {
    pub fn is_reminder(&self) -> bool {
        self.reminder_count > 0
    }

    pub fn from_row(row: &PgRow) -> AppResult<Self> {
        let type_raw: String = row.try_get("bill_type")?;
        let bill_type = BillType::from_str(&type_raw)
            .ok_or_else(|| AppError::Validation(format!("illegal bill type '{type_raw}'")))?;
        Ok(Bill {
            id: row.try_get("id")?,
            billingcycle_id: row.try_get("billingcycle_id")?,
            reminder_count: row.try_get("reminder_count")?,
            due_date: row.try_get("due_date")?,
            bill_type,
            created: row.try_get("created")?,
            last_changed: row.try_get("last_changed")?,
        })
    }
}

/// Cancellation marker for an original bill. Reminders may never be
/// cancelled, enforced both here and by the insert path.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct CancelledBill {
    pub id: Uuid,
    pub bill_id: Uuid,
    pub created: DateTime<Utc>,
    pub exported: bool,
}

/// An incoming bank payment. `transaction_id` is the global de-duplication
/// key; the cycle association stays null until the payment is matched.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct Payment {
    pub id: Uuid,
    pub billingcycle_id: Option<Uuid>,
    pub ignore: bool,
    pub comment: String,
    pub reference_number: String,
    pub message: String,
    pub transaction_id: String,
    pub payment_day: DateTime<Utc>,
    pub amount_cents: i64,
    pub payment_type: String,
    pub payer_name: String,
    pub duplicate: bool,
    pub created: DateTime<Utc>,
}

/// Payment fields as they arrive from an import; the cycle association and
/// duplicate flag are assigned by the reconciler.
#[derive(Clone, Debug, Deserialize)]
pub struct NewPayment {
    pub reference_number: String,
    pub message: String,
    pub transaction_id: String,
    pub payment_day: DateTime<Utc>,
    pub amount_cents: i64,
    pub payment_type: String,
    pub payer_name: String,
}
