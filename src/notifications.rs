//! Synchronous notification dispatch.
//!
//! The core emits a small set of events and runs every registered handler in
//! registration order. Dispatch is fail-fast: the first handler error aborts
//! the remaining handlers and is returned to the caller, even when the state
//! change that triggered the event is already committed. Callers must treat
//! "transition succeeded, notification failed" as a distinct partial-failure
//! case.

use std::sync::Arc;

use async_trait::async_trait;

use crate::billing::models::{Bill, BillingCycle, Payment};
use crate::error::{AppError, AppResult};
use crate::membership::models::Membership;

#[derive(Clone, Debug)]
pub enum NotificationEvent {
    PreapprovalNotice {
        membership: Membership,
    },
    BillIssued {
        bill: Bill,
        cycle: BillingCycle,
    },
    DuplicatePaymentNotice {
        payment: Payment,
        cycle: BillingCycle,
        actor: String,
    },
}

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::PreapprovalNotice { .. } => "preapproval_notice",
            NotificationEvent::BillIssued { .. } => "bill_issued",
            NotificationEvent::DuplicatePaymentNotice { .. } => "duplicate_payment_notice",
        }
    }
}

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, event: &NotificationEvent) -> anyhow::Result<()>;
}

/// Ordered list of handlers invoked synchronously for each event.
#[derive(Clone, Default)]
pub struct NotificationDispatcher {
    handlers: Vec<Arc<dyn NotificationHandler>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn NotificationHandler>) {
        self.handlers.push(handler);
    }

    pub async fn emit(&self, event: &NotificationEvent) -> AppResult<()> {
        for handler in &self.handlers {
            if let Err(err) = handler.handle(event).await {
                tracing::error!(?err, kind = event.kind(), "notification handler failed");
                return Err(AppError::Notification(err));
            }
        }
        Ok(())
    }
}

/// Default handler wired in `main`: logs every event it sees. Real outbound
/// email/SMS delivery lives outside this crate and registers its own handler.
pub struct LoggingHandler;

#[async_trait]
impl NotificationHandler for LoggingHandler {
    async fn handle(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        match event {
            NotificationEvent::PreapprovalNotice { membership } => {
                tracing::info!(membership_id = membership.id, "preapproval notice");
            }
            NotificationEvent::BillIssued { bill, cycle } => {
                tracing::info!(
                    bill = %bill.id,
                    cycle = %cycle.id,
                    reminder_count = bill.reminder_count,
                    "bill issued"
                );
            }
            NotificationEvent::DuplicatePaymentNotice {
                payment,
                cycle,
                actor,
            } => {
                tracing::info!(
                    payment = %payment.id,
                    cycle = %cycle.id,
                    actor = %actor,
                    "duplicate payment notice"
                );
            }
        }
        Ok(())
    }
}
