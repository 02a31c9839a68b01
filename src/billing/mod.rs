pub mod bills;
pub mod cycles;
pub mod fees;
pub mod models;
pub mod reconciliation;
pub mod render;
pub mod scheduler;

pub use bills::{due_date_for, BillGenerator};
pub use cycles::{cycle_end, CycleService};
pub use models::{Bill, BillType, BillingCycle, CancelledBill, Fee, NewPayment, Payment};
pub use reconciliation::{MatchReport, PaymentReconciler};
pub use render::{bill_document_fields, BillDocumentFields, DocumentRenderer};
pub use scheduler::{spawn as spawn_reminder_scheduler, ReminderScheduler};
