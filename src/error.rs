use thiserror::Error;

use crate::membership::models::MembershipStatus;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("membership {id} is already {status}")]
    AlreadyInStatus { id: i32, status: MembershipStatus },
    #[error("membership {id} status can't change from {from} to {to}")]
    IllegalTransition {
        id: i32,
        from: MembershipStatus,
        to: MembershipStatus,
    },
    #[error("no fee defined for membership type {member_type} effective {as_of}")]
    NoFeeDefined { member_type: String, as_of: String },
    #[error("invalid reference number format: '{0}'")]
    InvalidReferenceFormat(String),
    #[error("payment {payment_id} is already attached to a billing cycle")]
    PaymentAlreadyAttached { payment_id: uuid::Uuid },
    #[error("neither billing nor administrative contact has an email address")]
    NoBillingEmail,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("notification handler failed: {0}")]
    Notification(#[source] anyhow::Error),
    #[error("resource cleanup hook failed: {0}")]
    Cleanup(#[source] anyhow::Error),
    #[error("not found")]
    NotFound,
}

pub type AppResult<T> = Result<T, AppError>;
