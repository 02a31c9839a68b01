pub mod audit;
pub mod billing;
pub mod config;
pub mod contacts;
pub mod error;
pub mod membership;
pub mod notifications;
pub mod reference;

pub use config::BillingConfig;
pub use error::{AppError, AppResult};
pub use notifications::{
    LoggingHandler, NotificationDispatcher, NotificationEvent, NotificationHandler,
};
