pub mod models;
pub mod service;
pub mod state;

pub use models::{MemberType, Membership, MembershipStatus, NewMembership};
pub use service::{MembershipService, PendingResourceCleanup};
pub use state::{allowed_targets, TransitionEffects};
