//! Membership status transition rules.
//!
//! This module is pure: it decides whether a transition is legal and applies
//! the field-level effects to an in-memory row. Locking, persistence and the
//! billing side effects live in [`crate::membership::service`].

use chrono::{DateTime, Utc};

use crate::error::{AppError, AppResult};
use crate::membership::models::{Membership, MembershipStatus};

/// Allowed transitions, from state to target states. `Deleted` is terminal.
pub fn allowed_targets(from: MembershipStatus) -> &'static [MembershipStatus] {
    match from {
        MembershipStatus::New => &[MembershipStatus::Preapproved, MembershipStatus::Deleted],
        MembershipStatus::Preapproved => &[MembershipStatus::Approved, MembershipStatus::Deleted],
        MembershipStatus::Approved => &[
            MembershipStatus::DissociationRequested,
            MembershipStatus::Dissociated,
        ],
        MembershipStatus::DissociationRequested => {
            &[MembershipStatus::Dissociated, MembershipStatus::Approved]
        }
        MembershipStatus::Dissociated => &[MembershipStatus::Deleted],
        MembershipStatus::Deleted => &[],
    }
}

/// What the caller must still do inside the same transaction after the row
/// update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransitionEffects {
    /// Set when the membership was dissociated: the latest outstanding bill
    /// of the latest cycle must be cancelled.
    pub cancel_outstanding_bills: bool,
}

/// Checks and applies `new_status` to the locked row. Timestamps follow the
/// target state: first approval stamps `approved` once and re-approval after
/// a reverted dissociation request keeps the original value.
pub fn apply(
    membership: &mut Membership,
    new_status: MembershipStatus,
    now: DateTime<Utc>,
) -> AppResult<TransitionEffects> {
    let current = membership.status;
    if new_status == current {
        return Err(AppError::AlreadyInStatus {
            id: membership.id,
            status: current,
        });
    }
    if !allowed_targets(current).contains(&new_status) {
        return Err(AppError::IllegalTransition {
            id: membership.id,
            from: current,
            to: new_status,
        });
    }

    let mut effects = TransitionEffects::default();
    membership.status = new_status;
    match new_status {
        MembershipStatus::Approved => {
            if membership.approved.is_none() {
                membership.approved = Some(now);
            }
            membership.dissociation_requested = None;
        }
        MembershipStatus::DissociationRequested => {
            membership.dissociation_requested = Some(now);
        }
        MembershipStatus::Dissociated => {
            membership.dissociated = Some(now);
            effects.cancel_outstanding_bills = true;
        }
        MembershipStatus::Deleted => {
            membership.person_id = None;
            membership.billing_contact_id = None;
            membership.tech_contact_id = None;
            membership.organization_id = None;
            membership.municipality = String::new();
            membership.birth_year = None;
            membership.organization_registration_number = String::new();
        }
        MembershipStatus::New | MembershipStatus::Preapproved => {}
    }
    membership.last_changed = now;
    membership.validate()?;
    Ok(effects)
}
