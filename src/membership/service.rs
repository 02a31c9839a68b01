//! Membership lifecycle orchestration.
//!
//! Every status change runs inside a transaction holding a `FOR UPDATE`
//! lock on the membership row, so at most one transition per membership can
//! be in flight and a consumed state (say, a double approve) fails cleanly
//! for the second caller.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use sqlx::{PgConnection, PgPool};

use crate::audit;
use crate::billing::cycles;
use crate::contacts;
use crate::error::{AppError, AppResult};
use crate::membership::models::{Membership, MembershipStatus, NewMembership};
use crate::membership::state;
use crate::notifications::{NotificationDispatcher, NotificationEvent};

/// Cleanup hook for resources owned by a membership application. Registered
/// by the resource owner; the state machine carries no compile-time
/// dependency on any concrete resource type.
#[async_trait]
pub trait PendingResourceCleanup: Send + Sync {
    /// Called when a still-`New` application is deleted: dependent pending
    /// resources go away with it.
    async fn delete_for(&self, membership_id: i32) -> anyhow::Result<()>;
    /// Called when an accepted membership is deleted: dependent resources
    /// are marked expired, not removed.
    async fn expire_for(&self, membership_id: i32) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct MembershipService {
    pool: PgPool,
    notifier: NotificationDispatcher,
    cleanups: Vec<Arc<dyn PendingResourceCleanup>>,
}

impl MembershipService {
    pub fn new(pool: PgPool, notifier: NotificationDispatcher) -> Self {
        Self {
            pool,
            notifier,
            cleanups: Vec::new(),
        }
    }

    pub fn register_cleanup(&mut self, cleanup: Arc<dyn PendingResourceCleanup>) {
        self.cleanups.push(cleanup);
    }

    /// Persists a new application with status `New`. The structural rules
    /// are checked on an in-memory candidate before the insert, so an
    /// invalid application never reaches the database.
    pub async fn submit_application(&self, new: &NewMembership) -> AppResult<Membership> {
        new.candidate(Utc::now()).validate()?;
        let row = sqlx::query(
            r#"
            INSERT INTO memberships (
                member_type, status, municipality, nationality, birth_year,
                organization_registration_number, extra_info, public_memberlist,
                person_id, organization_id, billing_contact_id, tech_contact_id
            ) VALUES ($1, 'new', $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(new.member_type.as_str())
        .bind(&new.municipality)
        .bind(&new.nationality)
        .bind(new.birth_year)
        .bind(new.organization_registration_number.as_deref().unwrap_or(""))
        .bind(new.extra_info.as_deref().unwrap_or(""))
        .bind(new.public_memberlist)
        .bind(new.person_id)
        .bind(new.organization_id)
        .bind(new.billing_contact_id)
        .bind(new.tech_contact_id)
        .fetch_one(&self.pool)
        .await?;
        let membership = Membership::from_row(&row)?;
        tracing::info!(membership_id = membership.id, "membership application created");
        Ok(membership)
    }

    pub async fn fetch(&self, membership_id: i32) -> AppResult<Membership> {
        let row = sqlx::query("SELECT * FROM memberships WHERE id = $1")
            .bind(membership_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)?;
        Membership::from_row(&row)
    }

    /// Locked check-and-set of the membership status plus the target
    /// state's side effects. Dissociation cancels the latest outstanding
    /// bill inside the same transaction.
    pub async fn transition(
        &self,
        membership_id: i32,
        new_status: MembershipStatus,
        actor: &str,
    ) -> AppResult<Membership> {
        let mut tx = self.pool.begin().await?;
        let membership = transition_locked(&mut tx, membership_id, new_status, actor).await?;
        tx.commit().await?;
        Ok(membership)
    }

    /// Preapproves an application and notifies the configured handlers. The
    /// status change is committed before dispatch; a handler failure
    /// surfaces as an error even though the preapproval stands.
    pub async fn preapprove(&self, membership_id: i32, actor: &str) -> AppResult<Membership> {
        let membership = self
            .transition(membership_id, MembershipStatus::Preapproved, actor)
            .await?;
        tracing::info!(membership_id, actor, "membership preapproved");
        self.notifier
            .emit(&NotificationEvent::PreapprovalNotice {
                membership: membership.clone(),
            })
            .await?;
        Ok(membership)
    }

    pub async fn approve(&self, membership_id: i32, actor: &str) -> AppResult<Membership> {
        let membership = self
            .transition(membership_id, MembershipStatus::Approved, actor)
            .await?;
        tracing::info!(membership_id, actor, "membership approved");
        Ok(membership)
    }

    pub async fn request_dissociation(
        &self,
        membership_id: i32,
        actor: &str,
    ) -> AppResult<Membership> {
        let membership = self
            .transition(membership_id, MembershipStatus::DissociationRequested, actor)
            .await?;
        tracing::info!(membership_id, actor, "dissociation requested");
        Ok(membership)
    }

    /// Reverts a dissociation request back to `Approved`. Only meaningful
    /// for members that were approved at some point.
    pub async fn cancel_dissociation_request(
        &self,
        membership_id: i32,
        actor: &str,
    ) -> AppResult<Membership> {
        let current = self.fetch(membership_id).await?;
        if current.approved.is_none() {
            return Err(AppError::Validation(
                "can't cancel dissociation request unless approved as member".into(),
            ));
        }
        let membership = self
            .transition(membership_id, MembershipStatus::Approved, actor)
            .await?;
        tracing::info!(membership_id, actor, "dissociation request reverted");
        Ok(membership)
    }

    pub async fn dissociate(&self, membership_id: i32, actor: &str) -> AppResult<Membership> {
        let membership = self
            .transition(membership_id, MembershipStatus::Dissociated, actor)
            .await?;
        tracing::info!(membership_id, actor, "membership dissociated");
        Ok(membership)
    }

    /// Deletes a membership: runs the registered resource cleanups (delete
    /// for a still-`New` application, expire otherwise), scrubs the row via
    /// the `Deleted` transition and garbage-collects contacts that no other
    /// membership references.
    pub async fn delete(&self, membership_id: i32, actor: &str) -> AppResult<Membership> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM memberships WHERE id = $1 FOR UPDATE")
            .bind(membership_id)
            .fetch_optional(&mut tx)
            .await?
            .ok_or(AppError::NotFound)?;
        let current = Membership::from_row(&row)?;
        if current.status == MembershipStatus::Deleted {
            return Err(AppError::AlreadyInStatus {
                id: membership_id,
                status: MembershipStatus::Deleted,
            });
        }

        let was_new = current.status == MembershipStatus::New;
        for cleanup in &self.cleanups {
            let result = if was_new {
                cleanup.delete_for(membership_id).await
            } else {
                cleanup.expire_for(membership_id).await
            };
            result.map_err(AppError::Cleanup)?;
        }
        if was_new {
            tracing::info!(membership_id, "deleted pending resources of application");
        } else {
            tracing::info!(membership_id, "expired dependent resources of membership");
        }

        let contact_ids = current.contact_ids();
        let membership =
            transition_locked(&mut tx, membership_id, MembershipStatus::Deleted, actor).await?;
        tx.commit().await?;

        for contact_id in contact_ids {
            contacts::delete_if_no_references(&self.pool, contact_id, actor).await?;
        }
        tracing::info!(membership_id, actor, "membership deleted");
        Ok(membership)
    }
}

/// The check-and-set itself, reusable inside a caller's transaction. The
/// row lock is held until that transaction ends.
async fn transition_locked(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    membership_id: i32,
    new_status: MembershipStatus,
    actor: &str,
) -> AppResult<Membership> {
    let row = sqlx::query("SELECT * FROM memberships WHERE id = $1 FOR UPDATE")
        .bind(membership_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound)?;
    let mut membership = Membership::from_row(&row)?;
    let previous = membership.status;
    // Postgres TIMESTAMPTZ stores microseconds; truncate so the returned
    // struct matches what a re-fetch from the database yields.
    let effects = state::apply(&mut membership, new_status, Utc::now().trunc_subsecs(6))?;

    persist(&mut *tx, &membership).await?;
    if effects.cancel_outstanding_bills {
        cycles::cancel_outstanding_bills(&mut *tx, membership_id, actor).await?;
    }
    audit::record(
        &mut **tx,
        actor,
        "membership",
        &membership_id.to_string(),
        &format!("status: {previous} -> {new_status}"),
    )
    .await?;
    Ok(membership)
}

async fn persist(conn: &mut PgConnection, membership: &Membership) -> AppResult<()> {
    membership.validate()?;
    sqlx::query(
        r#"
        UPDATE memberships SET
            status = $1,
            approved = $2,
            dissociation_requested = $3,
            dissociated = $4,
            municipality = $5,
            birth_year = $6,
            organization_registration_number = $7,
            person_id = $8,
            organization_id = $9,
            billing_contact_id = $10,
            tech_contact_id = $11,
            last_changed = NOW()
        WHERE id = $12
        "#,
    )
    .bind(membership.status.as_str())
    .bind(membership.approved)
    .bind(membership.dissociation_requested)
    .bind(membership.dissociated)
    .bind(&membership.municipality)
    .bind(membership.birth_year)
    .bind(&membership.organization_registration_number)
    .bind(membership.person_id)
    .bind(membership.organization_id)
    .bind(membership.billing_contact_id)
    .bind(membership.tech_contact_id)
    .bind(membership.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
