//! Contact records and billing-email resolution.
//!
//! A membership references contacts by id: exactly one of person or
//! organization, plus optional billing and technical contacts. Contacts are
//! shared rows and are garbage-collected when the last membership reference
//! disappears.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

use crate::error::{AppError, AppResult};
use crate::membership::models::Membership;

#[derive(Clone, Debug, FromRow, Serialize)]
pub struct Contact {
    pub id: i32,
    pub created: DateTime<Utc>,
    pub last_changed: DateTime<Utc>,
    pub first_name: String,
    pub given_names: String,
    pub last_name: String,
    pub organization_name: String,
    pub street_address: String,
    pub postal_code: String,
    pub post_office: String,
    pub country: String,
    pub phone: String,
    pub sms: String,
    pub email: String,
    pub homepage: String,
}

impl Contact {
    pub fn name(&self) -> String {
        if !self.organization_name.is_empty() {
            self.organization_name.clone()
        } else {
            format!("{} {}", self.first_name, self.last_name)
        }
    }

    /// `Name <address>` form for outbound mail, or `None` without an email.
    pub fn email_to(&self) -> Option<String> {
        if self.email.is_empty() {
            return None;
        }
        Some(format!("{} <{}>", self.name(), self.email))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewContact {
    pub first_name: String,
    pub given_names: String,
    pub last_name: String,
    pub organization_name: String,
    pub street_address: String,
    pub postal_code: String,
    pub post_office: String,
    pub country: String,
    pub phone: String,
    pub sms: String,
    pub email: String,
    pub homepage: String,
}

/// Minimum length counts characters, not bytes, so short names in scripts
/// with multibyte letters are still rejected.
fn check_organization_name(name: &str) -> AppResult<()> {
    if !name.is_empty() && name.chars().count() < 5 {
        return Err(AppError::Validation(
            "organization name should be at least 5 characters".into(),
        ));
    }
    Ok(())
}

pub async fn create_contact(pool: &PgPool, new: &NewContact) -> AppResult<Contact> {
    check_organization_name(&new.organization_name)?;
    let mut homepage = new.homepage.clone();
    if !homepage.is_empty() && !homepage.contains("://") {
        homepage = format!("http://{homepage}");
    }
    let row = sqlx::query_as::<_, Contact>(
        r#"
        INSERT INTO contacts (
            first_name, given_names, last_name, organization_name,
            street_address, postal_code, post_office, country,
            phone, sms, email, homepage
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        RETURNING *
        "#,
    )
    .bind(&new.first_name)
    .bind(&new.given_names)
    .bind(&new.last_name)
    .bind(&new.organization_name)
    .bind(&new.street_address)
    .bind(&new.postal_code)
    .bind(&new.post_office)
    .bind(&new.country)
    .bind(&new.phone)
    .bind(&new.sms)
    .bind(&new.email)
    .bind(&homepage)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn fetch_contact(pool: &PgPool, id: i32) -> AppResult<Option<Contact>> {
    let row = sqlx::query_as::<_, Contact>("SELECT * FROM contacts WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Best email address for billing, in priority order: billing contact,
/// person, organization. Fails with `NoBillingEmail` when none of the three
/// carries an address.
pub async fn billing_email(pool: &PgPool, membership: &Membership) -> AppResult<String> {
    for contact_id in membership.billing_contact_priority() {
        if let Some(contact) = fetch_contact(pool, contact_id).await? {
            if let Some(address) = contact.email_to() {
                return Ok(address);
            }
        }
    }
    Err(AppError::NoBillingEmail)
}

/// The contact used for billing address details: billing contact if set,
/// otherwise person, otherwise organization.
pub async fn resolve_billing_contact(
    pool: &PgPool,
    membership: &Membership,
) -> AppResult<Option<Contact>> {
    for contact_id in membership.billing_contact_priority() {
        if let Some(contact) = fetch_contact(pool, contact_id).await? {
            return Ok(Some(contact));
        }
    }
    Ok(None)
}

/// Deletes a contact when no membership references it any more. Returns
/// whether the row was removed.
pub async fn delete_if_no_references(pool: &PgPool, contact_id: i32, actor: &str) -> AppResult<bool> {
    let references: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM memberships
        WHERE person_id = $1
           OR organization_id = $1
           OR billing_contact_id = $1
           OR tech_contact_id = $1
        "#,
    )
    .bind(contact_id)
    .fetch_one(pool)
    .await?;
    if references > 0 {
        return Ok(false);
    }
    let deleted = sqlx::query("DELETE FROM contacts WHERE id = $1")
        .bind(contact_id)
        .execute(pool)
        .await?
        .rows_affected();
    if deleted > 0 {
        tracing::info!(contact_id, actor, "deleted contact: no more references");
    }
    Ok(deleted > 0)
}
