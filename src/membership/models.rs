use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::error::{AppError, AppResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberType {
    Person,
    Junior,
    Supporting,
    Organization,
    Honorary,
}

impl MemberType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberType::Person => "person",
            MemberType::Junior => "junior",
            MemberType::Supporting => "supporting",
            MemberType::Organization => "organization",
            MemberType::Honorary => "honorary",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "person" => Some(MemberType::Person),
            "junior" => Some(MemberType::Junior),
            "supporting" => Some(MemberType::Supporting),
            "organization" => Some(MemberType::Organization),
            "honorary" => Some(MemberType::Honorary),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemberType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    New,
    Preapproved,
    Approved,
    DissociationRequested,
    Dissociated,
    Deleted,
}

impl MembershipStatus {
    pub const ALL: [MembershipStatus; 6] = [
        MembershipStatus::New,
        MembershipStatus::Preapproved,
        MembershipStatus::Approved,
        MembershipStatus::DissociationRequested,
        MembershipStatus::Dissociated,
        MembershipStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::New => "new",
            MembershipStatus::Preapproved => "preapproved",
            MembershipStatus::Approved => "approved",
            MembershipStatus::DissociationRequested => "dissociation_requested",
            MembershipStatus::Dissociated => "dissociated",
            MembershipStatus::Deleted => "deleted",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "new" => Some(MembershipStatus::New),
            "preapproved" => Some(MembershipStatus::Preapproved),
            "approved" => Some(MembershipStatus::Approved),
            "dissociation_requested" => Some(MembershipStatus::DissociationRequested),
            "dissociated" => Some(MembershipStatus::Dissociated),
            "deleted" => Some(MembershipStatus::Deleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One paying member. Mutated only through the state machine; never
/// physically deleted (terminal state is `Deleted` with scrubbed fields).
#[derive(Clone, Debug, Serialize)]
pub struct Membership {
    pub id: i32,
    pub member_type: MemberType,
    pub status: MembershipStatus,
    pub created: DateTime<Utc>,
    pub last_changed: DateTime<Utc>,
    pub approved: Option<DateTime<Utc>>,
    pub dissociation_requested: Option<DateTime<Utc>>,
    pub dissociated: Option<DateTime<Utc>>,
    pub municipality: String,
    pub nationality: String,
    pub birth_year: Option<i32>,
    pub organization_registration_number: String,
    pub extra_info: String,
    pub public_memberlist: bool,
    pub person_id: Option<i32>,
    pub organization_id: Option<i32>,
    pub billing_contact_id: Option<i32>,
    pub tech_contact_id: Option<i32>,
}

impl Membership {
    pub fn from_row(row: &PgRow) -> AppResult<Self> {
        let type_raw: String = row.try_get("member_type")?;
        let status_raw: String = row.try_get("status")?;
        let member_type = MemberType::from_str(&type_raw)
            .ok_or_else(|| AppError::Validation(format!("illegal member type '{type_raw}'")))?;
        let status = MembershipStatus::from_str(&status_raw)
            .ok_or_else(|| AppError::Validation(format!("illegal member status '{status_raw}'")))?;
        Ok(Membership {
            id: row.try_get("id")?,
            member_type,
            status,
            created: row.try_get("created")?,
            last_changed: row.try_get("last_changed")?,
            approved: row.try_get("approved")?,
            dissociation_requested: row.try_get("dissociation_requested")?,
            dissociated: row.try_get("dissociated")?,
            municipality: row.try_get("municipality")?,
            nationality: row.try_get("nationality")?,
            birth_year: row.try_get("birth_year")?,
            organization_registration_number: row.try_get("organization_registration_number")?,
            extra_info: row.try_get("extra_info")?,
            public_memberlist: row.try_get("public_memberlist")?,
            person_id: row.try_get("person_id")?,
            organization_id: row.try_get("organization_id")?,
            billing_contact_id: row.try_get("billing_contact_id")?,
            tech_contact_id: row.try_get("tech_contact_id")?,
        })
    }

    /// Structural invariants checked before every persist. A non-deleted
    /// membership holds exactly one of person/organization contact; a
    /// deleted one holds none.
    pub fn validate(&self) -> AppResult<()> {
        if self.status != MembershipStatus::Deleted {
            if self.member_type == MemberType::Organization && self.person_id.is_some() {
                return Err(AppError::Validation(
                    "organization may not have a person contact".into(),
                ));
            }
            if !matches!(
                self.member_type,
                MemberType::Organization | MemberType::Supporting
            ) && self.organization_id.is_some()
            {
                return Err(AppError::Validation(
                    "non-organization may not have an organization contact".into(),
                ));
            }
            if self.person_id.is_some() && self.organization_id.is_some() {
                return Err(AppError::Validation(
                    "person contact and organization contact are mutually exclusive".into(),
                ));
            }
            if self.person_id.is_none() && self.organization_id.is_none() {
                return Err(AppError::Validation(
                    "either person contact or organization contact must be set".into(),
                ));
            }
            if self.municipality.is_empty() {
                return Err(AppError::Validation("municipality can't be empty".into()));
            }
        } else if self.person_id.is_some()
            || self.organization_id.is_some()
            || self.billing_contact_id.is_some()
            || self.tech_contact_id.is_some()
        {
            return Err(AppError::Validation(
                "a deleted membership may not have any contacts".into(),
            ));
        }
        Ok(())
    }

    /// Contact ids in billing priority order: billing contact first, then
    /// person, then organization.
    pub fn billing_contact_priority(&self) -> Vec<i32> {
        [self.billing_contact_id, self.person_id, self.organization_id]
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn contact_ids(&self) -> Vec<i32> {
        [
            self.person_id,
            self.billing_contact_id,
            self.tech_contact_id,
            self.organization_id,
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Incoming membership application. Persisted with status `New`.
#[derive(Clone, Debug, Deserialize)]
pub struct NewMembership {
    pub member_type: MemberType,
    pub municipality: String,
    pub nationality: String,
    pub birth_year: Option<i32>,
    pub organization_registration_number: Option<String>,
    pub extra_info: Option<String>,
    pub public_memberlist: bool,
    pub person_id: Option<i32>,
    pub organization_id: Option<i32>,
    pub billing_contact_id: Option<i32>,
    pub tech_contact_id: Option<i32>,
}

impl NewMembership {
    /// The row this application would become, for validation before an
    /// insert. The id is a placeholder until the database assigns one.
    pub fn candidate(&self, now: DateTime<Utc>) -> Membership {
        Membership {
            id: 0,
            member_type: self.member_type,
            status: MembershipStatus::New,
            created: now,
            last_changed: now,
            approved: None,
            dissociation_requested: None,
            dissociated: None,
            municipality: self.municipality.clone(),
            nationality: self.nationality.clone(),
            birth_year: self.birth_year,
            organization_registration_number: self
                .organization_registration_number
                .clone()
                .unwrap_or_default(),
            extra_info: self.extra_info.clone().unwrap_or_default(),
            public_memberlist: self.public_memberlist,
            person_id: self.person_id,
            organization_id: self.organization_id,
            billing_contact_id: self.billing_contact_id,
            tech_contact_id: self.tech_contact_id,
        }
    }
}
