use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Identifier wrapper for submitted applications.
    ApplicationId
);
uuid_id!(
    /// Identifier of the listing an application pool belongs to.
    ListingId
);
uuid_id!(
    /// Identifier of an application flagged set.
    FlaggedSetId
);
uuid_id!(
    /// Staff or applicant account reference.
    UserId
);

/// Eight uppercase hex characters, unique per listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfirmationCode(pub String);

impl ConfirmationCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfirmationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: Option<String>,
    pub street2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
}

/// Primary applicant details as captured by the intake forms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applicant {
    pub first_name: Option<String>,
    #[serde(default)]
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub address: Option<Address>,
}

impl Applicant {
    pub fn has_email(&self) -> bool {
        self.email_address
            .as_deref()
            .is_some_and(|email| !email.trim().is_empty())
    }

    pub fn display_name(&self) -> String {
        [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HouseholdMember {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub relationship: Option<String>,
}

/// Persisted submission to a single listing's application pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: ApplicationId,
    pub listing_id: ListingId,
    pub user_id: Option<UserId>,
    pub applicant: Applicant,
    pub household_members: Vec<HouseholdMember>,
    pub submission_date: DateTime<Utc>,
    pub confirmation_code: ConfirmationCode,
    /// Derived from flagged-set membership; the sets are authoritative.
    pub marked_as_duplicate: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Application {
    pub fn is_withdrawn(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn summary(&self) -> ApplicationSummary {
        ApplicationSummary {
            id: self.id,
            confirmation_code: self.confirmation_code.clone(),
            first_name: self.applicant.first_name.clone(),
            last_name: self.applicant.last_name.clone(),
            email_address: self.applicant.email_address.clone(),
            date_of_birth: self.applicant.date_of_birth,
            submission_date: self.submission_date,
            marked_as_duplicate: self.marked_as_duplicate,
        }
    }
}

/// Condensed application shape nested inside flagged-set responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSummary {
    pub id: ApplicationId,
    pub confirmation_code: ConfirmationCode,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email_address: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub submission_date: DateTime<Utc>,
    pub marked_as_duplicate: bool,
}

/// Create payload handed over by the CRUD layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSubmission {
    pub listing_id: ListingId,
    pub applicant: Applicant,
    #[serde(default)]
    pub household_members: Vec<HouseholdMember>,
    /// Public site base URL forwarded to the confirmation collaborator.
    #[serde(default)]
    pub app_url: Option<String>,
}

impl ApplicationSubmission {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_applicant(&self.applicant)
    }
}

/// Partial update; only supplied fields overwrite the stored application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationUpdate {
    #[serde(default)]
    pub applicant: Option<Applicant>,
    #[serde(default)]
    pub household_members: Option<Vec<HouseholdMember>>,
}

impl ApplicationUpdate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match &self.applicant {
            Some(applicant) => validate_applicant(applicant),
            None => Ok(()),
        }
    }

    pub fn apply_to(&self, application: &mut Application, at: DateTime<Utc>) {
        if let Some(applicant) = &self.applicant {
            application.applicant = applicant.clone();
        }
        if let Some(members) = &self.household_members {
            application.household_members = members.clone();
        }
        application.updated_at = at;
    }
}

fn validate_applicant(applicant: &Applicant) -> Result<(), ValidationError> {
    let blank = |value: &Option<String>| value.as_deref().map_or(true, |v| v.trim().is_empty());
    if blank(&applicant.first_name) {
        return Err(ValidationError::MissingField("applicant.first_name"));
    }
    if blank(&applicant.last_name) {
        return Err(ValidationError::MissingField("applicant.last_name"));
    }
    Ok(())
}

/// Listing attributes consulted before a submission is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSnapshot {
    pub id: ListingId,
    pub name: String,
    pub application_due_date: Option<DateTime<Utc>>,
}

impl ListingSnapshot {
    pub fn accepts_submission_at(&self, at: DateTime<Utc>) -> bool {
        self.application_due_date.map_or(true, |due| at <= due)
    }
}

/// Acting user and clock reading for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub acting_user: Option<UserId>,
    pub now: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(acting_user: Option<UserId>) -> Self {
        Self {
            acting_user,
            now: Utc::now(),
        }
    }

    pub fn at(acting_user: Option<UserId>, now: DateTime<Utc>) -> Self {
        Self { acting_user, now }
    }
}

/// Caller-correctable input problems, rejected before any transaction opens.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("Listing is not open for application submission.")]
    ListingClosed,
    #[error("application {0} is not a member of the flagged set")]
    ResolutionOutsideSet(ApplicationId),
    #[error("{field} must be between {min} and {max}")]
    OutOfRange {
        field: &'static str,
        min: u32,
        max: u32,
    },
}
