use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::domain::{
    Application, ApplicationId, ConfirmationCode, FlaggedSetId, ListingId, ListingSnapshot,
    UserId,
};
use super::flagging::{ApplicationFlaggedSet, FlaggingRule};

/// Unique constraint over `(listing_id, confirmation_code)`.
pub const CONFIRMATION_CODE_CONSTRAINT: &str = "applications_listing_confirmation_code_key";

/// Opens serializable transactions; the only way flagged sets are mutated.
#[async_trait]
pub trait FlaggingDatabase: Send + Sync {
    type Transaction: FlaggingTransaction;

    async fn begin_serializable(&self) -> Result<Self::Transaction, RepositoryError>;
}

/// Reads and writes performed inside one serializable transaction.
///
/// Dropping a transaction without calling [`FlaggingTransaction::commit`] discards its writes.
#[async_trait]
pub trait FlaggingTransaction: Send {
    async fn fetch_application(
        &mut self,
        id: ApplicationId,
    ) -> Result<Option<Application>, RepositoryError>;

    /// Non-withdrawn applications of the listing, oldest submission first.
    async fn listing_applications(
        &mut self,
        listing_id: ListingId,
    ) -> Result<Vec<Application>, RepositoryError>;

    async fn search_applications(
        &mut self,
        filter: &ApplicationFilter,
    ) -> Result<Vec<Application>, RepositoryError>;

    async fn confirmation_code_exists(
        &mut self,
        listing_id: ListingId,
        code: &ConfirmationCode,
    ) -> Result<bool, RepositoryError>;

    async fn insert_application(&mut self, application: &Application)
        -> Result<(), RepositoryError>;

    async fn update_application(&mut self, application: &Application)
        -> Result<(), RepositoryError>;

    async fn set_duplicate_flag(
        &mut self,
        id: ApplicationId,
        marked_as_duplicate: bool,
    ) -> Result<(), RepositoryError>;

    async fn fetch_set(
        &mut self,
        id: FlaggedSetId,
    ) -> Result<Option<ApplicationFlaggedSet>, RepositoryError>;

    /// Every set of the listing, oldest first.
    async fn listing_sets(
        &mut self,
        listing_id: ListingId,
    ) -> Result<Vec<ApplicationFlaggedSet>, RepositoryError>;

    /// Open sets of the listing for `rule`, oldest first.
    async fn open_sets(
        &mut self,
        listing_id: ListingId,
        rule: FlaggingRule,
    ) -> Result<Vec<ApplicationFlaggedSet>, RepositoryError>;

    async fn sets_containing(
        &mut self,
        application_id: ApplicationId,
    ) -> Result<Vec<ApplicationFlaggedSet>, RepositoryError>;

    async fn insert_set(&mut self, set: &ApplicationFlaggedSet) -> Result<(), RepositoryError>;

    /// Replaces the set row together with both membership relations.
    async fn update_set(&mut self, set: &ApplicationFlaggedSet) -> Result<(), RepositoryError>;

    async fn delete_set(&mut self, id: FlaggedSetId) -> Result<(), RepositoryError>;

    async fn commit(self) -> Result<(), RepositoryError>;

    async fn rollback(self) -> Result<(), RepositoryError>;
}

/// Listing lookup used for the submission-window pre-check.
#[async_trait]
pub trait ListingDirectory: Send + Sync {
    async fn find_listing(
        &self,
        id: ListingId,
    ) -> Result<Option<ListingSnapshot>, RepositoryError>;
}

/// Outbound hook that hands confirmation codes to the e-mail collaborator.
#[async_trait]
pub trait ConfirmationNotifier: Send + Sync {
    async fn confirmation(
        &self,
        listing: &ListingSnapshot,
        application: &Application,
        app_url: Option<&str>,
    ) -> Result<(), NotificationError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("could not serialize access due to concurrent update")]
    SerializationFailure,
    #[error("unique constraint {constraint} violated")]
    UniqueViolation { constraint: String },
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("stored record could not be decoded: {0}")]
    Decode(String),
}

impl RepositoryError {
    pub fn is_confirmation_code_collision(&self) -> bool {
        matches!(
            self,
            RepositoryError::UniqueViolation { constraint } if constraint == CONFIRMATION_CODE_CONSTRAINT
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("confirmation transport unavailable: {0}")]
    Transport(String),
}

/// Application list filters; `None` means "do not filter".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationFilter {
    pub listing_id: Option<ListingId>,
    pub user_id: Option<UserId>,
    pub marked_as_duplicate: Option<bool>,
    pub search: Option<String>,
}

impl ApplicationFilter {
    pub fn admits(&self, application: &Application) -> bool {
        if application.is_withdrawn() {
            return false;
        }
        if self
            .listing_id
            .is_some_and(|listing| listing != application.listing_id)
        {
            return false;
        }
        if self.user_id.is_some() && self.user_id != application.user_id {
            return false;
        }
        if self
            .marked_as_duplicate
            .is_some_and(|flag| flag != application.marked_as_duplicate)
        {
            return false;
        }
        match self.search_term() {
            Some(term) => searchable_text(application).contains(&term),
            None => true,
        }
    }

    pub fn search_term(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(str::to_lowercase)
    }
}

fn searchable_text(application: &Application) -> String {
    let applicant = &application.applicant;
    [
        applicant.first_name.as_deref(),
        applicant.middle_name.as_deref(),
        applicant.last_name.as_deref(),
        applicant.email_address.as_deref(),
        Some(application.confirmation_code.as_str()),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ")
    .to_lowercase()
}
