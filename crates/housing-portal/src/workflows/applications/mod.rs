//! Application intake for listing pools, with duplicate flagging under serializable
//! transactions.
//!
//! Every write (submit, create, update, withdraw, resolve) runs as one unit of work through the
//! [`TransactionCoordinator`], which retries serialization conflicts and confirmation-code
//! collisions with bounded backoff.

pub mod confirmation;
pub mod domain;
pub mod flagging;
pub mod memory;
pub mod postgres;
pub mod repository;
pub mod router;
pub mod service;
pub mod transaction;

#[cfg(test)]
mod tests;

pub use confirmation::{ConfirmationCodeGenerator, RandomCodeGenerator};
pub use domain::{
    Address, Applicant, Application, ApplicationId, ApplicationSubmission, ApplicationSummary,
    ApplicationUpdate, ConfirmationCode, FlaggedSetId, HouseholdMember, ListingId,
    ListingSnapshot, RequestContext, UserId, ValidationError,
};
pub use flagging::{
    ApplicationFlaggedSet, FlaggedSetStatus, FlaggedSetStore, FlaggingRule, MatchingEngine,
    SetMutation, SetMutationPlan,
};
pub use memory::{ConfirmationEvent, MemoryDatabase, MemoryListingDirectory, RecordingNotifier};
pub use postgres::{PgFlaggingDatabase, PgListingDirectory};
pub use repository::{
    ApplicationFilter, ConfirmationNotifier, FlaggingDatabase, FlaggingTransaction,
    ListingDirectory, NotificationError, RepositoryError,
};
pub use router::application_router;
pub use service::{
    ApplicationGateway, ApplicationListItem, ApplicationListQuery, ApplicationOrderBy,
    ApplicationServiceError, FlaggedSetPage, FlaggedSetQuery, FlaggedSetView, Paginated,
    PaginationMeta, ResolveRequest, SortOrder,
};
pub use transaction::{RetryPolicy, TransactionCoordinator, UnitOfWork};
