use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::confirmation::{ConfirmationCodeGenerator, RandomCodeGenerator};
use super::domain::{
    Application, ApplicationId, ApplicationSubmission, ApplicationSummary, ApplicationUpdate,
    ConfirmationCode, FlaggedSetId, ListingId, ListingSnapshot, RequestContext, UserId,
    ValidationError,
};
use super::flagging::{
    ApplicationFlaggedSet, FlaggedSetStatus, FlaggedSetStore, FlaggingRule, MatchingEngine,
};
use super::repository::{
    ApplicationFilter, ConfirmationNotifier, FlaggingDatabase, FlaggingTransaction,
    ListingDirectory, RepositoryError, CONFIRMATION_CODE_CONSTRAINT,
};
use super::transaction::{TransactionCoordinator, UnitOfWork};
use crate::config::FlaggingConfig;

pub const DEFAULT_PAGE_LIMIT: u32 = 10;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Error raised by the application gateway.
#[derive(Debug, thiserror::Error)]
pub enum ApplicationServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    /// Serialization conflicts outlasted the retry bound.
    #[error("too many concurrent writes, gave up after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("could not allocate a unique confirmation code after {attempts} attempts")]
    ConfirmationCodeExhausted { attempts: u32 },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("flagged set invariant violated: {0}")]
    InvariantViolation(String),
}

impl ApplicationServiceError {
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Entry point for every application write and for flagged-set reads and resolution.
pub struct ApplicationGateway<D, L, N>
where
    D: FlaggingDatabase,
{
    coordinator: TransactionCoordinator<D>,
    listings: Arc<L>,
    notifier: Arc<N>,
    engine: Arc<MatchingEngine>,
    store: FlaggedSetStore,
    codes: Arc<dyn ConfirmationCodeGenerator>,
    code_attempts: u32,
}

impl<D, L, N> ApplicationGateway<D, L, N>
where
    D: FlaggingDatabase + 'static,
    L: ListingDirectory + 'static,
    N: ConfirmationNotifier + 'static,
{
    pub fn new(
        database: Arc<D>,
        listings: Arc<L>,
        notifier: Arc<N>,
        config: &FlaggingConfig,
    ) -> Self {
        let policy = config.retry_policy();
        Self {
            coordinator: TransactionCoordinator::new(database, policy),
            listings,
            notifier,
            engine: Arc::new(MatchingEngine::new(config.rules.clone())),
            store: FlaggedSetStore,
            codes: Arc::new(RandomCodeGenerator),
            code_attempts: policy.max_attempts,
        }
    }

    /// Replaces the random confirmation-code source.
    pub fn with_code_generator(mut self, codes: Arc<dyn ConfirmationCodeGenerator>) -> Self {
        self.codes = codes;
        self
    }

    pub fn rules(&self) -> &[FlaggingRule] {
        self.engine.rules()
    }

    /// Public submission: rejected once the listing's application due date has passed.
    pub async fn submit(
        &self,
        ctx: RequestContext,
        submission: ApplicationSubmission,
    ) -> Result<Application, ApplicationServiceError> {
        submission.validate()?;
        let listing = self.listing(submission.listing_id).await?;
        if !listing.accepts_submission_at(ctx.now) {
            info!(listing_id = %listing.id, "submission rejected after application due date");
            return Err(ValidationError::ListingClosed.into());
        }
        self.write_new(ctx, &listing, &submission).await
    }

    /// Staff or partner entry; skips the due-date check.
    pub async fn create(
        &self,
        ctx: RequestContext,
        submission: ApplicationSubmission,
    ) -> Result<Application, ApplicationServiceError> {
        submission.validate()?;
        let listing = self.listing(submission.listing_id).await?;
        self.write_new(ctx, &listing, &submission).await
    }

    pub async fn update(
        &self,
        ctx: RequestContext,
        application_id: ApplicationId,
        patch: ApplicationUpdate,
    ) -> Result<Application, ApplicationServiceError> {
        patch.validate()?;
        let work = UpdateWork {
            engine: &self.engine,
            store: self.store,
            application_id,
            patch: &patch,
            at: ctx.now,
        };
        let application = self
            .coordinator
            .run_in_serializable_transaction(&work)
            .await?;
        info!(%application_id, marked_as_duplicate = application.marked_as_duplicate, "application updated");
        Ok(application)
    }

    /// Soft delete; the application leaves every open flagged set it belongs to.
    pub async fn withdraw(
        &self,
        ctx: RequestContext,
        application_id: ApplicationId,
    ) -> Result<(), ApplicationServiceError> {
        let work = WithdrawWork {
            engine: &self.engine,
            store: self.store,
            application_id,
            at: ctx.now,
        };
        self.coordinator
            .run_in_serializable_transaction(&work)
            .await?;
        info!(%application_id, acting_user = ?ctx.acting_user, "application withdrawn");
        Ok(())
    }

    pub async fn get(
        &self,
        _ctx: RequestContext,
        application_id: ApplicationId,
    ) -> Result<Application, ApplicationServiceError> {
        self.coordinator
            .run_in_serializable_transaction(&FetchWork { application_id })
            .await
    }

    pub async fn list(
        &self,
        _ctx: RequestContext,
        query: ApplicationListQuery,
    ) -> Result<Paginated<ApplicationListItem>, ApplicationServiceError> {
        let page = PageRequest::new(query.page, query.limit)?;
        self.coordinator
            .run_in_serializable_transaction(&ListWork {
                query: &query,
                page,
            })
            .await
    }

    pub async fn list_flagged_sets(
        &self,
        _ctx: RequestContext,
        query: FlaggedSetQuery,
    ) -> Result<FlaggedSetPage, ApplicationServiceError> {
        let page = PageRequest::new(query.page, query.limit)?;
        self.coordinator
            .run_in_serializable_transaction(&ListSetsWork {
                listing_id: query.listing_id,
                page,
            })
            .await
    }

    pub async fn get_flagged_set(
        &self,
        _ctx: RequestContext,
        set_id: FlaggedSetId,
    ) -> Result<FlaggedSetView, ApplicationServiceError> {
        self.coordinator
            .run_in_serializable_transaction(&FetchSetWork { set_id })
            .await
    }

    /// Staff adjudication of one flagged set.
    pub async fn resolve(
        &self,
        ctx: RequestContext,
        request: ResolveRequest,
    ) -> Result<FlaggedSetView, ApplicationServiceError> {
        let resolving_user_id = request
            .resolving_user_id
            .or(ctx.acting_user)
            .ok_or(ValidationError::MissingField("resolving_user_id"))?;
        let work = ResolveWork {
            store: self.store,
            set_id: request.set_id,
            resolving_user_id,
            keep: &request.keep_application_ids,
            at: ctx.now,
        };
        self.coordinator
            .run_in_serializable_transaction(&work)
            .await
    }

    async fn listing(&self, listing_id: ListingId) -> Result<ListingSnapshot, ApplicationServiceError> {
        self.listings
            .find_listing(listing_id)
            .await?
            .ok_or_else(|| ApplicationServiceError::not_found("listing", listing_id))
    }

    async fn write_new(
        &self,
        ctx: RequestContext,
        listing: &ListingSnapshot,
        submission: &ApplicationSubmission,
    ) -> Result<Application, ApplicationServiceError> {
        let work = CreateWork {
            engine: &self.engine,
            store: self.store,
            codes: self.codes.as_ref(),
            code_attempts: self.code_attempts,
            application_id: ApplicationId::new(),
            submission,
            ctx,
        };
        let application = self
            .coordinator
            .run_in_serializable_transaction(&work)
            .await?;
        info!(
            application_id = %application.id,
            listing_id = %listing.id,
            confirmation_code = %application.confirmation_code,
            marked_as_duplicate = application.marked_as_duplicate,
            "application created"
        );

        self.notify_confirmation(listing, &application, submission.app_url.as_deref())
            .await;
        Ok(application)
    }

    async fn notify_confirmation(
        &self,
        listing: &ListingSnapshot,
        application: &Application,
        app_url: Option<&str>,
    ) {
        if !application.applicant.has_email() {
            debug!(application_id = %application.id, "no applicant email, confirmation skipped");
            return;
        }
        match self.notifier.confirmation(listing, application, app_url).await {
            Ok(()) => {
                info!(application_id = %application.id, "confirmation handed off");
            }
            Err(error) => {
                warn!(application_id = %application.id, %error, "confirmation delivery failed");
            }
        }
    }
}

/// Ordering column for application lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationOrderBy {
    #[default]
    SubmissionDate,
    FirstName,
    LastName,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationListQuery {
    #[serde(default)]
    pub listing_id: Option<ListingId>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub marked_as_duplicate: Option<bool>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub order_by: ApplicationOrderBy,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl ApplicationListQuery {
    fn filter(&self) -> ApplicationFilter {
        ApplicationFilter {
            listing_id: self.listing_id,
            user_id: self.user_id,
            marked_as_duplicate: self.marked_as_duplicate,
            search: self.search.clone(),
        }
    }

    fn sort(&self, applications: &mut [Application]) {
        let order = self.order;
        let directed = move |ordering: Ordering| match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        };
        match self.order_by {
            ApplicationOrderBy::SubmissionDate => applications.sort_by(|a, b| {
                directed(a.submission_date.cmp(&b.submission_date)).then_with(|| a.id.cmp(&b.id))
            }),
            ApplicationOrderBy::FirstName => applications.sort_by(|a, b| {
                compare_missing_last(
                    a.applicant.first_name.as_deref(),
                    b.applicant.first_name.as_deref(),
                    directed,
                )
                .then_with(|| a.submission_date.cmp(&b.submission_date))
            }),
            ApplicationOrderBy::LastName => applications.sort_by(|a, b| {
                compare_missing_last(
                    a.applicant.last_name.as_deref(),
                    b.applicant.last_name.as_deref(),
                    directed,
                )
                .then_with(|| a.submission_date.cmp(&b.submission_date))
            }),
        }
    }
}

fn compare_missing_last(
    left: Option<&str>,
    right: Option<&str>,
    directed: impl Fn(Ordering) -> Ordering,
) -> Ordering {
    let normalize = |value: Option<&str>| {
        value
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_lowercase)
    };
    match (normalize(left), normalize(right)) {
        (Some(left), Some(right)) => directed(left.cmp(&right)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Page position validated against the list bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Result<Self, ValidationError> {
        let page = page.unwrap_or(1);
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if page == 0 {
            return Err(ValidationError::OutOfRange {
                field: "page",
                min: 1,
                max: u32::MAX,
            });
        }
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(ValidationError::OutOfRange {
                field: "limit",
                min: 1,
                max: MAX_PAGE_LIMIT,
            });
        }
        Ok(Self { page, limit })
    }

    fn slice<T>(&self, items: Vec<T>) -> (Vec<T>, PaginationMeta) {
        let total_items = items.len() as u64;
        let limit = u64::from(self.limit);
        let skip = (u64::from(self.page) - 1).saturating_mul(limit);
        let page: Vec<T> = items
            .into_iter()
            .skip(usize::try_from(skip).unwrap_or(usize::MAX))
            .take(self.limit as usize)
            .collect();
        let meta = PaginationMeta {
            current_page: self.page,
            item_count: page.len() as u32,
            items_per_page: self.limit,
            total_items,
            total_pages: total_items.div_ceil(limit),
        };
        (page, meta)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationMeta {
    pub current_page: u32,
    pub item_count: u32,
    pub items_per_page: u32,
    pub total_items: u64,
    pub total_pages: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub meta: PaginationMeta,
}

/// Application row as rendered in list views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationListItem {
    #[serde(flatten)]
    pub application: Application,
    /// Member of an open flagged set or of one staff adjudicated.
    pub flagged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedSetQuery {
    pub listing_id: ListingId,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Flagged set with member summaries, as consumed by the partner grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedSetView {
    pub id: FlaggedSetId,
    pub listing_id: ListingId,
    pub rule: FlaggingRule,
    pub status: FlaggedSetStatus,
    pub applications: Vec<ApplicationSummary>,
    pub resolved_applications: Vec<ApplicationId>,
    pub resolving_user_id: Option<UserId>,
    pub resolved_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedSetMeta {
    #[serde(flatten)]
    pub page: PaginationMeta,
    /// Open sets in the listing, regardless of page.
    pub total_flagged: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedSetPage {
    pub items: Vec<FlaggedSetView>,
    pub meta: FlaggedSetMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub set_id: FlaggedSetId,
    /// Falls back to the acting user of the request.
    #[serde(default)]
    pub resolving_user_id: Option<UserId>,
    #[serde(default)]
    pub keep_application_ids: Vec<ApplicationId>,
}

struct CreateWork<'a> {
    engine: &'a MatchingEngine,
    store: FlaggedSetStore,
    codes: &'a dyn ConfirmationCodeGenerator,
    code_attempts: u32,
    application_id: ApplicationId,
    submission: &'a ApplicationSubmission,
    ctx: RequestContext,
}

#[async_trait]
impl<'a, T: FlaggingTransaction> UnitOfWork<T> for CreateWork<'a> {
    type Output = Application;

    async fn run(&self, tx: &mut T) -> Result<Application, ApplicationServiceError> {
        let listing_id = self.submission.listing_id;
        let confirmation_code =
            unused_confirmation_code(tx, self.codes, listing_id, self.code_attempts).await?;
        let now = self.ctx.now;
        let application = Application {
            id: self.application_id,
            listing_id,
            user_id: self.ctx.acting_user,
            applicant: self.submission.applicant.clone(),
            household_members: self.submission.household_members.clone(),
            submission_date: now,
            confirmation_code,
            marked_as_duplicate: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        tx.insert_application(&application).await?;
        reconcile(self.engine, self.store, tx, &application, now).await
    }
}

struct UpdateWork<'a> {
    engine: &'a MatchingEngine,
    store: FlaggedSetStore,
    application_id: ApplicationId,
    patch: &'a ApplicationUpdate,
    at: DateTime<Utc>,
}

#[async_trait]
impl<'a, T: FlaggingTransaction> UnitOfWork<T> for UpdateWork<'a> {
    type Output = Application;

    async fn run(&self, tx: &mut T) -> Result<Application, ApplicationServiceError> {
        let mut application = active_application(tx, self.application_id).await?;
        self.patch.apply_to(&mut application, self.at);
        tx.update_application(&application).await?;
        reconcile(self.engine, self.store, tx, &application, self.at).await
    }
}

struct WithdrawWork<'a> {
    engine: &'a MatchingEngine,
    store: FlaggedSetStore,
    application_id: ApplicationId,
    at: DateTime<Utc>,
}

#[async_trait]
impl<'a, T: FlaggingTransaction> UnitOfWork<T> for WithdrawWork<'a> {
    type Output = ();

    async fn run(&self, tx: &mut T) -> Result<(), ApplicationServiceError> {
        let mut application = active_application(tx, self.application_id).await?;
        application.deleted_at = Some(self.at);
        application.updated_at = self.at;
        tx.update_application(&application).await?;

        let sets = tx.sets_containing(application.id).await?;
        let plan = self.engine.plan_withdrawal(&application, &sets);
        if !plan.is_empty() {
            let outcome = self.store.apply_plan(tx, &plan, self.at).await?;
            debug!(application_id = %application.id, ?outcome, "withdrawn application left its flagged sets");
        }
        Ok(())
    }
}

struct FetchWork {
    application_id: ApplicationId,
}

#[async_trait]
impl<T: FlaggingTransaction> UnitOfWork<T> for FetchWork {
    type Output = Application;

    async fn run(&self, tx: &mut T) -> Result<Application, ApplicationServiceError> {
        active_application(tx, self.application_id).await
    }
}

struct ListWork<'a> {
    query: &'a ApplicationListQuery,
    page: PageRequest,
}

#[async_trait]
impl<'a, T: FlaggingTransaction> UnitOfWork<T> for ListWork<'a> {
    type Output = Paginated<ApplicationListItem>;

    async fn run(&self, tx: &mut T) -> Result<Self::Output, ApplicationServiceError> {
        let mut applications = tx.search_applications(&self.query.filter()).await?;
        self.query.sort(&mut applications);
        let (page, meta) = self.page.slice(applications);

        let mut items = Vec::with_capacity(page.len());
        for application in page {
            let flagged = tx
                .sets_containing(application.id)
                .await?
                .iter()
                .any(|set| set.is_open() || set.is_adjudicated());
            items.push(ApplicationListItem {
                application,
                flagged,
            });
        }
        Ok(Paginated { items, meta })
    }
}

struct ListSetsWork {
    listing_id: ListingId,
    page: PageRequest,
}

#[async_trait]
impl<T: FlaggingTransaction> UnitOfWork<T> for ListSetsWork {
    type Output = FlaggedSetPage;

    async fn run(&self, tx: &mut T) -> Result<FlaggedSetPage, ApplicationServiceError> {
        let mut sets = tx.listing_sets(self.listing_id).await?;
        sets.sort_by_key(|set| (!set.is_open(), set.created_at, set.id));
        let total_flagged = sets.iter().filter(|set| set.is_open()).count() as u64;
        let (page, meta) = self.page.slice(sets);

        let mut items = Vec::with_capacity(page.len());
        for set in page {
            items.push(set_view(tx, set).await?);
        }
        Ok(FlaggedSetPage {
            items,
            meta: FlaggedSetMeta {
                page: meta,
                total_flagged,
            },
        })
    }
}

struct FetchSetWork {
    set_id: FlaggedSetId,
}

#[async_trait]
impl<T: FlaggingTransaction> UnitOfWork<T> for FetchSetWork {
    type Output = FlaggedSetView;

    async fn run(&self, tx: &mut T) -> Result<FlaggedSetView, ApplicationServiceError> {
        let set = tx.fetch_set(self.set_id).await?.ok_or_else(|| {
            ApplicationServiceError::not_found("application flagged set", self.set_id)
        })?;
        set_view(tx, set).await
    }
}

struct ResolveWork<'a> {
    store: FlaggedSetStore,
    set_id: FlaggedSetId,
    resolving_user_id: UserId,
    keep: &'a [ApplicationId],
    at: DateTime<Utc>,
}

#[async_trait]
impl<'a, T: FlaggingTransaction> UnitOfWork<T> for ResolveWork<'a> {
    type Output = FlaggedSetView;

    async fn run(&self, tx: &mut T) -> Result<FlaggedSetView, ApplicationServiceError> {
        let set = self
            .store
            .resolve(tx, self.set_id, self.resolving_user_id, self.keep, self.at)
            .await?;
        set_view(tx, set).await
    }
}

/// Plans and applies set mutations for a freshly written application, then re-reads it so
/// `marked_as_duplicate` reflects final membership.
async fn reconcile<T: FlaggingTransaction>(
    engine: &MatchingEngine,
    store: FlaggedSetStore,
    tx: &mut T,
    application: &Application,
    at: DateTime<Utc>,
) -> Result<Application, ApplicationServiceError> {
    let plan = engine.on_application_write(tx, application).await?;
    if !plan.is_empty() {
        let outcome = store.apply_plan(tx, &plan, at).await?;
        debug!(application_id = %application.id, mutations = plan.len(), ?outcome, "flagged sets reconciled");
    }
    tx.fetch_application(application.id)
        .await?
        .ok_or_else(|| ApplicationServiceError::not_found("application", application.id))
}

async fn active_application<T: FlaggingTransaction>(
    tx: &mut T,
    application_id: ApplicationId,
) -> Result<Application, ApplicationServiceError> {
    tx.fetch_application(application_id)
        .await?
        .filter(|application| !application.is_withdrawn())
        .ok_or_else(|| ApplicationServiceError::not_found("application", application_id))
}

/// Draws codes until one is unused in the listing. Exhaustion surfaces as the same unique
/// violation the storage constraint raises, so the coordinator retries it.
async fn unused_confirmation_code<T: FlaggingTransaction>(
    tx: &mut T,
    codes: &dyn ConfirmationCodeGenerator,
    listing_id: ListingId,
    attempts: u32,
) -> Result<ConfirmationCode, ApplicationServiceError> {
    for _ in 0..attempts.max(1) {
        let code = codes.generate();
        if !tx.confirmation_code_exists(listing_id, &code).await? {
            return Ok(code);
        }
        debug!(%listing_id, "confirmation code already taken, drawing another");
    }
    Err(RepositoryError::UniqueViolation {
        constraint: CONFIRMATION_CODE_CONSTRAINT.to_string(),
    }
    .into())
}

async fn set_view<T: FlaggingTransaction>(
    tx: &mut T,
    set: ApplicationFlaggedSet,
) -> Result<FlaggedSetView, ApplicationServiceError> {
    let mut applications = Vec::with_capacity(set.applications.len());
    for member in &set.applications {
        let application = tx.fetch_application(*member).await?.ok_or_else(|| {
            ApplicationServiceError::InvariantViolation(format!(
                "set {} references missing application {member}",
                set.id
            ))
        })?;
        applications.push(application.summary());
    }
    Ok(FlaggedSetView {
        id: set.id,
        listing_id: set.listing_id,
        rule: set.rule,
        status: set.status,
        applications,
        resolved_applications: set.resolved_applications,
        resolving_user_id: set.resolving_user_id,
        resolved_time: set.resolved_time,
        created_at: set.created_at,
        updated_at: set.updated_at,
    })
}
