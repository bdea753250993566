//! In-process storage backend.
//!
//! Transactions work on a private snapshot and validate on commit: a writer whose touched
//! listings changed since it began is rejected with a serialization failure, which gives the
//! same observable behavior as SERIALIZABLE isolation for the flagging workflow.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::domain::{
    Application, ApplicationId, ConfirmationCode, FlaggedSetId, ListingId, ListingSnapshot,
};
use super::flagging::{ApplicationFlaggedSet, FlaggingRule};
use super::repository::{
    ApplicationFilter, ConfirmationNotifier, FlaggingDatabase, FlaggingTransaction,
    ListingDirectory, NotificationError, RepositoryError, CONFIRMATION_CODE_CONSTRAINT,
};

const PRIMARY_KEY_CONSTRAINT: &str = "applications_pkey";

#[derive(Debug, Default)]
struct MemoryState {
    applications: BTreeMap<ApplicationId, Application>,
    sets: BTreeMap<FlaggedSetId, ApplicationFlaggedSet>,
    listing_versions: HashMap<ListingId, u64>,
    commit_failures: VecDeque<RepositoryError>,
    begun: u64,
    committed: u64,
}

impl MemoryState {
    fn version(&self, listing_id: &ListingId) -> u64 {
        self.listing_versions.get(listing_id).copied().unwrap_or(0)
    }
}

/// Shared in-memory database; clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, RepositoryError> {
        lock_state(&self.state)
    }

    /// The next `count` commits fail with `error` and discard their writes.
    pub fn inject_commit_failures(
        &self,
        count: usize,
        error: RepositoryError,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        state
            .commit_failures
            .extend(std::iter::repeat(error).take(count));
        Ok(())
    }

    pub fn transactions_begun(&self) -> Result<u64, RepositoryError> {
        Ok(self.lock()?.begun)
    }

    pub fn transactions_committed(&self) -> Result<u64, RepositoryError> {
        Ok(self.lock()?.committed)
    }

    /// Committed state of every set, oldest first.
    pub fn sets(&self) -> Result<Vec<ApplicationFlaggedSet>, RepositoryError> {
        let state = self.lock()?;
        let mut sets: Vec<_> = state.sets.values().cloned().collect();
        sets.sort_by_key(|set| (set.created_at, set.id));
        Ok(sets)
    }

    pub fn application(&self, id: ApplicationId) -> Result<Option<Application>, RepositoryError> {
        Ok(self.lock()?.applications.get(&id).cloned())
    }
}

#[async_trait]
impl FlaggingDatabase for MemoryDatabase {
    type Transaction = MemoryTransaction;

    async fn begin_serializable(&self) -> Result<MemoryTransaction, RepositoryError> {
        let mut state = self.lock()?;
        state.begun += 1;
        Ok(MemoryTransaction {
            state: Arc::clone(&self.state),
            applications: state.applications.clone(),
            sets: state.sets.clone(),
            versions_at_begin: state.listing_versions.clone(),
            touched: HashSet::new(),
            written: HashSet::new(),
        })
    }
}

/// Snapshot-backed transaction over [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    applications: BTreeMap<ApplicationId, Application>,
    sets: BTreeMap<FlaggedSetId, ApplicationFlaggedSet>,
    versions_at_begin: HashMap<ListingId, u64>,
    touched: HashSet<ListingId>,
    written: HashSet<ListingId>,
}

impl MemoryTransaction {
    fn write(&mut self, listing_id: ListingId) {
        self.touched.insert(listing_id);
        self.written.insert(listing_id);
    }

    fn sorted_sets<'a>(
        sets: impl Iterator<Item = &'a ApplicationFlaggedSet>,
    ) -> Vec<ApplicationFlaggedSet> {
        let mut sets: Vec<_> = sets.cloned().collect();
        sets.sort_by_key(|set| (set.created_at, set.id));
        sets
    }
}

#[async_trait]
impl FlaggingTransaction for MemoryTransaction {
    async fn fetch_application(
        &mut self,
        id: ApplicationId,
    ) -> Result<Option<Application>, RepositoryError> {
        let found = self.applications.get(&id).cloned();
        if let Some(application) = &found {
            self.touched.insert(application.listing_id);
        }
        Ok(found)
    }

    async fn listing_applications(
        &mut self,
        listing_id: ListingId,
    ) -> Result<Vec<Application>, RepositoryError> {
        self.touched.insert(listing_id);
        let mut pool: Vec<_> = self
            .applications
            .values()
            .filter(|app| app.listing_id == listing_id && !app.is_withdrawn())
            .cloned()
            .collect();
        pool.sort_by_key(|app| (app.submission_date, app.id));
        Ok(pool)
    }

    async fn search_applications(
        &mut self,
        filter: &ApplicationFilter,
    ) -> Result<Vec<Application>, RepositoryError> {
        let found: Vec<_> = self
            .applications
            .values()
            .filter(|app| filter.admits(app))
            .cloned()
            .collect();
        self.touched.extend(filter.listing_id);
        self.touched.extend(found.iter().map(|app| app.listing_id));
        Ok(found)
    }

    async fn confirmation_code_exists(
        &mut self,
        listing_id: ListingId,
        code: &ConfirmationCode,
    ) -> Result<bool, RepositoryError> {
        self.touched.insert(listing_id);
        Ok(self
            .applications
            .values()
            .any(|app| app.listing_id == listing_id && app.confirmation_code == *code))
    }

    async fn insert_application(
        &mut self,
        application: &Application,
    ) -> Result<(), RepositoryError> {
        if self.applications.contains_key(&application.id) {
            return Err(RepositoryError::UniqueViolation {
                constraint: PRIMARY_KEY_CONSTRAINT.to_string(),
            });
        }
        if self.applications.values().any(|app| {
            app.listing_id == application.listing_id
                && app.confirmation_code == application.confirmation_code
        }) {
            return Err(RepositoryError::UniqueViolation {
                constraint: CONFIRMATION_CODE_CONSTRAINT.to_string(),
            });
        }
        self.write(application.listing_id);
        self.applications.insert(application.id, application.clone());
        Ok(())
    }

    async fn update_application(
        &mut self,
        application: &Application,
    ) -> Result<(), RepositoryError> {
        let stored = self
            .applications
            .get_mut(&application.id)
            .ok_or(RepositoryError::NotFound)?;
        let listing_id = stored.listing_id;
        *stored = application.clone();
        self.write(listing_id);
        self.write(application.listing_id);
        Ok(())
    }

    async fn set_duplicate_flag(
        &mut self,
        id: ApplicationId,
        marked_as_duplicate: bool,
    ) -> Result<(), RepositoryError> {
        let stored = self
            .applications
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.marked_as_duplicate == marked_as_duplicate {
            let listing_id = stored.listing_id;
            self.touched.insert(listing_id);
            return Ok(());
        }
        stored.marked_as_duplicate = marked_as_duplicate;
        let listing_id = stored.listing_id;
        self.write(listing_id);
        Ok(())
    }

    async fn fetch_set(
        &mut self,
        id: FlaggedSetId,
    ) -> Result<Option<ApplicationFlaggedSet>, RepositoryError> {
        let found = self.sets.get(&id).cloned();
        if let Some(set) = &found {
            self.touched.insert(set.listing_id);
        }
        Ok(found)
    }

    async fn listing_sets(
        &mut self,
        listing_id: ListingId,
    ) -> Result<Vec<ApplicationFlaggedSet>, RepositoryError> {
        self.touched.insert(listing_id);
        Ok(Self::sorted_sets(
            self.sets.values().filter(|set| set.listing_id == listing_id),
        ))
    }

    async fn open_sets(
        &mut self,
        listing_id: ListingId,
        rule: FlaggingRule,
    ) -> Result<Vec<ApplicationFlaggedSet>, RepositoryError> {
        self.touched.insert(listing_id);
        Ok(Self::sorted_sets(self.sets.values().filter(|set| {
            set.listing_id == listing_id && set.rule == rule && set.is_open()
        })))
    }

    async fn sets_containing(
        &mut self,
        application_id: ApplicationId,
    ) -> Result<Vec<ApplicationFlaggedSet>, RepositoryError> {
        let found = Self::sorted_sets(
            self.sets
                .values()
                .filter(|set| set.contains(application_id)),
        );
        self.touched.extend(found.iter().map(|set| set.listing_id));
        Ok(found)
    }

    async fn insert_set(&mut self, set: &ApplicationFlaggedSet) -> Result<(), RepositoryError> {
        if self.sets.contains_key(&set.id) {
            return Err(RepositoryError::UniqueViolation {
                constraint: "application_flagged_sets_pkey".to_string(),
            });
        }
        self.write(set.listing_id);
        self.sets.insert(set.id, set.clone());
        Ok(())
    }

    async fn update_set(&mut self, set: &ApplicationFlaggedSet) -> Result<(), RepositoryError> {
        let stored = self.sets.get_mut(&set.id).ok_or(RepositoryError::NotFound)?;
        *stored = set.clone();
        self.write(set.listing_id);
        Ok(())
    }

    async fn delete_set(&mut self, id: FlaggedSetId) -> Result<(), RepositoryError> {
        let removed = self.sets.remove(&id).ok_or(RepositoryError::NotFound)?;
        self.write(removed.listing_id);
        Ok(())
    }

    async fn commit(self) -> Result<(), RepositoryError> {
        let mut state = lock_state(&self.state)?;
        if let Some(error) = state.commit_failures.pop_front() {
            debug!(%error, "injected commit failure");
            return Err(error);
        }
        if self.written.is_empty() {
            state.committed += 1;
            return Ok(());
        }

        let baseline = |listing_id: &ListingId| {
            self.versions_at_begin
                .get(listing_id)
                .copied()
                .unwrap_or(0)
        };
        if let Some(conflict) = self
            .touched
            .iter()
            .find(|listing_id| state.version(listing_id) != baseline(listing_id))
        {
            debug!(listing_id = %conflict, "commit rejected: listing changed since snapshot");
            return Err(RepositoryError::SerializationFailure);
        }

        let written = &self.written;
        state
            .applications
            .retain(|_, app| !written.contains(&app.listing_id));
        state
            .sets
            .retain(|_, set| !written.contains(&set.listing_id));
        for (id, application) in self.applications {
            if written.contains(&application.listing_id) {
                state.applications.insert(id, application);
            }
        }
        for (id, set) in self.sets {
            if written.contains(&set.listing_id) {
                state.sets.insert(id, set);
            }
        }
        for listing_id in written {
            *state.listing_versions.entry(*listing_id).or_insert(0) += 1;
        }
        state.committed += 1;
        Ok(())
    }

    async fn rollback(self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> Result<MutexGuard<'_, MemoryState>, RepositoryError> {
    state
        .lock()
        .map_err(|_| RepositoryError::Unavailable("memory store lock poisoned".to_string()))
}

/// Listing lookup backed by a map.
#[derive(Debug, Default)]
pub struct MemoryListingDirectory {
    listings: HashMap<ListingId, ListingSnapshot>,
}

impl MemoryListingDirectory {
    pub fn with_listings(listings: impl IntoIterator<Item = ListingSnapshot>) -> Self {
        Self {
            listings: listings
                .into_iter()
                .map(|listing| (listing.id, listing))
                .collect(),
        }
    }
}

#[async_trait]
impl ListingDirectory for MemoryListingDirectory {
    async fn find_listing(
        &self,
        id: ListingId,
    ) -> Result<Option<ListingSnapshot>, RepositoryError> {
        Ok(self.listings.get(&id).cloned())
    }
}

/// Confirmation hand-off captured for assertions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationEvent {
    pub listing_id: ListingId,
    pub application_id: ApplicationId,
    pub confirmation_code: ConfirmationCode,
    pub email_address: Option<String>,
    pub app_url: Option<String>,
}

/// Notifier that records every confirmation instead of sending it.
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<ConfirmationEvent>>>,
    failing: bool,
}

impl RecordingNotifier {
    /// Records nothing and reports a transport failure on every call.
    pub fn failing() -> Self {
        Self {
            events: Arc::default(),
            failing: true,
        }
    }

    pub fn events(&self) -> Vec<ConfirmationEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConfirmationNotifier for RecordingNotifier {
    async fn confirmation(
        &self,
        listing: &ListingSnapshot,
        application: &Application,
        app_url: Option<&str>,
    ) -> Result<(), NotificationError> {
        if self.failing {
            return Err(NotificationError::Transport("mailer offline".to_string()));
        }
        let mut events = self
            .events
            .lock()
            .map_err(|_| NotificationError::Transport("recorder lock poisoned".to_string()))?;
        events.push(ConfirmationEvent {
            listing_id: listing.id,
            application_id: application.id,
            confirmation_code: application.confirmation_code.clone(),
            email_address: application.applicant.email_address.clone(),
            app_url: app_url.map(str::to_string),
        });
        Ok(())
    }
}
