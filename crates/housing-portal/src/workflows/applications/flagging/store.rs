use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::super::domain::{ApplicationId, FlaggedSetId, ListingId, UserId, ValidationError};
use super::super::repository::FlaggingTransaction;
use super::super::service::ApplicationServiceError;
use super::matching::{SetMutation, SetMutationPlan};
use super::rules::FlaggingRule;
use super::sets::{ApplicationFlaggedSet, FlaggedSetStatus};

/// Result of removing one member from a set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalOutcome {
    Shrunk(ApplicationFlaggedSet),
    /// The set fell below two unresolved members and was closed.
    Dissolved(ApplicationFlaggedSet),
}

impl RemovalOutcome {
    pub fn set(&self) -> &ApplicationFlaggedSet {
        match self {
            RemovalOutcome::Shrunk(set) | RemovalOutcome::Dissolved(set) => set,
        }
    }
}

/// What applying a plan actually changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanOutcome {
    pub created: Vec<FlaggedSetId>,
    pub merged: Vec<FlaggedSetId>,
    pub extended: Vec<FlaggedSetId>,
    pub shrunk: Vec<FlaggedSetId>,
    pub dissolved: Vec<FlaggedSetId>,
}

/// Owns flagged-set rows and both membership relations.
///
/// Every operation either leaves the set invariants intact or fails; callers run them inside a
/// serializable transaction so a failure discards partial writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlaggedSetStore;

impl FlaggedSetStore {
    pub async fn create_set<T: FlaggingTransaction>(
        &self,
        tx: &mut T,
        rule: FlaggingRule,
        listing_id: ListingId,
        members: &[ApplicationId],
        at: DateTime<Utc>,
    ) -> Result<ApplicationFlaggedSet, ApplicationServiceError> {
        let set = ApplicationFlaggedSet::open(listing_id, rule, members.to_vec(), at);
        if set.applications.len() < 2 {
            return Err(ApplicationServiceError::InvariantViolation(format!(
                "a {rule} set needs at least two distinct members"
            )));
        }

        for member in &set.applications {
            self.ensure_member_eligible(tx, listing_id, rule, *member, None)
                .await?;
        }

        set.check_invariants()
            .map_err(ApplicationServiceError::InvariantViolation)?;
        tx.insert_set(&set).await?;
        for member in &set.applications {
            tx.set_duplicate_flag(*member, true).await?;
        }

        info!(set_id = %set.id, %listing_id, rule = %rule, members = set.applications.len(), "flagged set created");
        Ok(set)
    }

    /// Folds every set into the oldest one (earliest `created_at`, then smallest id).
    pub async fn merge_sets<T: FlaggingTransaction>(
        &self,
        tx: &mut T,
        set_ids: &[FlaggedSetId],
        at: DateTime<Utc>,
    ) -> Result<ApplicationFlaggedSet, ApplicationServiceError> {
        let mut sets = Vec::with_capacity(set_ids.len());
        for id in set_ids {
            if sets.iter().any(|set: &ApplicationFlaggedSet| set.id == *id) {
                continue;
            }
            sets.push(self.load_set(tx, *id).await?);
        }

        let Some(first) = sets.first() else {
            return Err(ApplicationServiceError::InvariantViolation(
                "merge requires at least one set".to_string(),
            ));
        };
        let (listing_id, rule) = (first.listing_id, first.rule);
        if let Some(odd) = sets
            .iter()
            .find(|set| !set.is_open() || set.listing_id != listing_id || set.rule != rule)
        {
            return Err(ApplicationServiceError::InvariantViolation(format!(
                "set {} cannot be merged: only open sets of one listing and rule merge",
                odd.id
            )));
        }

        sets.sort_by_key(|set| (set.created_at, set.id));
        let mut sets = sets.into_iter();
        let Some(mut survivor) = sets.next() else {
            return Err(ApplicationServiceError::InvariantViolation(
                "merge requires at least one set".to_string(),
            ));
        };

        let mut absorbed = Vec::new();
        for other in sets {
            for member in &other.applications {
                survivor.insert_member(*member);
            }
            for resolved in &other.resolved_applications {
                if !survivor.is_resolved_member(*resolved) {
                    survivor.resolved_applications.push(*resolved);
                }
            }
            tx.delete_set(other.id).await?;
            absorbed.push(other.id);
        }

        if absorbed.is_empty() {
            return Ok(survivor);
        }

        survivor.updated_at = at;
        survivor
            .check_invariants()
            .map_err(ApplicationServiceError::InvariantViolation)?;
        tx.update_set(&survivor).await?;

        info!(set_id = %survivor.id, absorbed = ?absorbed, members = survivor.applications.len(), "flagged sets merged");
        Ok(survivor)
    }

    pub async fn add_member<T: FlaggingTransaction>(
        &self,
        tx: &mut T,
        set_id: FlaggedSetId,
        application_id: ApplicationId,
        at: DateTime<Utc>,
    ) -> Result<ApplicationFlaggedSet, ApplicationServiceError> {
        let mut set = self.load_set(tx, set_id).await?;
        if !set.is_open() {
            return Err(ApplicationServiceError::InvariantViolation(format!(
                "cannot extend resolved set {set_id}"
            )));
        }
        if set.contains(application_id) {
            return Ok(set);
        }

        self.ensure_member_eligible(tx, set.listing_id, set.rule, application_id, Some(set_id))
            .await?;

        set.insert_member(application_id);
        set.updated_at = at;
        tx.update_set(&set).await?;
        tx.set_duplicate_flag(application_id, true).await?;

        info!(%set_id, %application_id, members = set.applications.len(), "flagged set extended");
        Ok(set)
    }

    /// Removes the member and dissolves the set once fewer than two unresolved members remain.
    pub async fn remove_member<T: FlaggingTransaction>(
        &self,
        tx: &mut T,
        set_id: FlaggedSetId,
        application_id: ApplicationId,
        at: DateTime<Utc>,
    ) -> Result<RemovalOutcome, ApplicationServiceError> {
        let mut set = self.load_set(tx, set_id).await?;
        if !set.remove_member(application_id) {
            return Err(ApplicationServiceError::InvariantViolation(format!(
                "application {application_id} is not a member of set {set_id}"
            )));
        }
        set.updated_at = at;

        let dissolved = set.is_open() && set.unresolved_count() < 2;
        if dissolved {
            set.status = FlaggedSetStatus::Resolved;
            set.resolved_time = Some(at);
            set.resolved_applications.clear();
        }

        set.check_invariants()
            .map_err(ApplicationServiceError::InvariantViolation)?;
        tx.update_set(&set).await?;

        let mut touched = vec![application_id];
        if dissolved {
            touched.extend(set.applications.iter().copied());
        }
        self.refresh_duplicate_flags(tx, &touched).await?;

        if dissolved {
            info!(%set_id, %application_id, "flagged set dissolved");
            Ok(RemovalOutcome::Dissolved(set))
        } else {
            info!(%set_id, %application_id, members = set.applications.len(), "flagged set shrunk");
            Ok(RemovalOutcome::Shrunk(set))
        }
    }

    /// Staff adjudication: `keep` are the members confirmed as duplicates.
    pub async fn resolve<T: FlaggingTransaction>(
        &self,
        tx: &mut T,
        set_id: FlaggedSetId,
        resolving_user_id: UserId,
        keep: &[ApplicationId],
        at: DateTime<Utc>,
    ) -> Result<ApplicationFlaggedSet, ApplicationServiceError> {
        let mut set = self.load_set(tx, set_id).await?;
        if let Some(outsider) = keep.iter().find(|id| !set.contains(**id)) {
            return Err(ValidationError::ResolutionOutsideSet(*outsider).into());
        }

        set.resolved_applications = set
            .applications
            .iter()
            .copied()
            .filter(|member| keep.contains(member))
            .collect();
        set.status = FlaggedSetStatus::Resolved;
        set.resolving_user_id = Some(resolving_user_id);
        set.resolved_time = Some(at);
        set.updated_at = at;

        set.check_invariants()
            .map_err(ApplicationServiceError::InvariantViolation)?;
        tx.update_set(&set).await?;
        let members = set.applications.clone();
        self.refresh_duplicate_flags(tx, &members).await?;

        info!(%set_id, %resolving_user_id, kept = set.resolved_applications.len(), "flagged set resolved");
        Ok(set)
    }

    /// Applies the mutations in plan order.
    pub async fn apply_plan<T: FlaggingTransaction>(
        &self,
        tx: &mut T,
        plan: &SetMutationPlan,
        at: DateTime<Utc>,
    ) -> Result<PlanOutcome, ApplicationServiceError> {
        let mut outcome = PlanOutcome::default();
        for mutation in plan.iter() {
            match mutation {
                SetMutation::Create { rule, members } => {
                    let set = self
                        .create_set(tx, *rule, plan.listing_id, members, at)
                        .await?;
                    outcome.created.push(set.id);
                }
                SetMutation::Merge {
                    survivor, absorbed, ..
                } => {
                    let mut ids = vec![*survivor];
                    ids.extend(absorbed.iter().copied());
                    let merged = self.merge_sets(tx, &ids, at).await?;
                    if merged.id != *survivor {
                        return Err(ApplicationServiceError::InvariantViolation(format!(
                            "merge kept {} instead of planned survivor {}",
                            merged.id, survivor
                        )));
                    }
                    outcome.merged.push(merged.id);
                }
                SetMutation::AddMember {
                    set_id,
                    application_id,
                } => {
                    self.add_member(tx, *set_id, *application_id, at).await?;
                    if !outcome.extended.contains(set_id) {
                        outcome.extended.push(*set_id);
                    }
                }
                SetMutation::RemoveMember {
                    set_id,
                    application_id,
                } => match self.remove_member(tx, *set_id, *application_id, at).await? {
                    RemovalOutcome::Shrunk(_) => outcome.shrunk.push(*set_id),
                    RemovalOutcome::Dissolved(_) => {
                        return Err(ApplicationServiceError::InvariantViolation(format!(
                            "set {set_id} dissolved on a removal planned to keep it open"
                        )))
                    }
                },
                SetMutation::Dissolve {
                    set_id,
                    application_id,
                } => match self.remove_member(tx, *set_id, *application_id, at).await? {
                    RemovalOutcome::Dissolved(_) => outcome.dissolved.push(*set_id),
                    RemovalOutcome::Shrunk(_) => {
                        return Err(ApplicationServiceError::InvariantViolation(format!(
                            "set {set_id} stayed open after a planned dissolution"
                        )))
                    }
                },
            }
        }
        Ok(outcome)
    }

    /// Recomputes `marked_as_duplicate` from current set membership.
    pub async fn refresh_duplicate_flags<T: FlaggingTransaction>(
        &self,
        tx: &mut T,
        application_ids: &[ApplicationId],
    ) -> Result<(), ApplicationServiceError> {
        for id in application_ids {
            let flagged = tx
                .sets_containing(*id)
                .await?
                .iter()
                .any(|set| set.flags(*id));
            tx.set_duplicate_flag(*id, flagged).await?;
        }
        Ok(())
    }

    async fn load_set<T: FlaggingTransaction>(
        &self,
        tx: &mut T,
        set_id: FlaggedSetId,
    ) -> Result<ApplicationFlaggedSet, ApplicationServiceError> {
        tx.fetch_set(set_id)
            .await?
            .ok_or_else(|| ApplicationServiceError::not_found("application flagged set", set_id))
    }

    async fn ensure_member_eligible<T: FlaggingTransaction>(
        &self,
        tx: &mut T,
        listing_id: ListingId,
        rule: FlaggingRule,
        application_id: ApplicationId,
        joining: Option<FlaggedSetId>,
    ) -> Result<(), ApplicationServiceError> {
        let application = tx.fetch_application(application_id).await?.ok_or_else(|| {
            ApplicationServiceError::InvariantViolation(format!(
                "flagged set member {application_id} does not exist"
            ))
        })?;
        if application.listing_id != listing_id || application.is_withdrawn() {
            return Err(ApplicationServiceError::InvariantViolation(format!(
                "application {application_id} is not an active member of listing {listing_id}"
            )));
        }

        let holding = tx
            .open_sets(listing_id, rule)
            .await?
            .into_iter()
            .find(|set| Some(set.id) != joining && set.contains(application_id));
        if let Some(holding) = holding {
            return Err(ApplicationServiceError::InvariantViolation(format!(
                "application {application_id} already belongs to open {rule} set {}",
                holding.id
            )));
        }
        Ok(())
    }
}
