use serde::Serialize;
use tracing::debug;

use super::super::domain::{Application, ApplicationId, FlaggedSetId, ListingId};
use super::super::repository::{FlaggingTransaction, RepositoryError};
use super::rules::FlaggingRule;
use super::sets::ApplicationFlaggedSet;

/// One concrete change to a listing's flagged sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SetMutation {
    Create {
        rule: FlaggingRule,
        members: Vec<ApplicationId>,
    },
    Merge {
        rule: FlaggingRule,
        survivor: FlaggedSetId,
        absorbed: Vec<FlaggedSetId>,
    },
    AddMember {
        set_id: FlaggedSetId,
        application_id: ApplicationId,
    },
    RemoveMember {
        set_id: FlaggedSetId,
        application_id: ApplicationId,
    },
    /// Removal that leaves fewer than two unresolved members and so closes the set.
    Dissolve {
        set_id: FlaggedSetId,
        application_id: ApplicationId,
    },
}

/// Ordered mutations produced for a single application write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetMutationPlan {
    pub application_id: ApplicationId,
    pub listing_id: ListingId,
    pub mutations: Vec<SetMutation>,
}

impl SetMutationPlan {
    fn new(application_id: ApplicationId, listing_id: ListingId) -> Self {
        Self {
            application_id,
            listing_id,
            mutations: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SetMutation> {
        self.mutations.iter()
    }
}

/// Decides how the flagged sets of a listing must change after an application write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingEngine {
    rules: Vec<FlaggingRule>,
}

impl Default for MatchingEngine {
    fn default() -> Self {
        Self::new(FlaggingRule::ALL.to_vec())
    }
}

impl MatchingEngine {
    pub fn new(rules: Vec<FlaggingRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[FlaggingRule] {
        &self.rules
    }

    /// Loads the listing pool, its open sets and the adjudicated sets holding the
    /// application through `tx`, then plans.
    ///
    /// Never retries; storage errors surface to the transaction coordinator.
    pub async fn on_application_write<T: FlaggingTransaction>(
        &self,
        tx: &mut T,
        application: &Application,
    ) -> Result<SetMutationPlan, RepositoryError> {
        let pool = tx.listing_applications(application.listing_id).await?;
        let mut sets = Vec::new();
        for rule in &self.rules {
            sets.extend(tx.open_sets(application.listing_id, *rule).await?);
        }
        sets.extend(
            tx.sets_containing(application.id)
                .await?
                .into_iter()
                .filter(ApplicationFlaggedSet::is_adjudicated),
        );
        Ok(self.plan(application, &pool, &sets))
    }

    /// Pure planning step over an already loaded pool and set list.
    ///
    /// Pairs staff already adjudicated under a rule are not matched again under it.
    pub fn plan(
        &self,
        application: &Application,
        pool: &[Application],
        sets: &[ApplicationFlaggedSet],
    ) -> SetMutationPlan {
        let mut plan = SetMutationPlan::new(application.id, application.listing_id);

        for rule in &self.rules {
            let mut open: Vec<&ApplicationFlaggedSet> = sets
                .iter()
                .filter(|set| {
                    set.is_open() && set.rule == *rule && set.listing_id == application.listing_id
                })
                .collect();
            open.sort_by_key(|set| (set.created_at, set.id));

            let matched: Vec<ApplicationId> = if application.is_withdrawn() {
                Vec::new()
            } else {
                pool.iter()
                    .filter(|other| {
                        other.id != application.id
                            && other.listing_id == application.listing_id
                            && !other.is_withdrawn()
                            && rule.matches(application, other)
                            && !sets.iter().any(|set| {
                                set.rule == *rule && set.adjudicates(application.id, other.id)
                            })
                    })
                    .map(|other| other.id)
                    .collect()
            };

            let intersecting: Vec<&ApplicationFlaggedSet> = open
                .iter()
                .copied()
                .filter(|set| set.applications.iter().any(|member| matched.contains(member)))
                .collect();

            for stale in open
                .iter()
                .filter(|set| set.contains(application.id))
                .filter(|set| !intersecting.iter().any(|kept| kept.id == set.id))
            {
                plan.mutations.push(removal(stale, application.id));
            }

            if matched.is_empty() {
                continue;
            }

            match intersecting.split_first() {
                None => {
                    let mut members = matched.clone();
                    members.push(application.id);
                    debug!(rule = %rule, members = members.len(), "planning new flagged set");
                    plan.mutations.push(SetMutation::Create {
                        rule: *rule,
                        members,
                    });
                }
                Some((survivor, absorbed)) => {
                    if !absorbed.is_empty() {
                        plan.mutations.push(SetMutation::Merge {
                            rule: *rule,
                            survivor: survivor.id,
                            absorbed: absorbed.iter().map(|set| set.id).collect(),
                        });
                    }

                    let already_members: Vec<ApplicationId> = intersecting
                        .iter()
                        .flat_map(|set| set.applications.iter().copied())
                        .collect();
                    let mut wanted = matched;
                    wanted.push(application.id);
                    for candidate in wanted {
                        if !already_members.contains(&candidate) {
                            plan.mutations.push(SetMutation::AddMember {
                                set_id: survivor.id,
                                application_id: candidate,
                            });
                        }
                    }
                }
            }
        }

        plan
    }

    /// Removes a withdrawn application from every open set that still lists it.
    pub fn plan_withdrawal(
        &self,
        application: &Application,
        sets: &[ApplicationFlaggedSet],
    ) -> SetMutationPlan {
        let mut plan = SetMutationPlan::new(application.id, application.listing_id);
        let mut holding: Vec<&ApplicationFlaggedSet> = sets
            .iter()
            .filter(|set| set.is_open() && set.contains(application.id))
            .collect();
        holding.sort_by_key(|set| (set.created_at, set.id));
        for set in holding {
            plan.mutations.push(removal(set, application.id));
        }
        plan
    }
}

fn removal(set: &ApplicationFlaggedSet, application_id: ApplicationId) -> SetMutation {
    let remaining = set
        .unresolved_members()
        .filter(|member| *member != application_id)
        .count();
    if remaining < 2 {
        SetMutation::Dissolve {
            set_id: set.id,
            application_id,
        }
    } else {
        SetMutation::RemoveMember {
            set_id: set.id,
            application_id,
        }
    }
}
