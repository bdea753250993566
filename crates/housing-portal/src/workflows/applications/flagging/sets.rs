use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::super::domain::{ApplicationId, FlaggedSetId, ListingId, UserId};
use super::rules::FlaggingRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlaggedSetStatus {
    Open,
    Resolved,
}

impl FlaggedSetStatus {
    pub const fn label(self) -> &'static str {
        match self {
            FlaggedSetStatus::Open => "open",
            FlaggedSetStatus::Resolved => "resolved",
        }
    }

    pub fn from_label(raw: &str) -> Option<Self> {
        match raw {
            "open" => Some(FlaggedSetStatus::Open),
            "resolved" => Some(FlaggedSetStatus::Resolved),
            _ => None,
        }
    }
}

/// Applications of one listing suspected to be duplicates under one rule.
///
/// Membership lists keep insertion order and never contain repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationFlaggedSet {
    pub id: FlaggedSetId,
    pub listing_id: ListingId,
    pub rule: FlaggingRule,
    pub status: FlaggedSetStatus,
    pub applications: Vec<ApplicationId>,
    pub resolved_applications: Vec<ApplicationId>,
    pub resolving_user_id: Option<UserId>,
    pub resolved_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApplicationFlaggedSet {
    pub fn open(
        listing_id: ListingId,
        rule: FlaggingRule,
        applications: Vec<ApplicationId>,
        at: DateTime<Utc>,
    ) -> Self {
        let mut set = Self {
            id: FlaggedSetId::new(),
            listing_id,
            rule,
            status: FlaggedSetStatus::Open,
            applications: Vec::with_capacity(applications.len()),
            resolved_applications: Vec::new(),
            resolving_user_id: None,
            resolved_time: None,
            created_at: at,
            updated_at: at,
        };
        for application in applications {
            set.insert_member(application);
        }
        set
    }

    pub fn is_open(&self) -> bool {
        self.status == FlaggedSetStatus::Open
    }

    pub fn contains(&self, application: ApplicationId) -> bool {
        self.applications.contains(&application)
    }

    /// Resolved by staff, as opposed to dissolved after shrinking.
    pub fn is_adjudicated(&self) -> bool {
        self.status == FlaggedSetStatus::Resolved && self.resolving_user_id.is_some()
    }

    /// Whether staff already ruled on `left` and `right` together in this set.
    pub fn adjudicates(&self, left: ApplicationId, right: ApplicationId) -> bool {
        left != right && self.is_adjudicated() && self.contains(left) && self.contains(right)
    }

    pub fn is_resolved_member(&self, application: ApplicationId) -> bool {
        self.resolved_applications.contains(&application)
    }

    /// Returns `false` when the application was already a member.
    pub fn insert_member(&mut self, application: ApplicationId) -> bool {
        if self.contains(application) {
            return false;
        }
        self.applications.push(application);
        true
    }

    /// Removes the application from both membership lists.
    pub fn remove_member(&mut self, application: ApplicationId) -> bool {
        let before = self.applications.len();
        self.applications.retain(|member| *member != application);
        self.resolved_applications
            .retain(|member| *member != application);
        before != self.applications.len()
    }

    pub fn unresolved_members(&self) -> impl Iterator<Item = ApplicationId> + '_ {
        self.applications
            .iter()
            .copied()
            .filter(|member| !self.resolved_applications.contains(member))
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved_members().count()
    }

    /// Whether the application still counts as a duplicate because of this set.
    pub fn flags(&self, application: ApplicationId) -> bool {
        match self.status {
            FlaggedSetStatus::Open => self.contains(application),
            FlaggedSetStatus::Resolved => self.is_resolved_member(application),
        }
    }

    /// Checks the structural invariants every persisted set must satisfy.
    pub fn check_invariants(&self) -> Result<(), String> {
        if let Some(stray) = self
            .resolved_applications
            .iter()
            .find(|member| !self.applications.contains(member))
        {
            return Err(format!(
                "set {} lists resolved application {} outside its members",
                self.id, stray
            ));
        }
        let mut seen = HashSet::new();
        if let Some(repeat) = self.applications.iter().find(|member| !seen.insert(**member)) {
            return Err(format!("set {} repeats member {}", self.id, repeat));
        }
        if self.is_open() && self.unresolved_count() < 2 {
            return Err(format!(
                "open set {} has fewer than two unresolved members",
                self.id
            ));
        }
        Ok(())
    }
}
