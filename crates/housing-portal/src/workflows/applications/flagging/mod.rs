//! Duplicate-application flagging: matching rules, flagged sets and the planner that keeps them
//! consistent after every application write.

mod matching;
mod rules;
mod sets;
mod store;

pub use super::domain::FlaggedSetId;
pub use matching::{MatchingEngine, SetMutation, SetMutationPlan};
pub use rules::{matches, ApplicantField, FlaggingRule, MatchSignature};
pub use sets::{ApplicationFlaggedSet, FlaggedSetStatus};
pub use store::{FlaggedSetStore, PlanOutcome, RemovalOutcome};
