use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::super::domain::Application;

/// Named duplicate-matching predicates. Each rule yields its own independent sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FlaggingRule {
    /// Case-insensitive first + last name together with date of birth.
    #[serde(rename = "name+dob")]
    NameAndDob,
    /// Case-insensitive applicant email address.
    #[serde(rename = "email")]
    Email,
}

/// Applicant fields a rule reads. Absence of any of them means "no match".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicantField {
    FirstName,
    LastName,
    DateOfBirth,
    EmailAddress,
}

/// Normalized comparison key. Two applications match under a rule iff their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MatchSignature {
    NameAndDob {
        first_name: String,
        last_name: String,
        date_of_birth: NaiveDate,
    },
    Email(String),
}

impl FlaggingRule {
    pub const ALL: [FlaggingRule; 2] = [FlaggingRule::NameAndDob, FlaggingRule::Email];

    pub const fn key(self) -> &'static str {
        match self {
            FlaggingRule::NameAndDob => "name+dob",
            FlaggingRule::Email => "email",
        }
    }

    pub fn from_key(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "name+dob" | "nameanddob" | "name and dob" => Some(FlaggingRule::NameAndDob),
            "email" => Some(FlaggingRule::Email),
            _ => None,
        }
    }

    pub const fn required_fields(self) -> &'static [ApplicantField] {
        match self {
            FlaggingRule::NameAndDob => &[
                ApplicantField::FirstName,
                ApplicantField::LastName,
                ApplicantField::DateOfBirth,
            ],
            FlaggingRule::Email => &[ApplicantField::EmailAddress],
        }
    }

    /// Comparison key for `application`, or `None` when a required field is absent.
    pub fn signature(self, application: &Application) -> Option<MatchSignature> {
        let applicant = &application.applicant;
        match self {
            FlaggingRule::NameAndDob => Some(MatchSignature::NameAndDob {
                first_name: normalize_text(applicant.first_name.as_deref())?,
                last_name: normalize_text(applicant.last_name.as_deref())?,
                date_of_birth: applicant.date_of_birth?,
            }),
            FlaggingRule::Email => {
                normalize_email(applicant.email_address.as_deref()).map(MatchSignature::Email)
            }
        }
    }

    pub fn matches(self, left: &Application, right: &Application) -> bool {
        matches(self, left, right)
    }
}

impl fmt::Display for FlaggingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Pure and total: missing fields on either side evaluate to `false`.
pub fn matches(rule: FlaggingRule, left: &Application, right: &Application) -> bool {
    match (rule.signature(left), rule.signature(right)) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}

fn normalize_text(value: Option<&str>) -> Option<String> {
    let collapsed = value?
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn normalize_email(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}
