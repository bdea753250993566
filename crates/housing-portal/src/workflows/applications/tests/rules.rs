use super::common::*;

use crate::workflows::applications::domain::ListingId;
use crate::workflows::applications::flagging::{matches, ApplicantField, FlaggingRule};

#[test]
fn name_and_dob_ignores_case_and_spacing() {
    let listing = ListingId::new();
    let left = application(listing, jane_doe(), 0);
    let right = application(
        listing,
        applicant("  JANE ", "doe", Some(dob(1990, 1, 1)), None),
        1,
    );

    assert!(matches(FlaggingRule::NameAndDob, &left, &right));
    assert!(FlaggingRule::NameAndDob.matches(&right, &left));
}

#[test]
fn name_and_dob_requires_both_fields_equal() {
    let listing = ListingId::new();
    let jane = application(listing, jane_doe(), 0);
    let same_dob_other_name = application(
        listing,
        applicant("Carla", "Mendez", Some(dob(1990, 1, 1)), None),
        1,
    );
    let same_name_other_dob = application(
        listing,
        applicant("Jane", "Doe", Some(dob(1991, 6, 30)), None),
        2,
    );

    assert!(!matches(FlaggingRule::NameAndDob, &jane, &same_dob_other_name));
    assert!(!matches(FlaggingRule::NameAndDob, &jane, &same_name_other_dob));
}

#[test]
fn missing_fields_never_match() {
    let listing = ListingId::new();
    let no_dob = application(listing, applicant("Jane", "Doe", None, None), 0);
    let also_no_dob = application(listing, applicant("Jane", "Doe", None, None), 1);
    assert!(!matches(FlaggingRule::NameAndDob, &no_dob, &also_no_dob));
    assert!(!matches(FlaggingRule::Email, &no_dob, &also_no_dob));

    let blank_email = application(
        listing,
        applicant("Ana", "Ruiz", None, Some("   ")),
        2,
    );
    let other_blank = application(listing, applicant("Ben", "Ruiz", None, Some("")), 3);
    assert!(!matches(FlaggingRule::Email, &blank_email, &other_blank));
}

#[test]
fn email_is_trimmed_and_case_insensitive() {
    let listing = ListingId::new();
    let left = application(
        listing,
        applicant("Ana", "Ruiz", None, Some("Ana.Ruiz@Example.org ")),
        0,
    );
    let right = application(
        listing,
        applicant("Anna", "Ruiz-Lopez", None, Some("ana.ruiz@example.org")),
        1,
    );

    assert!(matches(FlaggingRule::Email, &left, &right));
    assert!(!matches(FlaggingRule::NameAndDob, &left, &right));
}

#[test]
fn rules_declare_their_fields() {
    assert_eq!(
        FlaggingRule::NameAndDob.required_fields(),
        &[
            ApplicantField::FirstName,
            ApplicantField::LastName,
            ApplicantField::DateOfBirth
        ]
    );
    assert_eq!(
        FlaggingRule::Email.required_fields(),
        &[ApplicantField::EmailAddress]
    );
}

#[test]
fn rule_keys_parse_and_serialize() {
    assert_eq!(FlaggingRule::from_key("Name+DOB"), Some(FlaggingRule::NameAndDob));
    assert_eq!(FlaggingRule::from_key(" email "), Some(FlaggingRule::Email));
    assert_eq!(FlaggingRule::from_key("phone"), None);
    assert_eq!(FlaggingRule::NameAndDob.to_string(), "name+dob");
    assert_eq!(
        serde_json::to_value(FlaggingRule::NameAndDob).expect("serialize"),
        serde_json::json!("name+dob")
    );
}
