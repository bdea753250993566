use super::common::*;

use crate::workflows::applications::domain::{FlaggedSetId, ListingId, UserId};
use crate::workflows::applications::flagging::{
    ApplicationFlaggedSet, FlaggedSetStatus, FlaggingRule, MatchingEngine, SetMutation,
};

#[test]
fn two_matching_applications_plan_a_new_set() {
    let listing = ListingId::new();
    let first = application(listing, jane_doe(), 0);
    let second = application(listing, jane_doe(), 1);
    let pool = vec![first.clone(), second.clone()];

    let plan = MatchingEngine::default().plan(&second, &pool, &[]);

    assert_eq!(
        plan.mutations,
        vec![SetMutation::Create {
            rule: FlaggingRule::NameAndDob,
            members: vec![first.id, second.id],
        }]
    );
}

#[test]
fn unrelated_applications_plan_nothing() {
    let listing = ListingId::new();
    let jane = application(listing, jane_doe(), 0);
    let carla = application(
        listing,
        applicant("Carla", "Mendez", Some(dob(1990, 1, 1)), None),
        1,
    );
    let no_fields = application(listing, applicant("Sam", "Lee", None, None), 2);
    let pool = vec![jane, carla.clone(), no_fields.clone()];

    let engine = MatchingEngine::default();
    assert!(engine.plan(&carla, &pool, &[]).is_empty());
    assert!(engine.plan(&no_fields, &pool, &[]).is_empty());
}

#[test]
fn applications_in_other_listings_are_ignored() {
    let first = application(ListingId::new(), jane_doe(), 0);
    let second = application(ListingId::new(), jane_doe(), 1);
    let pool = vec![first, second.clone()];

    assert!(MatchingEngine::default().plan(&second, &pool, &[]).is_empty());
}

#[test]
fn re_evaluating_an_unchanged_pool_is_a_no_op() {
    let listing = ListingId::new();
    let first = application(listing, jane_doe(), 0);
    let second = application(listing, jane_doe(), 1);
    let third = application(listing, jane_doe(), 2);
    let pool = vec![first.clone(), second.clone(), third.clone()];
    let set = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        vec![first.id, second.id, third.id],
        minutes(2),
    );

    let engine = MatchingEngine::default();
    for application in &pool {
        let plan = engine.plan(application, &pool, std::slice::from_ref(&set));
        assert!(plan.is_empty(), "unexpected mutations: {:?}", plan.mutations);
    }
}

#[test]
fn adjudicated_pairs_are_not_matched_again() {
    let listing = ListingId::new();
    let first = application(listing, jane_doe(), 0);
    let second = application(listing, jane_doe(), 1);
    let mut resolved = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        vec![first.id, second.id],
        minutes(1),
    );
    resolved.status = FlaggedSetStatus::Resolved;
    resolved.resolving_user_id = Some(UserId::new());
    resolved.resolved_time = Some(minutes(2));

    let engine = MatchingEngine::default();
    let pool = vec![first.clone(), second.clone()];
    for application in &pool {
        let plan = engine.plan(application, &pool, std::slice::from_ref(&resolved));
        assert!(plan.is_empty(), "unexpected mutations: {:?}", plan.mutations);
    }

    let third = application(listing, jane_doe(), 3);
    let pool = vec![first.clone(), second.clone(), third.clone()];
    let plan = engine.plan(&third, &pool, std::slice::from_ref(&resolved));
    assert_eq!(
        plan.mutations,
        vec![SetMutation::Create {
            rule: FlaggingRule::NameAndDob,
            members: vec![first.id, second.id, third.id],
        }]
    );
}

#[test]
fn dissolved_sets_do_not_suppress_a_rematch() {
    let listing = ListingId::new();
    let first = application(listing, jane_doe(), 0);
    let second = application(listing, jane_doe(), 1);
    let mut dissolved = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        vec![first.id, second.id],
        minutes(1),
    );
    dissolved.status = FlaggedSetStatus::Resolved;
    dissolved.resolved_time = Some(minutes(2));

    let pool = vec![first.clone(), second.clone()];
    let plan = MatchingEngine::default().plan(&second, &pool, std::slice::from_ref(&dissolved));
    assert_eq!(
        plan.mutations,
        vec![SetMutation::Create {
            rule: FlaggingRule::NameAndDob,
            members: vec![first.id, second.id],
        }]
    );
}

#[test]
fn a_new_match_joins_the_existing_open_set() {
    let listing = ListingId::new();
    let first = application(listing, jane_doe(), 0);
    let second = application(listing, jane_doe(), 1);
    let third = application(listing, jane_doe(), 2);
    let set = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        vec![first.id, second.id],
        minutes(1),
    );
    let pool = vec![first, second, third.clone()];

    let plan = MatchingEngine::default().plan(&third, &pool, &[set.clone()]);

    assert_eq!(
        plan.mutations,
        vec![SetMutation::AddMember {
            set_id: set.id,
            application_id: third.id,
        }]
    );
}

#[test]
fn overlapping_sets_merge_into_the_oldest() {
    let listing = ListingId::new();
    let apps: Vec<_> = (0..5)
        .map(|offset| application(listing, jane_doe(), offset))
        .collect();
    let newer = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        vec![apps[2].id, apps[3].id],
        minutes(10),
    );
    let older = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        vec![apps[0].id, apps[1].id],
        minutes(5),
    );

    let plan = MatchingEngine::default().plan(&apps[4], &apps, &[newer.clone(), older.clone()]);

    assert_eq!(
        plan.mutations,
        vec![
            SetMutation::Merge {
                rule: FlaggingRule::NameAndDob,
                survivor: older.id,
                absorbed: vec![newer.id],
            },
            SetMutation::AddMember {
                set_id: older.id,
                application_id: apps[4].id,
            },
        ]
    );
}

#[test]
fn merge_ties_break_on_the_smallest_id() {
    let listing = ListingId::new();
    let apps: Vec<_> = (0..5)
        .map(|offset| application(listing, jane_doe(), offset))
        .collect();
    let mut left = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        vec![apps[0].id, apps[1].id],
        minutes(5),
    );
    let mut right = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        vec![apps[2].id, apps[3].id],
        minutes(5),
    );
    left.id = FlaggedSetId(uuid::Uuid::from_u128(2));
    right.id = FlaggedSetId(uuid::Uuid::from_u128(1));

    let plan = MatchingEngine::default().plan(&apps[4], &apps, &[left, right.clone()]);

    assert!(matches!(
        plan.mutations.first(),
        Some(SetMutation::Merge { survivor, .. }) if *survivor == right.id
    ));
}

#[test]
fn breaking_the_match_dissolves_a_pair() {
    let listing = ListingId::new();
    let first = application(listing, jane_doe(), 0);
    let mut second = application(listing, jane_doe(), 1);
    let set = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        vec![first.id, second.id],
        minutes(1),
    );
    second.applicant.date_of_birth = Some(dob(1985, 5, 5));
    let pool = vec![first, second.clone()];

    let plan = MatchingEngine::default().plan(&second, &pool, &[set.clone()]);

    assert_eq!(
        plan.mutations,
        vec![SetMutation::Dissolve {
            set_id: set.id,
            application_id: second.id,
        }]
    );
}

#[test]
fn breaking_the_match_shrinks_a_larger_set() {
    let listing = ListingId::new();
    let first = application(listing, jane_doe(), 0);
    let second = application(listing, jane_doe(), 1);
    let mut third = application(listing, jane_doe(), 2);
    let set = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        vec![first.id, second.id, third.id],
        minutes(2),
    );
    third.applicant.first_name = Some("Janet".to_string());
    let pool = vec![first, second, third.clone()];

    let plan = MatchingEngine::default().plan(&third, &pool, &[set.clone()]);

    assert_eq!(
        plan.mutations,
        vec![SetMutation::RemoveMember {
            set_id: set.id,
            application_id: third.id,
        }]
    );
}

#[test]
fn switching_matches_moves_between_sets() {
    let listing = ListingId::new();
    let jane = application(listing, jane_doe(), 0);
    let mut moving = application(listing, jane_doe(), 1);
    let carla = application(
        listing,
        applicant("Carla", "Mendez", Some(dob(1988, 2, 2)), None),
        2,
    );
    let set = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        vec![jane.id, moving.id],
        minutes(1),
    );
    moving.applicant = applicant("Carla", "Mendez", Some(dob(1988, 2, 2)), None);
    let pool = vec![jane, moving.clone(), carla.clone()];

    let plan = MatchingEngine::default().plan(&moving, &pool, &[set.clone()]);

    assert_eq!(
        plan.mutations,
        vec![
            SetMutation::Dissolve {
                set_id: set.id,
                application_id: moving.id,
            },
            SetMutation::Create {
                rule: FlaggingRule::NameAndDob,
                members: vec![carla.id, moving.id],
            },
        ]
    );
}

#[test]
fn each_rule_plans_independently() {
    let listing = ListingId::new();
    let first = application(
        listing,
        applicant("Jane", "Doe", Some(dob(1990, 1, 1)), Some("jane@example.org")),
        0,
    );
    let second = application(
        listing,
        applicant("Jane", "Doe", Some(dob(1990, 1, 1)), Some("JANE@example.org")),
        1,
    );
    let pool = vec![first.clone(), second.clone()];

    let plan = MatchingEngine::default().plan(&second, &pool, &[]);

    assert_eq!(
        plan.mutations,
        vec![
            SetMutation::Create {
                rule: FlaggingRule::NameAndDob,
                members: vec![first.id, second.id],
            },
            SetMutation::Create {
                rule: FlaggingRule::Email,
                members: vec![first.id, second.id],
            },
        ]
    );
}

#[test]
fn inactive_rules_are_not_evaluated() {
    let listing = ListingId::new();
    let first = application(listing, jane_doe(), 0);
    let second = application(listing, jane_doe(), 1);
    let pool = vec![first, second.clone()];

    let engine = MatchingEngine::new(vec![FlaggingRule::Email]);
    assert!(engine.plan(&second, &pool, &[]).is_empty());
}

#[test]
fn withdrawal_leaves_every_open_set() {
    let listing = ListingId::new();
    let a = application(listing, jane_doe(), 0);
    let b = application(listing, jane_doe(), 1);
    let c = application(listing, jane_doe(), 2);
    let mut leaving = application(listing, jane_doe(), 3);
    let by_name = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        vec![a.id, b.id, c.id, leaving.id],
        minutes(3),
    );
    let by_email = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::Email,
        vec![a.id, leaving.id],
        minutes(4),
    );
    leaving.deleted_at = Some(minutes(10));

    let engine = MatchingEngine::default();
    let plan = engine.plan_withdrawal(&leaving, &[by_email.clone(), by_name.clone()]);

    assert_eq!(
        plan.mutations,
        vec![
            SetMutation::RemoveMember {
                set_id: by_name.id,
                application_id: leaving.id,
            },
            SetMutation::Dissolve {
                set_id: by_email.id,
                application_id: leaving.id,
            },
        ]
    );

    let pool = vec![a, b, c, leaving.clone()];
    let write_plan = engine.plan(&leaving, &pool, &[by_name, by_email]);
    assert_eq!(write_plan.mutations, plan.mutations);
}
