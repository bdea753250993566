use super::common::*;

use crate::workflows::applications::domain::{ListingId, UserId, ValidationError};
use crate::workflows::applications::flagging::{
    ApplicationFlaggedSet, FlaggedSetStatus, FlaggedSetStore, FlaggingRule, RemovalOutcome,
};
use crate::workflows::applications::memory::MemoryDatabase;
use crate::workflows::applications::repository::{
    FlaggingDatabase, FlaggingTransaction, RepositoryError,
};
use crate::workflows::applications::service::ApplicationServiceError;

#[tokio::test]
async fn create_set_flags_every_member() {
    let database = MemoryDatabase::new();
    let listing = ListingId::new();
    let first = application(listing, jane_doe(), 0);
    let second = application(listing, jane_doe(), 1);
    seed_applications(&database, &[first.clone(), second.clone()]).await;

    let mut tx = database.begin_serializable().await.expect("begin");
    let set = FlaggedSetStore
        .create_set(
            &mut tx,
            FlaggingRule::NameAndDob,
            listing,
            &[first.id, second.id, first.id],
            minutes(5),
        )
        .await
        .expect("set created");
    tx.commit().await.expect("commit");

    assert_eq!(set.applications, vec![first.id, second.id]);
    assert_eq!(set.status, FlaggedSetStatus::Open);
    assert!(is_flagged(&database, first.id));
    assert!(is_flagged(&database, second.id));
}

#[tokio::test]
async fn create_set_rejects_singletons_and_double_membership() {
    let database = MemoryDatabase::new();
    let listing = ListingId::new();
    let first = application(listing, jane_doe(), 0);
    let second = application(listing, jane_doe(), 1);
    let third = application(listing, jane_doe(), 2);
    seed_applications(&database, &[first.clone(), second.clone(), third.clone()]).await;
    seed_set(
        &database,
        &ApplicationFlaggedSet::open(
            listing,
            FlaggingRule::NameAndDob,
            vec![first.id, second.id],
            minutes(3),
        ),
    )
    .await;

    let mut tx = database.begin_serializable().await.expect("begin");
    let singleton = FlaggedSetStore
        .create_set(
            &mut tx,
            FlaggingRule::NameAndDob,
            listing,
            &[third.id],
            minutes(4),
        )
        .await;
    assert!(matches!(
        singleton,
        Err(ApplicationServiceError::InvariantViolation(_))
    ));

    let overlapping = FlaggedSetStore
        .create_set(
            &mut tx,
            FlaggingRule::NameAndDob,
            listing,
            &[second.id, third.id],
            minutes(4),
        )
        .await;
    assert!(matches!(
        overlapping,
        Err(ApplicationServiceError::InvariantViolation(_))
    ));

    let other_rule = FlaggedSetStore
        .create_set(
            &mut tx,
            FlaggingRule::Email,
            listing,
            &[second.id, third.id],
            minutes(4),
        )
        .await;
    assert!(other_rule.is_ok());
}

#[tokio::test]
async fn removing_from_a_pair_dissolves_and_clears_the_flag() {
    let database = MemoryDatabase::new();
    let listing = ListingId::new();
    let first = application(listing, jane_doe(), 0);
    let second = application(listing, jane_doe(), 1);
    seed_applications(&database, &[first.clone(), second.clone()]).await;
    let set = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        vec![first.id, second.id],
        minutes(2),
    );
    seed_set(&database, &set).await;

    let mut tx = database.begin_serializable().await.expect("begin");
    let outcome = FlaggedSetStore
        .remove_member(&mut tx, set.id, second.id, minutes(10))
        .await
        .expect("removed");
    tx.commit().await.expect("commit");

    let RemovalOutcome::Dissolved(dissolved) = outcome else {
        panic!("expected dissolution, got {outcome:?}");
    };
    assert_eq!(dissolved.status, FlaggedSetStatus::Resolved);
    assert_eq!(dissolved.resolved_time, Some(minutes(10)));
    assert_eq!(dissolved.applications, vec![first.id]);
    assert!(open_sets(&database).is_empty());
    assert!(!is_flagged(&database, first.id));
    assert!(!is_flagged(&database, second.id));
    assert_set_invariants(&database.sets().expect("sets"));
}

#[tokio::test]
async fn removing_from_a_larger_set_keeps_it_open() {
    let database = MemoryDatabase::new();
    let listing = ListingId::new();
    let apps: Vec<_> = (0..3)
        .map(|offset| application(listing, jane_doe(), offset))
        .collect();
    seed_applications(&database, &apps).await;
    let set = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        apps.iter().map(|app| app.id).collect(),
        minutes(3),
    );
    seed_set(&database, &set).await;

    let mut tx = database.begin_serializable().await.expect("begin");
    let outcome = FlaggedSetStore
        .remove_member(&mut tx, set.id, apps[0].id, minutes(10))
        .await
        .expect("removed");
    tx.commit().await.expect("commit");

    assert!(matches!(outcome, RemovalOutcome::Shrunk(ref shrunk) if shrunk.is_open()));
    assert!(!is_flagged(&database, apps[0].id));
    assert!(is_flagged(&database, apps[1].id));
    assert!(is_flagged(&database, apps[2].id));
}

#[tokio::test]
async fn merge_keeps_the_oldest_set_and_deletes_the_rest() {
    let database = MemoryDatabase::new();
    let listing = ListingId::new();
    let apps: Vec<_> = (0..4)
        .map(|offset| application(listing, jane_doe(), offset))
        .collect();
    seed_applications(&database, &apps).await;
    let older = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        vec![apps[0].id, apps[1].id],
        minutes(5),
    );
    let newer = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        vec![apps[2].id, apps[3].id],
        minutes(6),
    );
    seed_set(&database, &older).await;
    seed_set(&database, &newer).await;

    let mut tx = database.begin_serializable().await.expect("begin");
    let merged = FlaggedSetStore
        .merge_sets(&mut tx, &[newer.id, older.id], minutes(20))
        .await
        .expect("merged");
    tx.commit().await.expect("commit");

    assert_eq!(merged.id, older.id);
    assert_eq!(
        merged.applications,
        apps.iter().map(|app| app.id).collect::<Vec<_>>()
    );
    let sets = database.sets().expect("sets");
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].id, older.id);
    assert_set_invariants(&sets);
}

#[tokio::test]
async fn merge_refuses_mixed_rules() {
    let database = MemoryDatabase::new();
    let listing = ListingId::new();
    let apps: Vec<_> = (0..4)
        .map(|offset| application(listing, jane_doe(), offset))
        .collect();
    seed_applications(&database, &apps).await;
    let by_name = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        vec![apps[0].id, apps[1].id],
        minutes(5),
    );
    let by_email = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::Email,
        vec![apps[2].id, apps[3].id],
        minutes(6),
    );
    seed_set(&database, &by_name).await;
    seed_set(&database, &by_email).await;

    let mut tx = database.begin_serializable().await.expect("begin");
    let result = FlaggedSetStore
        .merge_sets(&mut tx, &[by_name.id, by_email.id], minutes(20))
        .await;
    assert!(matches!(
        result,
        Err(ApplicationServiceError::InvariantViolation(_))
    ));
}

#[tokio::test]
async fn resolve_keeps_the_chosen_subset_flagged() {
    let database = MemoryDatabase::new();
    let listing = ListingId::new();
    let apps: Vec<_> = (0..3)
        .map(|offset| application(listing, jane_doe(), offset))
        .collect();
    seed_applications(&database, &apps).await;
    let set = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        apps.iter().map(|app| app.id).collect(),
        minutes(3),
    );
    seed_set(&database, &set).await;
    let staff = UserId::new();

    let mut tx = database.begin_serializable().await.expect("begin");
    let resolved = FlaggedSetStore
        .resolve(&mut tx, set.id, staff, &[apps[2].id, apps[1].id], minutes(30))
        .await
        .expect("resolved");
    tx.commit().await.expect("commit");

    assert_eq!(resolved.status, FlaggedSetStatus::Resolved);
    assert_eq!(resolved.resolving_user_id, Some(staff));
    assert_eq!(resolved.resolved_applications, vec![apps[1].id, apps[2].id]);
    assert!(!is_flagged(&database, apps[0].id));
    assert!(is_flagged(&database, apps[1].id));
    assert!(is_flagged(&database, apps[2].id));
    assert_set_invariants(&database.sets().expect("sets"));
}

#[tokio::test]
async fn resolve_rejects_applications_outside_the_set() {
    let database = MemoryDatabase::new();
    let listing = ListingId::new();
    let apps: Vec<_> = (0..3)
        .map(|offset| application(listing, jane_doe(), offset))
        .collect();
    seed_applications(&database, &apps).await;
    let set = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        vec![apps[0].id, apps[1].id],
        minutes(3),
    );
    seed_set(&database, &set).await;

    let mut tx = database.begin_serializable().await.expect("begin");
    let result = FlaggedSetStore
        .resolve(&mut tx, set.id, UserId::new(), &[apps[2].id], minutes(30))
        .await;

    assert!(matches!(
        result,
        Err(ApplicationServiceError::Validation(
            ValidationError::ResolutionOutsideSet(id)
        )) if id == apps[2].id
    ));
}

#[tokio::test]
async fn resolved_subset_survives_member_removal() {
    let database = MemoryDatabase::new();
    let listing = ListingId::new();
    let apps: Vec<_> = (0..3)
        .map(|offset| application(listing, jane_doe(), offset))
        .collect();
    seed_applications(&database, &apps).await;
    let set = ApplicationFlaggedSet::open(
        listing,
        FlaggingRule::NameAndDob,
        apps.iter().map(|app| app.id).collect(),
        minutes(3),
    );
    seed_set(&database, &set).await;

    let mut tx = database.begin_serializable().await.expect("begin");
    FlaggedSetStore
        .resolve(&mut tx, set.id, UserId::new(), &[apps[0].id, apps[1].id], minutes(30))
        .await
        .expect("resolved");
    FlaggedSetStore
        .remove_member(&mut tx, set.id, apps[1].id, minutes(31))
        .await
        .expect("removed");
    let stored = tx.fetch_set(set.id).await.expect("fetch").expect("set");
    tx.commit().await.expect("commit");

    assert_eq!(stored.applications, vec![apps[0].id, apps[2].id]);
    assert_eq!(stored.resolved_applications, vec![apps[0].id]);
    stored.check_invariants().expect("resolved subset of members");
}

#[tokio::test]
async fn concurrent_writers_on_one_listing_conflict() {
    let database = MemoryDatabase::new();
    let listing = ListingId::new();
    let first = application(listing, jane_doe(), 0);
    let second = application(listing, jane_doe(), 1);

    let mut left = database.begin_serializable().await.expect("begin left");
    let mut right = database.begin_serializable().await.expect("begin right");
    left.listing_applications(listing).await.expect("read");
    right.listing_applications(listing).await.expect("read");
    left.insert_application(&first).await.expect("insert");
    right.insert_application(&second).await.expect("insert");

    left.commit().await.expect("first commit wins");
    assert_eq!(
        right.commit().await,
        Err(RepositoryError::SerializationFailure)
    );
    assert!(database.application(second.id).expect("read").is_none());
}

#[tokio::test]
async fn writers_on_different_listings_do_not_conflict() {
    let database = MemoryDatabase::new();
    let first = application(ListingId::new(), jane_doe(), 0);
    let second = application(ListingId::new(), jane_doe(), 1);

    let mut left = database.begin_serializable().await.expect("begin left");
    let mut right = database.begin_serializable().await.expect("begin right");
    left.insert_application(&first).await.expect("insert");
    right.insert_application(&second).await.expect("insert");

    left.commit().await.expect("commit left");
    right.commit().await.expect("commit right");
    assert!(database.application(first.id).expect("read").is_some());
    assert!(database.application(second.id).expect("read").is_some());
}
