use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use axum::response::Response;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde_json::Value;

use crate::config::FlaggingConfig;
use crate::workflows::applications::confirmation::ConfirmationCodeGenerator;
use crate::workflows::applications::domain::{
    Applicant, Application, ApplicationId, ApplicationSubmission, ConfirmationCode, ListingId,
    ListingSnapshot, RequestContext, UserId,
};
use crate::workflows::applications::flagging::ApplicationFlaggedSet;
use crate::workflows::applications::memory::{
    MemoryDatabase, MemoryListingDirectory, RecordingNotifier,
};
use crate::workflows::applications::repository::{FlaggingDatabase, FlaggingTransaction};
use crate::workflows::applications::service::ApplicationGateway;

pub(super) type TestGateway =
    ApplicationGateway<MemoryDatabase, MemoryListingDirectory, RecordingNotifier>;

pub(super) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub(super) fn minutes(offset: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(offset)
}

pub(super) fn ctx(offset: i64) -> RequestContext {
    RequestContext::at(None, minutes(offset))
}

pub(super) fn staff_ctx(user: UserId, offset: i64) -> RequestContext {
    RequestContext::at(Some(user), minutes(offset))
}

pub(super) fn dob(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

pub(super) fn applicant(
    first: &str,
    last: &str,
    date_of_birth: Option<NaiveDate>,
    email: Option<&str>,
) -> Applicant {
    Applicant {
        first_name: Some(first.to_string()),
        last_name: Some(last.to_string()),
        date_of_birth,
        email_address: email.map(str::to_string),
        ..Applicant::default()
    }
}

pub(super) fn jane_doe() -> Applicant {
    applicant("Jane", "Doe", Some(dob(1990, 1, 1)), None)
}

/// Due after both the fixed test clock and the wall clock the router stamps requests with.
pub(super) fn open_listing(id: ListingId) -> ListingSnapshot {
    ListingSnapshot {
        id,
        name: "Maple Court".to_string(),
        application_due_date: Some(Utc::now().max(t0()) + Duration::days(30)),
    }
}

pub(super) fn closed_listing(id: ListingId) -> ListingSnapshot {
    ListingSnapshot {
        id,
        name: "Birch Commons".to_string(),
        application_due_date: Some(minutes(-60)),
    }
}

pub(super) fn submission(listing_id: ListingId, applicant: Applicant) -> ApplicationSubmission {
    ApplicationSubmission {
        listing_id,
        applicant,
        household_members: Vec::new(),
        app_url: Some("https://housing.example.org".to_string()),
    }
}

/// Builds a stored application without going through the gateway.
pub(super) fn application(
    listing_id: ListingId,
    applicant: Applicant,
    submitted_offset: i64,
) -> Application {
    let at = minutes(submitted_offset);
    let id = ApplicationId::new();
    Application {
        id,
        listing_id,
        user_id: None,
        applicant,
        household_members: Vec::new(),
        submission_date: at,
        confirmation_code: ConfirmationCode(id.0.simple().to_string()[..8].to_ascii_uppercase()),
        marked_as_duplicate: false,
        created_at: at,
        updated_at: at,
        deleted_at: None,
    }
}

pub(super) async fn seed_applications(database: &MemoryDatabase, applications: &[Application]) {
    let mut tx = database.begin_serializable().await.expect("begin");
    for application in applications {
        tx.insert_application(application).await.expect("insert");
    }
    tx.commit().await.expect("commit");
}

pub(super) async fn seed_set(database: &MemoryDatabase, set: &ApplicationFlaggedSet) {
    let mut tx = database.begin_serializable().await.expect("begin");
    tx.insert_set(set).await.expect("insert set");
    for member in &set.applications {
        tx.set_duplicate_flag(*member, true).await.expect("flag");
    }
    tx.commit().await.expect("commit");
}

/// Flagging settings with jitter disabled so backoff is exact.
pub(super) fn flagging_config() -> FlaggingConfig {
    FlaggingConfig {
        jitter_ms: 0,
        ..FlaggingConfig::default()
    }
}

pub(super) struct GatewayFixture {
    pub(super) gateway: TestGateway,
    pub(super) database: MemoryDatabase,
    pub(super) notifier: RecordingNotifier,
    pub(super) listing_id: ListingId,
}

pub(super) fn build_gateway() -> GatewayFixture {
    build_gateway_with(RecordingNotifier::default())
}

pub(super) fn build_gateway_with(notifier: RecordingNotifier) -> GatewayFixture {
    let listing_id = ListingId::new();
    let database = MemoryDatabase::new();
    let listings = MemoryListingDirectory::with_listings([open_listing(listing_id)]);
    let gateway = ApplicationGateway::new(
        Arc::new(database.clone()),
        Arc::new(listings),
        Arc::new(notifier.clone()),
        &flagging_config(),
    );
    GatewayFixture {
        gateway,
        database,
        notifier,
        listing_id,
    }
}

/// Hands out the scripted codes in order, then repeats the last one.
pub(super) struct ScriptedCodes {
    codes: Mutex<VecDeque<String>>,
    last: Mutex<String>,
}

impl ScriptedCodes {
    pub(super) fn new(codes: &[&str]) -> Self {
        Self {
            codes: Mutex::new(codes.iter().map(|code| code.to_string()).collect()),
            last: Mutex::new(codes.last().copied().unwrap_or("00000000").to_string()),
        }
    }
}

impl ConfirmationCodeGenerator for ScriptedCodes {
    fn generate(&self) -> ConfirmationCode {
        let next = self.codes.lock().expect("codes mutex").pop_front();
        match next {
            Some(code) => ConfirmationCode(code),
            None => ConfirmationCode(self.last.lock().expect("last mutex").clone()),
        }
    }
}

pub(super) fn assert_set_invariants(sets: &[ApplicationFlaggedSet]) {
    for set in sets {
        set.check_invariants().expect("set invariants hold");
    }
}

pub(super) fn open_sets(database: &MemoryDatabase) -> Vec<ApplicationFlaggedSet> {
    database
        .sets()
        .expect("read sets")
        .into_iter()
        .filter(|set| set.is_open())
        .collect()
}

pub(super) fn is_flagged(database: &MemoryDatabase, id: ApplicationId) -> bool {
    database
        .application(id)
        .expect("read application")
        .expect("application exists")
        .marked_as_duplicate
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
