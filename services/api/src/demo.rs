use chrono::NaiveDate;
use clap::Args;
use housing_portal::config::FlaggingConfig;
use housing_portal::error::AppError;
use housing_portal::workflows::applications::{
    Applicant, Application, ApplicationGateway, ApplicationSubmission, FlaggedSetQuery,
    FlaggedSetView, FlaggingRule, ListingId, ListingSnapshot, MemoryDatabase,
    MemoryListingDirectory, RecordingNotifier, RequestContext, ResolveRequest, UserId,
};
use std::sync::Arc;

type DemoGateway = ApplicationGateway<MemoryDatabase, MemoryListingDirectory, RecordingNotifier>;

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Number of identical submissions fired concurrently at the listing
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u8).range(2..=6))]
    pub(crate) concurrent: u8,
    /// Print the final flagged-set page as JSON
    #[arg(long)]
    pub(crate) json: bool,
    /// Skip the manual resolution step
    #[arg(long)]
    pub(crate) skip_resolve: bool,
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs {
        concurrent,
        json,
        skip_resolve,
    } = args;

    let listing = ListingSnapshot {
        id: ListingId::new(),
        name: "Maple Court".to_string(),
        application_due_date: None,
    };
    let notifier = RecordingNotifier::default();
    let gateway = Arc::new(ApplicationGateway::new(
        Arc::new(MemoryDatabase::new()),
        Arc::new(MemoryListingDirectory::with_listings([listing.clone()])),
        Arc::new(notifier.clone()),
        &FlaggingConfig::default(),
    ));

    println!("Duplicate flagging demo");
    println!("Listing: {} ({})", listing.name, listing.id);
    let rules: Vec<String> = gateway.rules().iter().map(ToString::to_string).collect();
    println!("Active rules: {}", rules.join(", "));

    println!("\nSequential submissions");
    let walkthrough = [
        applicant("Jane", "Doe", (1990, 1, 1), Some("jane@example.org")),
        applicant(" jane ", "DOE", (1990, 1, 1), None),
        applicant("Janet", "Smith", (1970, 6, 6), Some("JANE@example.org")),
    ];
    let mut submitted = Vec::new();
    for person in walkthrough {
        let application = gateway
            .submit(RequestContext::new(None), submission(listing.id, person))
            .await?;
        render_application(&application);
        submitted.push(application);
    }

    println!("\nConcurrent submissions ({concurrent} at once)");
    let handles: Vec<_> = (0..concurrent)
        .map(|_| {
            let gateway = gateway.clone();
            let listing_id = listing.id;
            tokio::spawn(async move {
                gateway
                    .submit(
                        RequestContext::new(None),
                        submission(listing_id, applicant("Lena", "Park", (1995, 8, 15), None)),
                    )
                    .await
            })
        })
        .collect();
    let mut concurrent_ids = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(result) => {
                let application = result?;
                render_application(&application);
                concurrent_ids.push(application.id);
            }
            Err(err) => println!("  Submission task aborted: {err}"),
        }
    }

    let sets = flagged_sets(&gateway, listing.id).await?;
    println!("\nFlagged sets after intake");
    render_sets(&sets);
    if let Some(lena) = sets
        .iter()
        .find(|set| set.applications.iter().any(|app| concurrent_ids.contains(&app.id)))
    {
        println!(
            "  Concurrent duplicates converged on set {} with {} members",
            lena.id,
            lena.applications.len()
        );
    }

    if !skip_resolve {
        if let Some(by_name) = sets.iter().find(|set| {
            set.rule == FlaggingRule::NameAndDob
                && set.applications.iter().any(|app| app.id == submitted[0].id)
        }) {
            let reviewer = UserId::new();
            let resolved = gateway
                .resolve(
                    RequestContext::new(Some(reviewer)),
                    ResolveRequest {
                        set_id: by_name.id,
                        resolving_user_id: None,
                        keep_application_ids: vec![submitted[0].id],
                    },
                )
                .await?;
            println!(
                "\nResolved set {} as reviewer {}; {} application(s) kept flagged",
                resolved.id,
                reviewer,
                resolved.resolved_applications.len()
            );
        }
    }

    if let Some(first) = concurrent_ids.first() {
        gateway.withdraw(RequestContext::new(None), *first).await?;
        println!("\nWithdrew application {first}");
    }

    let page = gateway
        .list_flagged_sets(
            RequestContext::new(None),
            FlaggedSetQuery {
                listing_id: listing.id,
                page: None,
                limit: None,
            },
        )
        .await?;
    println!("\nFinal flagged sets ({} open)", page.meta.total_flagged);
    render_sets(&page.items);

    let events = notifier.events();
    if events.is_empty() {
        println!("\nConfirmations: none dispatched");
    } else {
        println!("\nConfirmations");
        for event in events {
            println!(
                "- {} -> {}",
                event.confirmation_code,
                event.email_address.as_deref().unwrap_or("(no email)")
            );
        }
    }

    if json {
        match serde_json::to_string_pretty(&page) {
            Ok(payload) => println!("\nFlagged set page:\n{payload}"),
            Err(err) => println!("\nFlagged set page unavailable: {err}"),
        }
    }

    Ok(())
}

async fn flagged_sets(
    gateway: &DemoGateway,
    listing_id: ListingId,
) -> Result<Vec<FlaggedSetView>, AppError> {
    let page = gateway
        .list_flagged_sets(
            RequestContext::new(None),
            FlaggedSetQuery {
                listing_id,
                page: None,
                limit: Some(100),
            },
        )
        .await?;
    Ok(page.items)
}

fn applicant(first: &str, last: &str, born: (i32, u32, u32), email: Option<&str>) -> Applicant {
    Applicant {
        first_name: Some(first.to_string()),
        last_name: Some(last.to_string()),
        date_of_birth: NaiveDate::from_ymd_opt(born.0, born.1, born.2),
        email_address: email.map(str::to_string),
        ..Applicant::default()
    }
}

fn submission(listing_id: ListingId, applicant: Applicant) -> ApplicationSubmission {
    ApplicationSubmission {
        listing_id,
        applicant,
        household_members: Vec::new(),
        app_url: Some("https://housing.example.org".to_string()),
    }
}

fn render_application(application: &Application) {
    println!(
        "  {:<20} code {}  duplicate: {}",
        application.applicant.display_name(),
        application.confirmation_code,
        if application.marked_as_duplicate { "yes" } else { "no" }
    );
}

fn render_sets(sets: &[FlaggedSetView]) {
    if sets.is_empty() {
        println!("  none");
        return;
    }
    for set in sets {
        let status = set.status.label();
        let members: Vec<&str> = set
            .applications
            .iter()
            .map(|app| app.confirmation_code.as_str())
            .collect();
        println!(
            "  [{status}] {} rule {}: {}",
            set.id,
            set.rule,
            members.join(", ")
        );
    }
}
