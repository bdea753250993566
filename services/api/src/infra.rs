use async_trait::async_trait;
use chrono::{DateTime, Utc};
use housing_portal::workflows::applications::{
    Application, ConfirmationNotifier, ListingId, ListingSnapshot, NotificationError,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

const DEFAULT_LISTING_NAME: &str = "Community Listing";

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Stands in for the e-mail collaborator: confirmation hand-offs are written to the log.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LoggingNotifier;

#[async_trait]
impl ConfirmationNotifier for LoggingNotifier {
    async fn confirmation(
        &self,
        listing: &ListingSnapshot,
        application: &Application,
        app_url: Option<&str>,
    ) -> Result<(), NotificationError> {
        info!(
            listing_id = %listing.id,
            listing = %listing.name,
            application_id = %application.id,
            confirmation_code = %application.confirmation_code,
            app_url = app_url.unwrap_or_default(),
            "confirmation queued for delivery"
        );
        Ok(())
    }
}

pub(crate) fn seeded_listing(
    id: Option<ListingId>,
    name: &str,
    due_date: Option<DateTime<Utc>>,
) -> ListingSnapshot {
    let name = name.trim();
    ListingSnapshot {
        id: id.unwrap_or_default(),
        name: if name.is_empty() {
            DEFAULT_LISTING_NAME.to_string()
        } else {
            name.to_string()
        },
        application_due_date: due_date,
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| format!("failed to parse '{raw}' as an RFC 3339 timestamp ({err})"))
}
