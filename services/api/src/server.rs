use crate::cli::ServeArgs;
use crate::infra::{seeded_listing, AppState, LoggingNotifier};
use crate::routes::with_application_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use housing_portal::config::AppConfig;
use housing_portal::error::AppError;
use housing_portal::telemetry;
use housing_portal::workflows::applications::{
    ApplicationGateway, ListingId, MemoryDatabase, MemoryListingDirectory, PgFlaggingDatabase,
    PgListingDirectory,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let listing = seeded_listing(
        args.listing_id.map(ListingId),
        &args.listing_name,
        args.due_date,
    );
    let notifier = Arc::new(LoggingNotifier);

    let router = match config.database.url.as_deref() {
        Some(url) => {
            let database =
                PgFlaggingDatabase::connect(url, config.database.max_connections).await?;
            database.migrate().await?;
            let listings = PgListingDirectory::new(database.pool().clone());
            listings.upsert(&listing).await?;
            info!(backend = "postgres", "flagged-set storage connected");
            let gateway = ApplicationGateway::new(
                Arc::new(database),
                Arc::new(listings),
                notifier,
                &config.flagging,
            );
            with_application_routes(Arc::new(gateway))
        }
        None => {
            let listings = MemoryListingDirectory::with_listings([listing.clone()]);
            info!(backend = "memory", "flagged-set storage initialised");
            let gateway = ApplicationGateway::new(
                Arc::new(MemoryDatabase::new()),
                Arc::new(listings),
                notifier,
                &config.flagging,
            );
            with_application_routes(Arc::new(gateway))
        }
    };

    let app = router
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        listing_id = %listing.id,
        rules = ?config.flagging.rules,
        "housing portal ready"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
