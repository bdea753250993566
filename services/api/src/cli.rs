use crate::demo::{run_demo, DemoArgs};
use crate::server;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use housing_portal::error::AppError;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "Housing Portal",
    about = "Run the application intake service or walk through duplicate flagging from the command line",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Run an in-memory walkthrough of submission, flagging, and review
    Demo(DemoArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// Listing accepting applications at startup (random when omitted)
    #[arg(long)]
    pub(crate) listing_id: Option<Uuid>,
    /// Display name of the seeded listing
    #[arg(long, default_value = "Community Listing")]
    pub(crate) listing_name: String,
    /// Application due date of the seeded listing (RFC 3339)
    #[arg(long, value_parser = crate::infra::parse_timestamp)]
    pub(crate) due_date: Option<DateTime<Utc>>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Demo(args) => run_demo(args).await,
    }
}
