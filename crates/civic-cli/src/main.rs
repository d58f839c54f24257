use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use civic_core::parse_years_csv;
use civic_query::QueryService;
use civic_sync::{connect_services, maybe_build_scheduler, Settings};
use civic_web::AppState;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "civic-cli")]
#[command(about = "Civic 311 request data service")]
struct Cli {
    /// Settings file; defaults to $CIVIC_SETTINGS or ./civic.yaml when present.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run migrations, start the scheduler if enabled and serve HTTP.
    Serve,
    /// Bring the database schema up to date.
    Migrate,
    /// Backfill whole years from the upstream portal.
    Ingest {
        /// Comma-separated years, e.g. 2015,2016.
        #[arg(long)]
        years: String,
        #[arg(long)]
        query_size: Option<usize>,
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Pull rows changed upstream since the last sync.
    Update {
        #[arg(long)]
        query_size: Option<usize>,
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Remove local rows upstream no longer reports.
    Delete,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing report")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let settings = Settings::load(cli.settings.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let services = connect_services(&settings).await?;
            services.store.migrate().await?;

            let scheduler =
                maybe_build_scheduler(services.engine.clone(), &settings.scheduler).await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
                info!("scheduler started");
            }

            let state = AppState::new(
                services.engine.clone(),
                QueryService::new(services.store.clone()),
            );
            civic_web::serve(&settings.bind_addr(), state).await?;

            if let Some(mut scheduler) = scheduler {
                scheduler.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Migrate => {
            let services = connect_services(&settings).await?;
            services.store.migrate().await?;
        }
        Commands::Ingest {
            years,
            query_size,
            limit,
        } => {
            let years = parse_years_csv(&years)?;
            let services = connect_services(&settings).await?;
            let report = services
                .engine
                .populate_full_database(&years, query_size, limit)
                .await?;
            print_json(&report)?;
            if report.has_failures() {
                bail!("ingestion finished with failed years");
            }
        }
        Commands::Update { query_size, limit } => {
            let services = connect_services(&settings).await?;
            let report = services
                .engine
                .update_at(chrono::Utc::now(), query_size, limit)
                .await?;
            print_json(&report)?;
            if report.has_failures() {
                bail!("incremental sync failed");
            }
        }
        Commands::Delete => {
            let services = connect_services(&settings).await?;
            let report = services.engine.delete().await?;
            print_json(&report)?;
            if let Some(error) = &report.error {
                bail!("reconciliation aborted: {error}");
            }
        }
    }

    Ok(())
}
