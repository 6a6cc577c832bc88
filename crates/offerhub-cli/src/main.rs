use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use offerhub_core::{OfferCategory, TipCategory};
use offerhub_storage::VersionedStore;
use offerhub_sync::{Catalog, IngestionService, LogFormat, SyncConfig};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "offerhub")]
#[command(about = "Card offer ingestion hub")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion cycle over every enabled source.
    Run {
        /// Only fetch this source.
        #[arg(long)]
        source: Option<String>,
        /// Print a markdown brief instead of JSON.
        #[arg(long)]
        markdown: bool,
    },
    /// Show the report of the last cycle.
    Stats {
        #[arg(long)]
        markdown: bool,
    },
    /// List canonical entities.
    List {
        #[command(subcommand)]
        what: ListCommands,
    },
    /// Show the change log.
    History,
    /// Commit the content of an earlier version as a new version.
    Revert {
        version: u64,
        #[arg(long)]
        message: Option<String>,
    },
    /// Run cycles on the configured cron schedule until interrupted.
    Schedule,
}

#[derive(Debug, Subcommand)]
enum ListCommands {
    Offers {
        #[arg(long)]
        category: Option<String>,
        /// Include inactive offers.
        #[arg(long)]
        all: bool,
    },
    Benefits {
        #[arg(long)]
        card: Option<String>,
    },
    Redemptions {
        #[arg(long)]
        available: bool,
    },
    Tips {
        #[arg(long)]
        category: Option<String>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(std::io::stderr)).init(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    init_tracing(config.log_format);

    let command = cli.command.unwrap_or(Commands::Run {
        source: None,
        markdown: false,
    });
    match command {
        Commands::Run { source, markdown } => {
            let service = IngestionService::from_config(config).await?;
            let report = match source.as_deref() {
                Some(name) => service.run_cycle_for(name).await?,
                None => service.run_cycle().await?,
            };
            if let Some(handle) = service.take_publish_handle().await {
                let status = handle.wait().await;
                info!(?status, "publish finished");
            }
            if markdown {
                print!("{}", report.to_markdown());
            } else {
                print_json(&report)?;
            }
        }
        Commands::Stats { markdown } => {
            let catalog = Catalog::new(VersionedStore::new(config.store_dir));
            match catalog.get_stats().await? {
                Some(report) if markdown => print!("{}", report.to_markdown()),
                Some(report) => print_json(&report)?,
                None => eprintln!("no ingestion cycle has run against this store yet"),
            }
        }
        Commands::List { what } => {
            let catalog = Catalog::new(VersionedStore::new(config.store_dir));
            match what {
                ListCommands::Offers { category, all } => {
                    let category = category.as_deref().map(OfferCategory::from_loose);
                    print_json(&catalog.list_offers(category, !all).await?)?
                }
                ListCommands::Benefits { card } => print_json(&catalog.list_benefits(card.as_deref()).await?)?,
                ListCommands::Redemptions { available } => {
                    print_json(&catalog.list_redemption_options(available).await?)?
                }
                ListCommands::Tips { category } => {
                    let category = category.as_deref().map(TipCategory::from_loose);
                    print_json(&catalog.list_travel_tips(category).await?)?
                }
            }
        }
        Commands::History => {
            let store = VersionedStore::new(config.store_dir);
            print_json(&store.history().await?)?;
        }
        Commands::Revert { version, message } => {
            let store = VersionedStore::new(config.store_dir);
            let message = message.unwrap_or_else(|| format!("Revert to version {version}"));
            let entry = store.revert(version, &message).await?;
            info!(from = version, to = entry.version, "store reverted");
            print_json(&entry)?;
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let cron = config.sync_cron.clone();
            let service = std::sync::Arc::new(IngestionService::from_config(config).await?);
            let mut sched = service
                .maybe_build_scheduler()
                .await?
                .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
