use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tfp_sync::{
    build_scheduler, dump_once, import_from_files, ImportFiles, Store, SyncConfig, SyncPipeline,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tfp")]
#[command(about = "Mirror the TFP Airtable base and serve representative search")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, dump, and import every table once.
    Sync,
    /// Fetch and write table dumps without touching the database.
    Dump,
    /// Import previously written dump files.
    Import {
        #[arg(long)]
        state_reps_file: PathBuf,
        #[arg(long)]
        national_reps_file: Option<PathBuf>,
        #[arg(long)]
        negative_bills_file: Option<PathBuf>,
        #[arg(long)]
        skip_relations: bool,
    },
    /// Create tables and indexes.
    Migrate,
    /// Serve the search API.
    Serve,
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
}

async fn connect_store(config: &SyncConfig) -> Result<Store> {
    let store = Store::connect(&config.store_config())
        .await
        .context("connecting to store")?;
    store.migrate().await.context("migrating store")?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = tfp_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} reps={} bills={} relations={}",
                summary.run_id,
                summary.import.reps.accepted(),
                summary.import.bills.accepted(),
                summary
                    .import
                    .relations
                    .as_ref()
                    .map(|r| r.total_inserted())
                    .unwrap_or_default()
            );
        }
        Commands::Dump => {
            for dump in dump_once(&config).await? {
                println!("{} {} records -> {}", dump.table, dump.record_count, dump.path.display());
            }
        }
        Commands::Import {
            state_reps_file,
            national_reps_file,
            negative_bills_file,
            skip_relations,
        } => {
            let store = connect_store(&config).await?;
            let files = ImportFiles {
                state_reps: state_reps_file,
                national_reps: national_reps_file,
                negative_bills: negative_bills_file,
            };
            let summary = import_from_files(&store, &files, !skip_relations).await?;
            println!("{}", import_line(&summary));
        }
        Commands::Migrate => {
            connect_store(&config).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            tfp_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::new(config).await?);
            let Some(mut sched) = build_scheduler(pipeline).await? else {
                anyhow::bail!("scheduler disabled; set TFP_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn import_line(summary: &tfp_sync::ImportSummary) -> String {
    format!(
        "import complete: reps inserted={} updated={} skipped={} rejected={}; bills inserted={} updated={} skipped={} rejected={}; relations inserted={}",
        summary.reps.inserted,
        summary.reps.updated,
        summary.reps.skipped,
        summary.reps.rejected,
        summary.bills.inserted,
        summary.bills.updated,
        summary.bills.skipped,
        summary.bills.rejected,
        summary
            .relations
            .as_ref()
            .map(|r| r.total_inserted())
            .unwrap_or_default()
    )
}
