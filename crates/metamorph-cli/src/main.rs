use anyhow::Result;
use clap::{Parser, Subcommand};
use metamorph_core::EntityType;
use metamorph_sync::{coordinator_from_env, PipelineCoordinator};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "metamorph")]
#[command(about = "Metamorph ingestion pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh every registered source and print the refresh summary.
    Refresh,
    /// Refresh, then join transactions with users and products.
    Enrich,
    /// Refresh and enrich, printing both summaries.
    Run,
    /// Run a cycle and print user spend and product popularity.
    Insights,
    /// Print the canonical entities of one type after a refresh.
    Query {
        /// `product`, `user` or `transaction` (plural accepted).
        entity_type: EntityType,
    },
    /// Run a cycle and write parquet snapshots under `reports/<run_id>/`.
    Export,
    /// Serve the JSON API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("metamorph=info,info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Refresh => {
            let coordinator = coordinator_from_env().await?;
            print_json(&coordinator.refresh_all().await?)?;
        }
        Commands::Enrich => {
            let coordinator = coordinator_from_env().await?;
            coordinator.refresh_all().await?;
            print_json(&coordinator.enrich().await?)?;
        }
        Commands::Run => {
            let coordinator = coordinator_from_env().await?;
            let (refresh, enrich) = coordinator.run_cycle().await?;
            print_json(&serde_json::json!({ "refresh": refresh, "enrich": enrich }))?;
        }
        Commands::Insights => {
            let coordinator = cycled_coordinator().await?;
            print_json(&serde_json::json!({
                "user_spend": coordinator.user_insights().await?,
                "product_popularity": coordinator.product_insights().await?,
            }))?;
        }
        Commands::Query { entity_type } => {
            let coordinator = coordinator_from_env().await?;
            coordinator.refresh_all().await?;
            print_json(&coordinator.query(entity_type).await?)?;
        }
        Commands::Export => {
            let coordinator = cycled_coordinator().await?;
            let summary = coordinator.export_reports().await?;
            println!(
                "export complete: run_id={} files={} manifest={}",
                summary.run_id,
                summary.manifest.files.len(),
                summary.manifest_path
            );
        }
        Commands::Serve => {
            metamorph_web::serve_from_env().await?;
        }
    }

    Ok(())
}

/// The store is in-memory, so commands that read derived data run a cycle first.
async fn cycled_coordinator() -> Result<PipelineCoordinator> {
    let coordinator = coordinator_from_env().await?;
    coordinator.run_cycle().await?;
    Ok(coordinator)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
