use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use forward_engine::{
    commands::{init_db, rebuild_positions, report, serve, sync_orders},
    context::AppContext,
};
use log::info;
use std::env;

#[derive(Parser)]
#[command(name = "forward-engine")]
#[command(about = "Signal-to-fill reconciliation and strategy performance engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook server, broker stream and periodic order sync
    Serve,
    /// Reconcile local orders against broker state once and exit
    SyncOrders,
    /// Rebuild derived positions and round trips from the fill ledger
    RebuildPositions,
    /// Print the performance report for one strategy (or all strategies)
    Report {
        /// Strategy to report on; omit for all strategies
        strategy_id: Option<String>,
    },
    /// Create the database schema
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let Cli { command } = cli;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let database_url = env::var("DATABASE_URL").ok();
    if database_url.is_none() {
        return Err(anyhow!("DATABASE_URL must be set for this command."));
    }
    let app_context = AppContext::initialize(database_url);

    info!("Starting forward-engine. Forward-test results are not financial advice.");

    match command {
        Commands::Serve => {
            serve::run(&app_context).await?;
        }
        Commands::SyncOrders => {
            sync_orders::run(&app_context).await?;
        }
        Commands::RebuildPositions => {
            rebuild_positions::run(&app_context).await?;
        }
        Commands::Report { strategy_id } => {
            report::run(&app_context, strategy_id.as_deref()).await?;
        }
        Commands::InitDb => {
            init_db::run(&app_context).await?;
        }
    }

    Ok(())
}
