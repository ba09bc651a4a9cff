//! Skein CLI entrypoint.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;
mod loader;

use commands::{Commands, ConfigCommands, PoolCommands};
use config::CliConfig;
use skein_scheduler::BackfillOptions;

#[derive(Parser)]
#[command(name = "skein")]
#[command(author, version, about = "Skein workflow scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = CliConfig::load().unwrap_or_default();

    match cli.command {
        Commands::Scheduler {
            dags_dir,
            database_url,
            tick,
        } => handlers::scheduler(&config, dags_dir, database_url, tick).await?,
        Commands::Backfill {
            dag_id,
            start,
            end,
            dags_dir,
            database_url,
            ignore_first_depends_on_past,
            ignore_task_deps,
            reset_dag_runs,
        } => {
            let options = BackfillOptions {
                ignore_first_depends_on_past,
                ignore_task_deps,
                reset_dag_runs,
                ..BackfillOptions::default()
            };
            handlers::backfill(&config, &dag_id, start, end, dags_dir, database_url, options)
                .await?
        }
        Commands::Validate { path } => handlers::validate(&path).await?,
        Commands::Pools { command } => match command {
            PoolCommands::List { database_url } => {
                handlers::list_pools(&config, database_url).await?
            }
            PoolCommands::Set {
                name,
                slots,
                database_url,
            } => handlers::set_pool(&config, &name, slots, database_url).await?,
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
        },
    }

    Ok(())
}
