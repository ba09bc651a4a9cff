//! Command handlers.

use crate::config::CliConfig;
use crate::loader::{self, DagBag};
use chrono::{DateTime, NaiveDate, Utc};
use console::style;
use skein_core::pool::Pool;
use skein_core::ports::{Executor, PoolRepository};
use skein_db::{
    Database, MemoryStateStore, PgDagRunRepository, PgPoolRepository, PgTaskInstanceRepository,
};
use skein_executor::{LocalExecutor, OperatorRegistry};
use skein_scheduler::{
    BackfillJob, BackfillOptions, JobContext, PoolManager, SchedulerConfig, SchedulerJob,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Accepts `YYYY-MM-DD` (midnight UTC) or a full RFC 3339 timestamp.
pub fn parse_date(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| format!("expected YYYY-MM-DD or RFC 3339, got `{}`", s))?;
    match date.and_hms_opt(0, 0, 0) {
        Some(dt) => Ok(dt.and_utc()),
        None => Err(format!("invalid date `{}`", s)),
    }
}

/// Run the live scheduler until interrupted.
pub async fn scheduler(
    config: &CliConfig,
    dags_dir: Option<String>,
    database_url: Option<String>,
    tick: Option<u64>,
) -> CliResult {
    let dir = dags_dir.unwrap_or_else(|| config.dags_dir.clone());
    let bag = DagBag::load_dir(Path::new(&dir))?;
    report_import_errors(&bag);
    if bag.dags.is_empty() {
        return Err(format!("no DAGs found under {}", dir).into());
    }

    let ctx = build_context(
        database_url.as_deref().or(config.database_url.as_deref()),
        config.parallelism,
    )
    .await?;
    let scheduler_config = SchedulerConfig {
        tick: Duration::from_secs(tick.unwrap_or(config.tick_secs)),
        heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
    };

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = tx.send(true);
        }
    });

    let mut job = SchedulerJob::new(ctx, bag.dags, scheduler_config, rx);
    job.run().await?;
    Ok(())
}

/// Run one DAG over a date range to completion.
#[allow(clippy::too_many_arguments)]
pub async fn backfill(
    config: &CliConfig,
    dag_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    dags_dir: Option<String>,
    database_url: Option<String>,
    options: BackfillOptions,
) -> CliResult {
    let dir = dags_dir.unwrap_or_else(|| config.dags_dir.clone());
    let bag = DagBag::load_dir(Path::new(&dir))?;
    report_import_errors(&bag);
    let dag = bag.get(dag_id)?.clone();

    let ctx = build_context(
        database_url.as_deref().or(config.database_url.as_deref()),
        config.parallelism,
    )
    .await?;

    println!(
        "{} Backfilling {} from {} to {}",
        style("▶").cyan(),
        style(dag_id).bold(),
        start.to_rfc3339(),
        end.to_rfc3339()
    );

    BackfillJob::new(ctx, dag, start, end, options).run().await?;
    println!("{} Backfill complete", style("✓").green());
    Ok(())
}

/// Validate one DAG file, or every definition file under a directory.
pub async fn validate(path: &str) -> CliResult {
    let path = Path::new(path);

    if path.is_dir() {
        let bag = DagBag::load_dir(path)?;
        for dag in &bag.dags {
            print_dag_summary(dag);
        }
        for (file, error) in &bag.import_errors {
            println!("{} {}: {}", style("✗").red(), file, error);
        }
        if !bag.import_errors.is_empty() {
            return Err(format!("{} file(s) failed validation", bag.import_errors.len()).into());
        }
        return Ok(());
    }

    let dag = loader::load_file(path)?;
    print_dag_summary(&dag);
    Ok(())
}

fn print_dag_summary(dag: &skein_core::dag::Dag) {
    println!(
        "{} DAG \"{}\" is valid ({} tasks, {} roots, {} leaves)",
        style("✓").green(),
        dag.id,
        dag.task_count(),
        dag.roots().len(),
        dag.leaves().len()
    );
}

/// List pools and slot usage.
pub async fn list_pools(config: &CliConfig, database_url: Option<String>) -> CliResult {
    let repo =
        pg_pool_repository(database_url.as_deref().or(config.database_url.as_deref())).await?;
    let pools = repo.list().await?;
    if pools.is_empty() {
        println!("{} No pools defined", style("i").blue());
        return Ok(());
    }
    for pool in pools {
        println!(
            "{:<24} {:>4} used / {:>4} total",
            pool.name, pool.used_slots, pool.total_slots
        );
    }
    Ok(())
}

/// Create or resize a pool.
pub async fn set_pool(
    config: &CliConfig,
    name: &str,
    slots: u32,
    database_url: Option<String>,
) -> CliResult {
    let repo =
        pg_pool_repository(database_url.as_deref().or(config.database_url.as_deref())).await?;
    repo.upsert(&Pool::new(name, slots)).await?;
    println!("{} Pool {} set to {} slots", style("✓").green(), name, slots);
    Ok(())
}

/// Show current configuration.
pub fn show_config(config: &CliConfig) -> CliResult {
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

/// Set a configuration value.
pub fn set_config(key: &str, value: &str) -> CliResult {
    let mut config = CliConfig::load()?;
    config.set(key, value)?;
    config.save()?;
    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

fn report_import_errors(bag: &DagBag) {
    for (file, error) in &bag.import_errors {
        eprintln!("{} {}: {}", style("!").yellow(), file, error);
    }
}

/// Pools live in the database; an ephemeral in-memory listing would be
/// meaningless, so the pool commands require a connection string.
async fn pg_pool_repository(
    database_url: Option<&str>,
) -> Result<PgPoolRepository, Box<dyn std::error::Error>> {
    let url = database_url.ok_or(
        "pool management requires a database; pass --database-url or set database_url in the config",
    )?;
    let db = Database::connect(url).await?;
    db.migrate().await?;
    Ok(PgPoolRepository::new(db.pool().clone()))
}

/// Wire up repositories and the executor: PostgreSQL when a connection
/// string is given, otherwise the in-memory store.
async fn build_context(
    database_url: Option<&str>,
    parallelism: usize,
) -> Result<JobContext, Box<dyn std::error::Error>> {
    let registry = Arc::new(OperatorRegistry::with_builtins());
    let executor: Arc<dyn Executor> = Arc::new(LocalExecutor::new(registry, parallelism));

    match database_url {
        Some(url) => {
            let db = Database::connect(url).await?;
            db.migrate().await?;
            let pool = db.pool().clone();
            Ok(JobContext::new(
                Arc::new(PgDagRunRepository::new(pool.clone())),
                Arc::new(PgTaskInstanceRepository::new(pool.clone())),
                PoolManager::new(Arc::new(PgPoolRepository::new(pool))),
                executor,
            ))
        }
        None => {
            info!("No database configured, using in-memory state");
            let store = MemoryStateStore::new();
            Ok(JobContext::new(
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                PoolManager::new(Arc::new(store)),
                executor,
            ))
        }
    }
}
