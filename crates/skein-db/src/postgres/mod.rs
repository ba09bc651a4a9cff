//! PostgreSQL state store.
//!
//! Optimistic concurrency throughout: unique-key inserts for DagRuns,
//! `UPDATE ... WHERE state = $expected` compare-and-swap for task
//! instances, and a guarded counter update for pool slots. No
//! coarse-grained locks, so cooperating scheduler replicas stay
//! responsive.

mod dag_run;
mod pool;
mod task_instance;

pub use dag_run::PgDagRunRepository;
pub use pool::PgPoolRepository;
pub use task_instance::PgTaskInstanceRepository;

use skein_core::state::{DagRunState, TaskState};
use skein_core::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}

pub(crate) fn task_state_to_str(state: TaskState) -> &'static str {
    match state {
        TaskState::None => "none",
        TaskState::Queued => "queued",
        TaskState::Running => "running",
        TaskState::Success => "success",
        TaskState::Failed => "failed",
        TaskState::UpstreamFailed => "upstream_failed",
        TaskState::Skipped => "skipped",
        TaskState::UpForRetry => "up_for_retry",
        TaskState::Shutdown => "shutdown",
    }
}

pub(crate) fn str_to_task_state(s: &str) -> TaskState {
    match s {
        "queued" => TaskState::Queued,
        "running" => TaskState::Running,
        "success" => TaskState::Success,
        "failed" => TaskState::Failed,
        "upstream_failed" => TaskState::UpstreamFailed,
        "skipped" => TaskState::Skipped,
        "up_for_retry" => TaskState::UpForRetry,
        "shutdown" => TaskState::Shutdown,
        _ => TaskState::None,
    }
}

pub(crate) fn run_state_to_str(state: DagRunState) -> &'static str {
    match state {
        DagRunState::Running => "running",
        DagRunState::Success => "success",
        DagRunState::Failed => "failed",
    }
}

pub(crate) fn str_to_run_state(s: &str) -> DagRunState {
    match s {
        "success" => DagRunState::Success,
        "failed" => DagRunState::Failed,
        _ => DagRunState::Running,
    }
}
