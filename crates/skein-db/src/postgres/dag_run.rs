//! PostgreSQL implementation of DagRunRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skein_core::instance::DagRun;
use skein_core::ports::DagRunRepository;
use skein_core::state::DagRunState;
use skein_core::{Error, Result};
use sqlx::{PgPool, Row};

use super::{run_state_to_str, str_to_run_state};

/// PostgreSQL implementation of DagRunRepository.
pub struct PgDagRunRepository {
    pool: PgPool,
}

impl PgDagRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_run(r: &sqlx::postgres::PgRow) -> DagRun {
        let state: String = r.get("state");
        DagRun {
            dag_id: r.get("dag_id"),
            execution_date: r.get("execution_date"),
            state: str_to_run_state(&state),
            start_date: r.get("start_date"),
        }
    }
}

#[async_trait]
impl DagRunRepository for PgDagRunRepository {
    async fn create(&self, run: &DagRun) -> Result<bool> {
        let result = sqlx::query(
            r#"INSERT INTO dag_runs (dag_id, execution_date, state, start_date)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (dag_id, execution_date) DO NOTHING"#,
        )
        .bind(&run.dag_id)
        .bind(run.execution_date)
        .bind(run_state_to_str(run.state))
        .bind(run.start_date)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, dag_id: &str, execution_date: DateTime<Utc>) -> Result<Option<DagRun>> {
        let row = sqlx::query(
            "SELECT dag_id, execution_date, state, start_date FROM dag_runs
             WHERE dag_id = $1 AND execution_date = $2",
        )
        .bind(dag_id)
        .bind(execution_date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.map(|r| Self::row_to_run(&r)))
    }

    async fn set_state(
        &self,
        dag_id: &str,
        execution_date: DateTime<Utc>,
        state: DagRunState,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE dag_runs SET state = $3 WHERE dag_id = $1 AND execution_date = $2",
        )
        .bind(dag_id)
        .bind(execution_date)
        .bind(run_state_to_str(state))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn list_running(&self, dag_id: &str) -> Result<Vec<DagRun>> {
        let rows = sqlx::query(
            "SELECT dag_id, execution_date, state, start_date FROM dag_runs
             WHERE dag_id = $1 AND state = 'running'
             ORDER BY execution_date ASC",
        )
        .bind(dag_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.iter().map(Self::row_to_run).collect())
    }

    async fn latest_execution_date(&self, dag_id: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MAX(execution_date) AS latest FROM dag_runs WHERE dag_id = $1",
        )
        .bind(dag_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.get::<Option<DateTime<Utc>>, _>("latest"))
    }
}
