//! PostgreSQL implementation of TaskInstanceRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skein_core::instance::{TaskInstance, TaskInstanceKey};
use skein_core::ports::TaskInstanceRepository;
use skein_core::state::TaskState;
use skein_core::{Error, Result};
use sqlx::{PgPool, Row};

use super::{str_to_task_state, task_state_to_str};

const COLUMNS: &str =
    "dag_id, task_id, execution_date, state, try_number, pool, start_date, end_date";

/// PostgreSQL implementation of TaskInstanceRepository.
pub struct PgTaskInstanceRepository {
    pool: PgPool,
}

impl PgTaskInstanceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_instance(r: &sqlx::postgres::PgRow) -> TaskInstance {
        let state: String = r.get("state");
        TaskInstance {
            key: TaskInstanceKey {
                dag_id: r.get("dag_id"),
                task_id: r.get("task_id"),
                execution_date: r.get("execution_date"),
            },
            state: str_to_task_state(&state),
            try_number: r.get::<i32, _>("try_number") as u32,
            pool: r.get("pool"),
            start_date: r.get("start_date"),
            end_date: r.get("end_date"),
        }
    }
}

#[async_trait]
impl TaskInstanceRepository for PgTaskInstanceRepository {
    async fn get(&self, key: &TaskInstanceKey) -> Result<Option<TaskInstance>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM task_instances
             WHERE dag_id = $1 AND task_id = $2 AND execution_date = $3"
        ))
        .bind(&key.dag_id)
        .bind(&key.task_id)
        .bind(key.execution_date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.map(|r| Self::row_to_instance(&r)))
    }

    async fn insert_if_absent(&self, instance: &TaskInstance) -> Result<bool> {
        let result = sqlx::query(
            r#"INSERT INTO task_instances
               (dag_id, task_id, execution_date, state, try_number, pool, start_date, end_date)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (dag_id, task_id, execution_date) DO NOTHING"#,
        )
        .bind(&instance.key.dag_id)
        .bind(&instance.key.task_id)
        .bind(instance.key.execution_date)
        .bind(task_state_to_str(instance.state))
        .bind(instance.try_number as i32)
        .bind(&instance.pool)
        .bind(instance.start_date)
        .bind(instance.end_date)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_if_state(
        &self,
        instance: &TaskInstance,
        expected: TaskState,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE task_instances
               SET state = $4, try_number = $5, pool = $6, start_date = $7, end_date = $8
               WHERE dag_id = $1 AND task_id = $2 AND execution_date = $3 AND state = $9"#,
        )
        .bind(&instance.key.dag_id)
        .bind(&instance.key.task_id)
        .bind(instance.key.execution_date)
        .bind(task_state_to_str(instance.state))
        .bind(instance.try_number as i32)
        .bind(&instance.pool)
        .bind(instance.start_date)
        .bind(instance.end_date)
        .bind(task_state_to_str(expected))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_for_run(
        &self,
        dag_id: &str,
        execution_date: DateTime<Utc>,
    ) -> Result<Vec<TaskInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM task_instances
             WHERE dag_id = $1 AND execution_date = $2
             ORDER BY task_id ASC"
        ))
        .bind(dag_id)
        .bind(execution_date)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.iter().map(Self::row_to_instance).collect())
    }

    async fn get_previous(
        &self,
        dag_id: &str,
        task_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<TaskInstance>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM task_instances
             WHERE dag_id = $1 AND task_id = $2 AND execution_date < $3
             ORDER BY execution_date DESC
             LIMIT 1"
        ))
        .bind(dag_id)
        .bind(task_id)
        .bind(before)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.map(|r| Self::row_to_instance(&r)))
    }

    async fn count_active(&self, dag_id: &str) -> Result<usize> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS active FROM task_instances
             WHERE dag_id = $1 AND state IN ('queued', 'running')",
        )
        .bind(dag_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.get::<i64, _>("active") as usize)
    }

    async fn list_active(&self) -> Result<Vec<TaskInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM task_instances WHERE state IN ('queued', 'running')"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.iter().map(Self::row_to_instance).collect())
    }
}
