//! Persisted scheduling entities: task instances and DAG runs.

use crate::state::{DagRunState, TaskState};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique key of a task instance: one task's execution attempt within a
/// DAG run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskInstanceKey {
    pub dag_id: String,
    pub task_id: String,
    pub execution_date: DateTime<Utc>,
}

impl TaskInstanceKey {
    pub fn new(
        dag_id: impl Into<String>,
        task_id: impl Into<String>,
        execution_date: DateTime<Utc>,
    ) -> Self {
        Self {
            dag_id: dag_id.into(),
            task_id: task_id.into(),
            execution_date,
        }
    }
}

impl fmt::Display for TaskInstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} @ {}",
            self.dag_id,
            self.task_id,
            self.execution_date.to_rfc3339()
        )
    }
}

/// One task's execution attempt within a DagRun. Created lazily the first
/// time it is evaluated; mutated only by the scheduling loops and the
/// executor's completion reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub key: TaskInstanceKey,
    pub state: TaskState,
    /// Incremented only on the UP_FOR_RETRY -> QUEUED re-queue.
    pub try_number: u32,
    /// Pool the instance runs against, copied from the task at creation.
    pub pool: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl TaskInstance {
    pub fn new(key: TaskInstanceKey, pool: Option<String>) -> Self {
        Self {
            key,
            state: TaskState::None,
            try_number: 0,
            pool,
            start_date: None,
            end_date: None,
        }
    }

    /// Whether the retry delay has elapsed for an UP_FOR_RETRY instance.
    pub fn retry_ready(&self, retry_delay: Duration, now: DateTime<Utc>) -> bool {
        match self.end_date {
            Some(ended) => ended + retry_delay <= now,
            None => true,
        }
    }
}

/// One scheduled execution of a DAG for a specific execution date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagRun {
    pub dag_id: String,
    pub execution_date: DateTime<Utc>,
    pub state: DagRunState,
    pub start_date: DateTime<Utc>,
}

impl DagRun {
    pub fn new(dag_id: impl Into<String>, execution_date: DateTime<Utc>) -> Self {
        Self {
            dag_id: dag_id.into(),
            execution_date,
            state: DagRunState::Running,
            start_date: Utc::now(),
        }
    }
}

/// Pure aggregation of a run's state from the states of its leaf
/// (no-downstream) task instances. Idempotent and re-derivable at any
/// evaluation cycle.
pub fn derive_run_state(leaf_states: &[TaskState]) -> DagRunState {
    if leaf_states.is_empty() {
        return DagRunState::Running;
    }
    let any_pending = leaf_states.iter().any(|s| !s.is_terminal());
    let all_succeeded = leaf_states
        .iter()
        .all(|s| matches!(s, TaskState::Success | TaskState::Skipped));
    let any_failed = leaf_states.iter().any(|s| s.counts_as_failure());

    if all_succeeded {
        DagRunState::Success
    } else if any_failed && !any_pending {
        DagRunState::Failed
    } else {
        DagRunState::Running
    }
}
