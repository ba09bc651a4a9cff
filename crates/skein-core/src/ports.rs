//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduling core and
//! external adapters: the persistence layer, the executor, and the
//! operator implementations that actually run task logic.

use crate::instance::{DagRun, TaskInstance, TaskInstanceKey};
use crate::pool::Pool;
use crate::state::{DagRunState, TaskState};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Repository for DAG runs.
///
/// `create` is a unique-key insert on (dag_id, execution_date): two
/// concurrent schedulers racing to create the same run is expected, and
/// the loser observes `false` rather than an error.
#[async_trait]
pub trait DagRunRepository: Send + Sync {
    /// Insert the run if no run exists for its key. Returns whether the
    /// insert happened.
    async fn create(&self, run: &DagRun) -> Result<bool>;

    /// Get a run by key.
    async fn get(&self, dag_id: &str, execution_date: DateTime<Utc>) -> Result<Option<DagRun>>;

    /// Set a run's state (creation and job finalization only; the state
    /// is otherwise derived from task instances).
    async fn set_state(
        &self,
        dag_id: &str,
        execution_date: DateTime<Utc>,
        state: DagRunState,
    ) -> Result<()>;

    /// Runs of a DAG still in RUNNING state.
    async fn list_running(&self, dag_id: &str) -> Result<Vec<DagRun>>;

    /// Latest execution date for which a run exists, if any.
    async fn latest_execution_date(&self, dag_id: &str) -> Result<Option<DateTime<Utc>>>;
}

/// Repository for task instances.
///
/// All state-changing reads-decide-writes in the scheduling loops go
/// through `update_if_state`, a compare-and-swap on the current state, so
/// two cooperating scheduler instances cannot double-dispatch the same
/// instance.
#[async_trait]
pub trait TaskInstanceRepository: Send + Sync {
    /// Get an instance by key.
    async fn get(&self, key: &TaskInstanceKey) -> Result<Option<TaskInstance>>;

    /// Insert the instance if its key is absent (lazy creation on first
    /// evaluation). Returns whether the insert happened.
    async fn insert_if_absent(&self, instance: &TaskInstance) -> Result<bool>;

    /// Write the full instance row iff its persisted state equals
    /// `expected`. Returns whether the write happened.
    async fn update_if_state(
        &self,
        instance: &TaskInstance,
        expected: TaskState,
    ) -> Result<bool>;

    /// All instances belonging to one DAG run.
    async fn list_for_run(
        &self,
        dag_id: &str,
        execution_date: DateTime<Utc>,
    ) -> Result<Vec<TaskInstance>>;

    /// The task's instance for the latest execution date strictly before
    /// `before`, used by the depends-on-past check.
    async fn get_previous(
        &self,
        dag_id: &str,
        task_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<TaskInstance>>;

    /// Count of QUEUED + RUNNING instances across one DAG.
    async fn count_active(&self, dag_id: &str) -> Result<usize>;

    /// All QUEUED + RUNNING instances, across all DAGs. Used for stale
    /// executor recovery and shutdown handling.
    async fn list_active(&self) -> Result<Vec<TaskInstance>>;
}

/// Repository for resource pools.
#[async_trait]
pub trait PoolRepository: Send + Sync {
    async fn upsert(&self, pool: &Pool) -> Result<()>;

    async fn get(&self, name: &str) -> Result<Option<Pool>>;

    async fn list(&self) -> Result<Vec<Pool>>;

    /// Atomically check and increment `used_slots` if capacity remains.
    /// Linearizable across concurrent callers. Returns whether a slot
    /// was acquired; unknown pools acquire nothing and return `false`
    /// (the pool manager applies the fail-open default before calling).
    async fn try_acquire(&self, name: &str) -> Result<bool>;

    /// Decrement `used_slots`, saturating at zero. Unknown pools are a
    /// no-op.
    async fn release(&self, name: &str) -> Result<()>;
}

/// What the scheduler hands to an executor for one task instance try.
#[derive(Debug, Clone)]
pub struct TaskPayload {
    pub key: TaskInstanceKey,
    pub kind: String,
    pub command: Option<String>,
    pub try_number: u32,
}

/// Executor's answer to a dispatch request.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Accepted,
    Rejected(String),
}

/// Terminal outcome of one task instance try.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success,
    Failed(String),
}

/// Completion-report events observed by polling the executor.
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    Started(TaskInstanceKey),
    Finished(TaskInstanceKey, TaskOutcome),
}

/// Abstraction over out-of-process task execution.
///
/// The scheduling loops never block on execution: they dispatch, then
/// observe progress through `poll_events`. Implementations range from an
/// in-process sequential executor to a distributed worker pool.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn dispatch(&self, payload: TaskPayload) -> Result<DispatchOutcome>;

    /// Drain pending start/finish events since the last poll.
    async fn poll_events(&self) -> Result<Vec<ExecutorEvent>>;

    /// Liveness probe. A stalled executor causes its in-flight instances
    /// to be returned to NONE for re-evaluation.
    async fn is_alive(&self) -> bool;
}

/// Context handed to an operator for one try.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub key: TaskInstanceKey,
    pub try_number: u32,
    pub command: Option<String>,
}

/// Capability interface for task logic. New task kinds are added by
/// registering implementations, not by modifying the scheduler.
#[async_trait]
pub trait TaskExecutable: Send + Sync {
    async fn run(&self, ctx: &TaskContext) -> Result<()>;
}
