//! Error types for Skein.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // DAG load errors
    #[error("DAG has no tasks: {0}")]
    EmptyDag(String),

    #[error("Duplicate task `{task}` in DAG `{dag}`")]
    DuplicateTask { dag: String, task: String },

    #[error("Unknown upstream `{upstream}` for task `{task}` in DAG `{dag}`")]
    UnknownDependency {
        dag: String,
        task: String,
        upstream: String,
    },

    #[error("Cycle detected in task dependencies of DAG `{0}`")]
    DagCycle(String),

    #[error("Invalid schedule for DAG `{dag}`: {reason}")]
    InvalidSchedule { dag: String, reason: String },

    // Lookup errors
    #[error("DAG not found: {0}")]
    DagNotFound(String),

    #[error("Task not found: {dag}.{task}")]
    TaskNotFound { dag: String, task: String },

    #[error("No operator registered for task kind: {0}")]
    UnknownOperator(String),

    // Task-level failure
    #[error("Task execution failed: {0}")]
    TaskFailed(String),

    // Structural failures (fatal, never silent)
    #[error("BackfillJob is deadlocked; blocked instances: {instances}")]
    BackfillDeadlocked { instances: String },

    #[error("BackfillJob finished with failed instances: {instances}")]
    BackfillFailed { instances: String },

    // Infrastructure errors
    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
