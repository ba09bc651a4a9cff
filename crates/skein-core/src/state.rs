//! Task instance and DAG run states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a single task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Not yet scheduled; also the reset target after a failed dispatch.
    None,
    /// Handed to the executor, holding a pool slot, not yet started.
    Queued,
    Running,
    Success,
    Failed,
    /// Trigger rule became permanently unsatisfiable.
    UpstreamFailed,
    Skipped,
    /// Failed with attempts remaining; waiting out the retry delay.
    /// Does not hold a pool slot.
    UpForRetry,
    /// Externally terminated.
    Shutdown,
}

impl TaskState {
    /// Terminal for the current try. UP_FOR_RETRY is not terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success
                | TaskState::Failed
                | TaskState::UpstreamFailed
                | TaskState::Skipped
                | TaskState::Shutdown
        )
    }

    /// States that hold a pool slot and count against DAG concurrency.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Queued | TaskState::Running)
    }

    /// States eligible for (re)scheduling by the dependency evaluator.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, TaskState::None | TaskState::UpForRetry)
    }

    /// States a trigger rule counts as a successful upstream.
    pub fn counts_as_success(&self) -> bool {
        matches!(self, TaskState::Success)
    }

    /// States a trigger rule counts as a failed upstream.
    pub fn counts_as_failure(&self) -> bool {
        matches!(self, TaskState::Failed | TaskState::UpstreamFailed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::None => "none",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Failed => "failed",
            TaskState::UpstreamFailed => "upstream_failed",
            TaskState::Skipped => "skipped",
            TaskState::UpForRetry => "up_for_retry",
            TaskState::Shutdown => "shutdown",
        };
        write!(f, "{}", s)
    }
}

/// State of one scheduled execution of a DAG.
///
/// Derived from the terminal states of the run's leaf task instances,
/// never set directly except at creation and on job finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DagRunState {
    Running,
    Success,
    Failed,
}

impl DagRunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DagRunState::Success | DagRunState::Failed)
    }
}

impl fmt::Display for DagRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DagRunState::Running => "running",
            DagRunState::Success => "success",
            DagRunState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}
