//! Backfill: run one DAG over a bounded date range to completion.
//!
//! Runs are created up front for every schedule point in the range,
//! oldest first, then the evaluation cycle loops until every instance is
//! terminal. A cycle that makes no progress while nothing is queued,
//! running, or waiting on a retry delay is a deadlock; the affected runs
//! are failed and the blocked instances reported.

use crate::context::JobContext;
use crate::deps::{self, EvalOptions};
use chrono::{DateTime, Utc};
use skein_core::dag::Dag;
use skein_core::instance::{DagRun, TaskInstance, TaskInstanceKey};
use skein_core::state::{DagRunState, TaskState};
use skein_core::{Error, Result};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    /// Waive depends-on-past for the earliest execution date in the
    /// range, so a backfill can start from the middle of history.
    pub ignore_first_depends_on_past: bool,
    /// Waive trigger-rule and depends-on-past checks for every instance.
    pub ignore_task_deps: bool,
    /// Reset already-existing runs in the range back to RUNNING with all
    /// their instances returned to NONE.
    pub reset_dag_runs: bool,
    /// Give up if no instance makes progress for this long.
    pub ti_wait_timeout: Option<Duration>,
    /// Sleep between evaluation cycles when nothing progressed.
    pub tick: Duration,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            ignore_first_depends_on_past: false,
            ignore_task_deps: false,
            reset_dag_runs: false,
            ti_wait_timeout: None,
            tick: Duration::from_millis(50),
        }
    }
}

pub struct BackfillJob {
    ctx: JobContext,
    dag: Dag,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    options: BackfillOptions,
}

impl BackfillJob {
    pub fn new(
        ctx: JobContext,
        dag: Dag,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        options: BackfillOptions,
    ) -> Self {
        Self {
            ctx,
            dag,
            start,
            end,
            options,
        }
    }

    /// Run the backfill to completion. Returns an error if the range
    /// deadlocks or finishes with failed instances.
    pub async fn run(&self) -> Result<()> {
        let dates = self.execution_dates();
        if dates.is_empty() {
            warn!(
                dag = %self.dag.id,
                start = %self.start.to_rfc3339(),
                end = %self.end.to_rfc3339(),
                "No schedule points in backfill range"
            );
            return Ok(());
        }
        let first_date = dates[0];

        info!(dag = %self.dag.id, runs = dates.len(), "Starting backfill");
        for date in &dates {
            self.prepare_run(*date).await?;
        }

        let dag_index: HashMap<&str, &Dag> =
            HashMap::from([(self.dag.id.as_str(), &self.dag)]);
        let mut stalled_for = Duration::ZERO;

        loop {
            let now = Utc::now();
            let mut progress = 0usize;
            let mut blocked: Vec<(TaskInstanceKey, String)> = Vec::new();

            for date in &dates {
                let Some(run) = self.ctx.dag_runs.get(&self.dag.id, *date).await? else {
                    continue;
                };
                if run.state.is_terminal() {
                    continue;
                }

                let options = EvalOptions {
                    ignore_task_deps: self.options.ignore_task_deps,
                    ignore_depends_on_past: self.options.ignore_first_depends_on_past
                        && *date == first_date,
                };
                let mut pass = self.ctx.evaluate_run(&self.dag, &run, options, now).await?;
                progress += pass.transitions;
                blocked.append(&mut pass.blocked);

                deps::sort_candidates(&mut pass.runnable);
                for candidate in &pass.runnable {
                    if self.ctx.dispatch_candidate(&self.dag, candidate).await? {
                        progress += 1;
                    }
                }
            }

            progress += self.ctx.process_events(&dag_index).await?;

            let census = self.census(&dates).await?;
            if census.remaining == 0 {
                break;
            }

            let deadlocked =
                progress == 0 && census.active == 0 && census.retry_waiting == 0;
            if deadlocked {
                return Err(self.fail_deadlocked(&dates, blocked, census).await?);
            }

            if progress == 0 {
                if let Some(timeout) = self.options.ti_wait_timeout {
                    stalled_for += self.options.tick;
                    if stalled_for >= timeout {
                        return Err(Error::Internal(format!(
                            "Backfill of {} timed out after {:?} without progress",
                            self.dag.id, timeout
                        )));
                    }
                }
                tokio::time::sleep(self.options.tick).await;
            } else {
                stalled_for = Duration::ZERO;
            }
        }

        let mut failed: Vec<String> = Vec::new();
        for date in &dates {
            for instance in self.ctx.instances.list_for_run(&self.dag.id, *date).await? {
                if instance.state.counts_as_failure() {
                    failed.push(instance.key.to_string());
                }
            }
        }
        if !failed.is_empty() {
            error!(dag = %self.dag.id, failed = failed.len(), "Backfill finished with failures");
            return Err(Error::BackfillFailed {
                instances: failed.join(", "),
            });
        }

        info!(dag = %self.dag.id, runs = dates.len(), "Backfill complete");
        Ok(())
    }

    /// Every schedule point of the DAG within `[start, end]`, ascending.
    fn execution_dates(&self) -> Vec<DateTime<Utc>> {
        let mut dates = Vec::new();
        if self.start > self.end {
            return dates;
        }
        let mut next = Some(self.dag.start_date);
        while let Some(date) = next {
            if date > self.end {
                break;
            }
            if date >= self.start {
                dates.push(date);
            }
            next = self.dag.schedule.next_after(date);
        }
        dates
    }

    /// Create the run for one date, or reset an existing one when asked.
    async fn prepare_run(&self, date: DateTime<Utc>) -> Result<()> {
        let run = DagRun::new(&self.dag.id, date);
        if self.ctx.dag_runs.create(&run).await? {
            return Ok(());
        }
        if !self.options.reset_dag_runs {
            return Ok(());
        }

        info!(
            dag = %self.dag.id,
            execution_date = %date.to_rfc3339(),
            "Resetting existing run"
        );
        self.ctx
            .dag_runs
            .set_state(&self.dag.id, date, DagRunState::Running)
            .await?;
        for instance in self.ctx.instances.list_for_run(&self.dag.id, date).await? {
            let was_active = instance.state.is_active();
            let reset = TaskInstance::new(instance.key.clone(), instance.pool.clone());
            if !self
                .ctx
                .instances
                .update_if_state(&reset, instance.state)
                .await?
            {
                warn!(instance = %instance.key, "Instance changed during reset, leaving as is");
                continue;
            }
            // An instance a dead job left in flight still holds its slot.
            if was_active {
                self.ctx.pools.release(instance.pool.as_deref()).await?;
            }
        }
        Ok(())
    }

    /// Count what is left across the whole range.
    async fn census(&self, dates: &[DateTime<Utc>]) -> Result<Census> {
        let now = Utc::now();
        let mut census = Census::default();
        for date in dates {
            let Some(run) = self.ctx.dag_runs.get(&self.dag.id, *date).await? else {
                continue;
            };
            // A finished run's stragglers are permanently blocked, not
            // pending work.
            if run.state.is_terminal() {
                continue;
            }
            if self.ctx.finalize_run(&self.dag, &run).await?.is_terminal() {
                continue;
            }
            for instance in self.ctx.instances.list_for_run(&self.dag.id, *date).await? {
                if instance.state.is_terminal() {
                    continue;
                }
                census.remaining += 1;
                if instance.state.is_active() {
                    census.active += 1;
                }
                if instance.state == TaskState::UpForRetry {
                    let delay = self
                        .dag
                        .task(&instance.key.task_id)
                        .map(|task| task.retry_delay)
                        .unwrap_or_else(chrono::Duration::zero);
                    if !instance.retry_ready(delay, now) {
                        census.retry_waiting += 1;
                    }
                }
            }
        }
        Ok(census)
    }

    /// Fail every unfinished run in the range and build the deadlock
    /// error from the blocked instances.
    async fn fail_deadlocked(
        &self,
        dates: &[DateTime<Utc>],
        blocked: Vec<(TaskInstanceKey, String)>,
        census: Census,
    ) -> Result<Error> {
        error!(
            dag = %self.dag.id,
            remaining = census.remaining,
            "Backfill is deadlocked"
        );
        for date in dates {
            if let Some(run) = self.ctx.dag_runs.get(&self.dag.id, *date).await? {
                if !run.state.is_terminal() {
                    self.ctx
                        .dag_runs
                        .set_state(&self.dag.id, *date, DagRunState::Failed)
                        .await?;
                }
            }
        }

        let mut described: Vec<String> = blocked
            .iter()
            .map(|(key, reason)| format!("{key} ({reason})"))
            .collect();
        if described.is_empty() {
            for date in dates {
                for instance in self.ctx.instances.list_for_run(&self.dag.id, *date).await? {
                    if !instance.state.is_terminal() {
                        described.push(instance.key.to_string());
                    }
                }
            }
        }
        Ok(Error::BackfillDeadlocked {
            instances: described.join(", "),
        })
    }
}

#[derive(Debug, Default)]
struct Census {
    /// Non-terminal instances in the range.
    remaining: usize,
    /// QUEUED + RUNNING instances.
    active: usize,
    /// UP_FOR_RETRY instances whose delay has not elapsed; time will
    /// unblock these, so they do not count toward deadlock.
    retry_waiting: usize,
}
