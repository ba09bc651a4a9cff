//! Shared machinery of the scheduling loops.
//!
//! `JobContext` owns the repository and executor handles and implements
//! the read-evaluate-CAS cycle both the live scheduler and backfill run:
//! lazy instance creation, snapshot evaluation, dispatch with pool and
//! concurrency claims, executor event reconciliation, and run
//! finalization. Every write that races with another scheduler goes
//! through `update_if_state`, so a lost race is an observation, never an
//! error.

use crate::deps::{self, Candidate, Decision, EvalContext, EvalOptions, PriorInstance};
use crate::pool::PoolManager;
use chrono::{DateTime, Utc};
use skein_core::Result;
use skein_core::dag::Dag;
use skein_core::instance::{DagRun, TaskInstance, TaskInstanceKey, derive_run_state};
use skein_core::ports::{
    DagRunRepository, DispatchOutcome, Executor, ExecutorEvent, TaskInstanceRepository,
    TaskOutcome, TaskPayload,
};
use skein_core::state::{DagRunState, TaskState};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of evaluating every instance of one run.
pub struct RunPass {
    /// Instances that passed every check, unsorted.
    pub runnable: Vec<Candidate>,
    /// UPSTREAM_FAILED / SKIPPED cascades applied during this pass.
    pub transitions: usize,
    /// Instances blocked this pass, with the first failed gate.
    pub blocked: Vec<(TaskInstanceKey, String)>,
}

pub struct JobContext {
    pub dag_runs: Arc<dyn DagRunRepository>,
    pub instances: Arc<dyn TaskInstanceRepository>,
    pub pools: PoolManager,
    pub executor: Arc<dyn Executor>,
}

impl JobContext {
    pub fn new(
        dag_runs: Arc<dyn DagRunRepository>,
        instances: Arc<dyn TaskInstanceRepository>,
        pools: PoolManager,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            dag_runs,
            instances,
            pools,
            executor,
        }
    }

    /// Load the run's instances, creating any that do not exist yet in
    /// NONE state. Returns them keyed by task id.
    pub async fn ensure_instances(
        &self,
        dag: &Dag,
        execution_date: DateTime<Utc>,
    ) -> Result<HashMap<String, TaskInstance>> {
        let mut by_task: HashMap<String, TaskInstance> = self
            .instances
            .list_for_run(&dag.id, execution_date)
            .await?
            .into_iter()
            .map(|ti| (ti.key.task_id.clone(), ti))
            .collect();

        for task in dag.tasks() {
            if by_task.contains_key(&task.id) {
                continue;
            }
            let key = TaskInstanceKey::new(&dag.id, &task.id, execution_date);
            let fresh = TaskInstance::new(key.clone(), task.pool.clone());
            let instance = if self.instances.insert_if_absent(&fresh).await? {
                fresh
            } else {
                // Another scheduler created it between the list and the
                // insert; read theirs.
                self.instances.get(&key).await?.unwrap_or(fresh)
            };
            by_task.insert(task.id.clone(), instance);
        }

        Ok(by_task)
    }

    /// Evaluate every instance of one run against a fresh snapshot,
    /// applying UPSTREAM_FAILED / SKIPPED cascades as they are found.
    pub async fn evaluate_run(
        &self,
        dag: &Dag,
        run: &DagRun,
        options: EvalOptions,
        now: DateTime<Utc>,
    ) -> Result<RunPass> {
        let by_task = self.ensure_instances(dag, run.execution_date).await?;
        let active_in_dag = self.instances.count_active(&dag.id).await?;

        let mut pass = RunPass {
            runnable: Vec::new(),
            transitions: 0,
            blocked: Vec::new(),
        };

        for task in dag.tasks() {
            let Some(instance) = by_task.get(&task.id) else {
                continue;
            };
            if instance.state.is_terminal() || instance.state.is_active() {
                continue;
            }

            let upstream: Vec<(String, TaskState)> = dag
                .upstream(&task.id)
                .iter()
                .map(|up| {
                    let state = by_task
                        .get(&up.id)
                        .map(|ti| ti.state)
                        .unwrap_or(TaskState::None);
                    (up.id.clone(), state)
                })
                .collect();

            let prior = if !task.depends_on_past
                || options.ignore_task_deps
                || options.ignore_depends_on_past
                || run.execution_date <= dag.start_date
            {
                PriorInstance::NotApplicable
            } else {
                match self
                    .instances
                    .get_previous(&dag.id, &task.id, run.execution_date)
                    .await?
                {
                    Some(prev) => PriorInstance::State(prev.state),
                    None => PriorInstance::Missing,
                }
            };

            let pool_has_capacity = self.pools.has_capacity(task.pool.as_deref()).await?;

            let ctx = EvalContext {
                run_state: run.state,
                upstream: &upstream,
                prior,
                pool_has_capacity,
                active_in_dag,
                now,
                options,
            };

            match deps::evaluate(dag, task, instance, &ctx) {
                Decision::Runnable => pass.runnable.push(Candidate {
                    task_id: task.id.clone(),
                    execution_date: run.execution_date,
                    priority_weight: task.priority_weight,
                }),
                Decision::Blocked(reason) => {
                    pass.blocked.push((instance.key.clone(), reason.to_string()));
                }
                Decision::UpstreamFailed => {
                    if self
                        .settle(instance, TaskState::UpstreamFailed, now)
                        .await?
                    {
                        warn!(instance = %instance.key, "Marking instance upstream_failed");
                        pass.transitions += 1;
                    }
                }
                Decision::Skipped => {
                    if self.settle(instance, TaskState::Skipped, now).await? {
                        info!(instance = %instance.key, "Skipping instance, branch not taken");
                        pass.transitions += 1;
                    }
                }
            }
        }

        Ok(pass)
    }

    /// CAS an instance into a terminal state reached without running.
    async fn settle(
        &self,
        instance: &TaskInstance,
        state: TaskState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut settled = instance.clone();
        settled.state = state;
        settled.end_date = Some(now);
        self.instances.update_if_state(&settled, instance.state).await
    }

    /// Try to queue one candidate: claim concurrency and pool capacity,
    /// CAS the instance to QUEUED, and hand it to the executor. Returns
    /// whether the dispatch happened; a lost race or a full resource is
    /// `false`, not an error.
    pub async fn dispatch_candidate(&self, dag: &Dag, candidate: &Candidate) -> Result<bool> {
        let key = TaskInstanceKey::new(&dag.id, &candidate.task_id, candidate.execution_date);
        let Some(instance) = self.instances.get(&key).await? else {
            return Ok(false);
        };
        if !instance.state.is_schedulable() {
            return Ok(false);
        }
        let Some(task) = dag.task(&candidate.task_id) else {
            return Ok(false);
        };

        // Re-check concurrency against live counts; earlier dispatches in
        // this same cycle consume the budget.
        if self.instances.count_active(&dag.id).await? >= dag.concurrency {
            debug!(dag = %dag.id, "Concurrency limit reached, deferring dispatch");
            return Ok(false);
        }
        if !self.pools.try_acquire(task.pool.as_deref()).await? {
            debug!(instance = %key, "Pool slot lost at dispatch time");
            return Ok(false);
        }

        let mut queued = instance.clone();
        queued.state = TaskState::Queued;
        if instance.state == TaskState::UpForRetry {
            queued.try_number += 1;
        }
        if !self.instances.update_if_state(&queued, instance.state).await? {
            // Another scheduler got there first.
            self.pools.release(task.pool.as_deref()).await?;
            return Ok(false);
        }

        let payload = TaskPayload {
            key: key.clone(),
            kind: task.kind.clone(),
            command: task.command.clone(),
            try_number: queued.try_number,
        };

        match self.executor.dispatch(payload).await {
            Ok(DispatchOutcome::Accepted) => {
                info!(instance = %key, try_number = queued.try_number, "Queued task instance");
                Ok(true)
            }
            Ok(DispatchOutcome::Rejected(reason)) => {
                warn!(instance = %key, reason, "Executor rejected dispatch");
                self.requeue_rejected(&instance).await?;
                Ok(false)
            }
            Err(e) => {
                warn!(instance = %key, error = %e, "Executor dispatch failed, will retry");
                self.requeue_rejected(&instance).await?;
                Ok(false)
            }
        }
    }

    /// A dispatch the executor did not accept must not consume a try:
    /// return the instance to NONE with its original try number and give
    /// the pool slot back.
    async fn requeue_rejected(&self, original: &TaskInstance) -> Result<()> {
        let mut reverted = original.clone();
        reverted.state = TaskState::None;
        self.instances
            .update_if_state(&reverted, TaskState::Queued)
            .await?;
        self.pools.release(reverted.pool.as_deref()).await?;
        Ok(())
    }

    /// Drain the executor's event queue and apply the resulting state
    /// transitions. Returns how many transitions were applied.
    pub async fn process_events(&self, dags: &HashMap<&str, &Dag>) -> Result<usize> {
        let mut transitions = 0usize;
        for event in self.executor.poll_events().await? {
            match event {
                ExecutorEvent::Started(key) => {
                    let Some(instance) = self.instances.get(&key).await? else {
                        warn!(instance = %key, "Start report for unknown instance");
                        continue;
                    };
                    if instance.state != TaskState::Queued {
                        debug!(instance = %key, state = %instance.state, "Stale start report");
                        continue;
                    }
                    let mut running = instance.clone();
                    running.state = TaskState::Running;
                    running.start_date = Some(Utc::now());
                    if self
                        .instances
                        .update_if_state(&running, TaskState::Queued)
                        .await?
                    {
                        transitions += 1;
                    }
                }
                ExecutorEvent::Finished(key, outcome) => {
                    if self.apply_finish(&key, outcome, dags).await? {
                        transitions += 1;
                    }
                }
            }
        }
        Ok(transitions)
    }

    async fn apply_finish(
        &self,
        key: &TaskInstanceKey,
        outcome: TaskOutcome,
        dags: &HashMap<&str, &Dag>,
    ) -> Result<bool> {
        let Some(instance) = self.instances.get(key).await? else {
            warn!(instance = %key, "Completion report for unknown instance");
            return Ok(false);
        };
        if !instance.state.is_active() {
            debug!(instance = %key, state = %instance.state, "Stale completion report");
            return Ok(false);
        }

        let next_state = match &outcome {
            TaskOutcome::Success => TaskState::Success,
            TaskOutcome::Failed(_) => {
                let retries = dags
                    .get(key.dag_id.as_str())
                    .and_then(|dag| dag.task(&key.task_id))
                    .map(|task| task.retries)
                    .unwrap_or(0);
                if instance.try_number < retries {
                    TaskState::UpForRetry
                } else {
                    TaskState::Failed
                }
            }
        };

        let mut finished = instance.clone();
        finished.state = next_state;
        finished.end_date = Some(Utc::now());
        let applied = self
            .instances
            .update_if_state(&finished, instance.state)
            .await?;
        if !applied {
            return Ok(false);
        }

        self.pools.release(finished.pool.as_deref()).await?;

        match outcome {
            TaskOutcome::Success => {
                info!(instance = %key, "Task instance succeeded");
            }
            TaskOutcome::Failed(reason) => match next_state {
                TaskState::UpForRetry => {
                    warn!(
                        instance = %key,
                        try_number = instance.try_number,
                        reason,
                        "Task instance failed, up for retry"
                    );
                }
                _ => {
                    error!(instance = %key, reason, "Task instance failed");
                }
            },
        }

        Ok(true)
    }

    /// Re-derive the run's state from its leaf instances and persist the
    /// transition out of RUNNING if the leaves have settled.
    pub async fn finalize_run(&self, dag: &Dag, run: &DagRun) -> Result<DagRunState> {
        let by_task: HashMap<String, TaskInstance> = self
            .instances
            .list_for_run(&dag.id, run.execution_date)
            .await?
            .into_iter()
            .map(|ti| (ti.key.task_id.clone(), ti))
            .collect();

        let leaf_states: Vec<TaskState> = dag
            .leaves()
            .iter()
            .map(|leaf| {
                by_task
                    .get(&leaf.id)
                    .map(|ti| ti.state)
                    .unwrap_or(TaskState::None)
            })
            .collect();

        let derived = derive_run_state(&leaf_states);
        if derived.is_terminal() && run.state == DagRunState::Running {
            self.dag_runs
                .set_state(&dag.id, run.execution_date, derived)
                .await?;
            info!(
                dag = %dag.id,
                execution_date = %run.execution_date.to_rfc3339(),
                state = %derived,
                "Marking run"
            );
        }
        Ok(derived)
    }
}
