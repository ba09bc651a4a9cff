//! Live scheduling loop.
//!
//! Each cycle: reconcile executor completion reports, then per DAG
//! create any due runs, evaluate and dispatch, and finalize settled
//! runs. A failure while processing one DAG is logged and does not stop
//! the others. The loop also watches executor liveness and returns the
//! in-flight instances of a stalled executor to NONE for re-evaluation.

use crate::context::JobContext;
use crate::deps::{self, Candidate, EvalOptions};
use chrono::Utc;
use skein_core::Result;
use skein_core::dag::Dag;
use skein_core::instance::DagRun;
use skein_core::state::TaskState;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep between evaluation cycles.
    pub tick: Duration,
    /// How long the executor may fail its liveness probe before its
    /// in-flight instances are reclaimed.
    pub heartbeat_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

pub struct SchedulerJob {
    ctx: JobContext,
    dags: Vec<Dag>,
    config: SchedulerConfig,
    shutdown: watch::Receiver<bool>,
}

impl SchedulerJob {
    pub fn new(
        ctx: JobContext,
        dags: Vec<Dag>,
        config: SchedulerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            dags,
            config,
            shutdown,
        }
    }

    /// Run until the shutdown signal flips. On shutdown, in-flight
    /// instances are marked SHUTDOWN so a later scheduler re-runs them.
    pub async fn run(&mut self) -> Result<()> {
        info!(dags = self.dags.len(), "Scheduler started");
        let mut last_alive = Utc::now();

        while !*self.shutdown.borrow() {
            self.run_cycle().await;

            if self.ctx.executor.is_alive().await {
                last_alive = Utc::now();
            } else {
                let silent = (Utc::now() - last_alive)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if silent >= self.config.heartbeat_timeout {
                    warn!(silent_secs = silent.as_secs(), "Executor heartbeat lost");
                    if let Err(e) = self.reclaim_orphans().await {
                        error!(error = %e, "Failed to reclaim orphaned instances");
                    }
                    last_alive = Utc::now();
                }
            }

            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Scheduler stopping");
        self.mark_inflight_shutdown().await?;
        Ok(())
    }

    /// One full evaluation cycle: reconcile executor events, then tick
    /// every DAG. A failure in one DAG is logged and does not stop the
    /// others.
    pub async fn run_cycle(&self) {
        let dag_index: HashMap<&str, &Dag> =
            self.dags.iter().map(|dag| (dag.id.as_str(), dag)).collect();

        if let Err(e) = self.ctx.process_events(&dag_index).await {
            error!(error = %e, "Failed to reconcile executor events");
        }

        for dag in &self.dags {
            if let Err(e) = self.tick_dag(dag).await {
                error!(dag = %dag.id, error = %e, "Scheduling pass failed");
            }
        }
    }

    /// One evaluation cycle for one DAG.
    pub async fn tick_dag(&self, dag: &Dag) -> Result<()> {
        if dag.paused {
            debug!(dag = %dag.id, "DAG is paused, skipping");
            return Ok(());
        }

        // Catch up on due periods; one run per call keeps creation
        // idempotent under scheduler races.
        while let Some(run) = self.schedule_dag(dag).await? {
            info!(
                dag = %dag.id,
                execution_date = %run.execution_date.to_rfc3339(),
                "Created run"
            );
        }

        let runs = self.ctx.dag_runs.list_running(&dag.id).await?;
        let now = Utc::now();

        let mut candidates: Vec<Candidate> = Vec::new();
        for run in &runs {
            let pass = self
                .ctx
                .evaluate_run(dag, run, EvalOptions::default(), now)
                .await?;
            candidates.extend(pass.runnable);
        }

        deps::sort_candidates(&mut candidates);
        for candidate in &candidates {
            self.ctx.dispatch_candidate(dag, candidate).await?;
        }

        for run in &runs {
            self.ctx.finalize_run(dag, run).await?;
        }

        Ok(())
    }

    /// Create the next due run, if any. A run for a period is created
    /// only once the period has fully elapsed. Returns the created run,
    /// or `None` when nothing is due (including losing the creation race
    /// to another scheduler).
    pub async fn schedule_dag(&self, dag: &Dag) -> Result<Option<DagRun>> {
        if dag.paused {
            return Ok(None);
        }

        let next = match self.ctx.dag_runs.latest_execution_date(&dag.id).await? {
            None => Some(dag.start_date),
            Some(latest) => dag.schedule.next_after(latest),
        };
        let Some(next) = next else {
            // One-shot schedule already ran.
            return Ok(None);
        };

        let period_end = dag.schedule.next_after(next).unwrap_or(next);
        if period_end > Utc::now() {
            return Ok(None);
        }

        let run = DagRun::new(&dag.id, next);
        if self.ctx.dag_runs.create(&run).await? {
            Ok(Some(run))
        } else {
            debug!(
                dag = %dag.id,
                execution_date = %next.to_rfc3339(),
                "Run already created elsewhere"
            );
            Ok(None)
        }
    }

    /// Return every in-flight instance of a lost executor to NONE, keeping
    /// its try number, and give the pool slots back.
    pub async fn reclaim_orphans(&self) -> Result<usize> {
        let mut reclaimed = 0usize;
        for instance in self.ctx.instances.list_active().await? {
            warn!(instance = %instance.key, "Returning orphaned instance for re-evaluation");
            let mut reset = instance.clone();
            reset.state = TaskState::None;
            reset.start_date = None;
            if self
                .ctx
                .instances
                .update_if_state(&reset, instance.state)
                .await?
            {
                self.ctx.pools.release(instance.pool.as_deref()).await?;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Mark in-flight instances SHUTDOWN on graceful stop.
    async fn mark_inflight_shutdown(&self) -> Result<()> {
        for instance in self.ctx.instances.list_active().await? {
            info!(instance = %instance.key, "Marking in-flight instance shutdown");
            let mut stopped = instance.clone();
            stopped.state = TaskState::Shutdown;
            stopped.end_date = Some(Utc::now());
            if self
                .ctx
                .instances
                .update_if_state(&stopped, instance.state)
                .await?
            {
                self.ctx.pools.release(instance.pool.as_deref()).await?;
            }
        }
        Ok(())
    }
}
