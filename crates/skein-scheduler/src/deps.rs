//! Pure dependency evaluation.
//!
//! `evaluate` classifies one task instance against a snapshot of its
//! surroundings. It performs no I/O and mutates nothing, so two
//! evaluations of the same snapshot always agree; state transitions are
//! applied by the caller through compare-and-swap writes.

use chrono::{DateTime, Utc};
use skein_core::dag::{Dag, Task, TriggerRule};
use skein_core::instance::TaskInstance;
use skein_core::state::{DagRunState, TaskState};
use std::fmt;

/// Dependency checks a job may waive. Overrides only relax checks;
/// nothing here can make a runnable instance blocked.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalOptions {
    /// Skip the trigger-rule and depends-on-past checks entirely.
    pub ignore_task_deps: bool,
    /// Skip only the depends-on-past check.
    pub ignore_depends_on_past: bool,
}

/// The prior-period instance consulted by depends-on-past, as seen at
/// snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorInstance {
    /// Task does not depend on past, or this is the first period.
    NotApplicable,
    /// No instance exists for any earlier execution date.
    Missing,
    State(TaskState),
}

/// Snapshot of everything `evaluate` consults beyond the DAG and the
/// instance itself.
#[derive(Debug, Clone)]
pub struct EvalContext<'a> {
    pub run_state: DagRunState,
    /// States of the immediate upstream instances, by task id.
    pub upstream: &'a [(String, TaskState)],
    pub prior: PriorInstance,
    pub pool_has_capacity: bool,
    /// QUEUED + RUNNING instances across the whole DAG.
    pub active_in_dag: usize,
    pub now: DateTime<Utc>,
    pub options: EvalOptions,
}

/// Why a blocked instance is not runnable right now. Transient by
/// definition: a later cycle with a different snapshot may clear it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    DagPaused,
    RunFinished(DagRunState),
    NotSchedulable(TaskState),
    RetryNotReady { ready_at: DateTime<Utc> },
    UpstreamPending { pending: usize },
    DependsOnPast { prior: Option<TaskState> },
    PoolFull { pool: String },
    ConcurrencyLimit { active: usize, limit: usize },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::DagPaused => write!(f, "DAG is paused"),
            BlockReason::RunFinished(state) => {
                write!(f, "containing run already finished as {state}")
            }
            BlockReason::NotSchedulable(state) => {
                write!(f, "instance state {state} is not schedulable")
            }
            BlockReason::RetryNotReady { ready_at } => {
                write!(f, "retry delay pending until {}", ready_at.to_rfc3339())
            }
            BlockReason::UpstreamPending { pending } => {
                write!(f, "{pending} upstream instance(s) not yet settled")
            }
            BlockReason::DependsOnPast { prior: Some(state) } => {
                write!(f, "prior-period instance finished as {state}")
            }
            BlockReason::DependsOnPast { prior: None } => {
                write!(f, "prior-period instance does not exist yet")
            }
            BlockReason::PoolFull { pool } => write!(f, "pool '{pool}' has no open slots"),
            BlockReason::ConcurrencyLimit { active, limit } => {
                write!(f, "DAG concurrency limit reached ({active}/{limit} active)")
            }
        }
    }
}

/// Verdict for one instance at one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// All checks passed; the instance may be queued.
    Runnable,
    /// Not runnable now, may become runnable later.
    Blocked(BlockReason),
    /// Trigger rule can never be satisfied and a failed upstream is
    /// involved. The instance should be marked UPSTREAM_FAILED.
    UpstreamFailed,
    /// Trigger rule can never be satisfied without any failed upstream
    /// (a branch not taken). The instance should be marked SKIPPED.
    Skipped,
}

/// Evaluate one instance. Checks run in a fixed order so the reported
/// block reason is the first gate that failed.
pub fn evaluate(dag: &Dag, task: &Task, instance: &TaskInstance, ctx: &EvalContext) -> Decision {
    if dag.paused {
        return Decision::Blocked(BlockReason::DagPaused);
    }
    if ctx.run_state.is_terminal() {
        return Decision::Blocked(BlockReason::RunFinished(ctx.run_state));
    }

    match instance.state {
        TaskState::None => {}
        TaskState::UpForRetry => {
            if !instance.retry_ready(task.retry_delay, ctx.now) {
                let ready_at = instance
                    .end_date
                    .map(|ended| ended + task.retry_delay)
                    .unwrap_or(ctx.now);
                return Decision::Blocked(BlockReason::RetryNotReady { ready_at });
            }
        }
        other => return Decision::Blocked(BlockReason::NotSchedulable(other)),
    }

    if !ctx.options.ignore_task_deps {
        match check_trigger_rule(task.trigger_rule, ctx.upstream) {
            RuleCheck::Satisfied => {}
            RuleCheck::Pending(pending) => {
                return Decision::Blocked(BlockReason::UpstreamPending { pending });
            }
            RuleCheck::FailedUpstream => return Decision::UpstreamFailed,
            RuleCheck::BranchNotTaken => return Decision::Skipped,
        }

        if task.depends_on_past && !ctx.options.ignore_depends_on_past {
            match ctx.prior {
                PriorInstance::NotApplicable => {}
                PriorInstance::Missing => {
                    return Decision::Blocked(BlockReason::DependsOnPast { prior: None });
                }
                PriorInstance::State(TaskState::Success | TaskState::Skipped) => {}
                PriorInstance::State(state) => {
                    return Decision::Blocked(BlockReason::DependsOnPast {
                        prior: Some(state),
                    });
                }
            }
        }
    }

    if !ctx.pool_has_capacity {
        return Decision::Blocked(BlockReason::PoolFull {
            pool: task.pool.clone().unwrap_or_default(),
        });
    }
    if ctx.active_in_dag >= dag.concurrency {
        return Decision::Blocked(BlockReason::ConcurrencyLimit {
            active: ctx.active_in_dag,
            limit: dag.concurrency,
        });
    }

    Decision::Runnable
}

enum RuleCheck {
    Satisfied,
    Pending(usize),
    /// Permanently unsatisfiable because of a failed upstream.
    FailedUpstream,
    /// Permanently unsatisfiable with only successes and skips upstream.
    BranchNotTaken,
}

fn check_trigger_rule(rule: TriggerRule, upstream: &[(String, TaskState)]) -> RuleCheck {
    let total = upstream.len();
    if total == 0 {
        return RuleCheck::Satisfied;
    }

    let mut successes = 0usize;
    let mut failed = 0usize;
    let mut skipped = 0usize;
    let mut done = 0usize;
    for (_, state) in upstream {
        if state.counts_as_success() {
            successes += 1;
        }
        // An upstream lost to shutdown can never succeed; for trigger
        // rules it behaves like a failure.
        if state.counts_as_failure() || *state == TaskState::Shutdown {
            failed += 1;
        }
        if *state == TaskState::Skipped {
            skipped += 1;
        }
        if state.is_terminal() {
            done += 1;
        }
    }
    let pending = total - done;

    match rule {
        TriggerRule::AllSuccess => {
            if successes == total {
                RuleCheck::Satisfied
            } else if failed > 0 {
                RuleCheck::FailedUpstream
            } else if skipped > 0 {
                RuleCheck::BranchNotTaken
            } else {
                RuleCheck::Pending(pending)
            }
        }
        TriggerRule::AllFailed => {
            if failed == total {
                RuleCheck::Satisfied
            } else if successes + skipped > 0 {
                RuleCheck::BranchNotTaken
            } else {
                RuleCheck::Pending(pending)
            }
        }
        TriggerRule::AllDone => {
            if done == total {
                RuleCheck::Satisfied
            } else {
                RuleCheck::Pending(pending)
            }
        }
        TriggerRule::OneSuccess => {
            if pending > 0 {
                RuleCheck::Pending(pending)
            } else if successes > 0 {
                RuleCheck::Satisfied
            } else if failed > 0 {
                RuleCheck::FailedUpstream
            } else {
                RuleCheck::BranchNotTaken
            }
        }
        TriggerRule::OneFailed => {
            if failed > 0 {
                RuleCheck::Satisfied
            } else if pending > 0 {
                RuleCheck::Pending(pending)
            } else {
                RuleCheck::BranchNotTaken
            }
        }
    }
}

/// A runnable instance awaiting dispatch.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub task_id: String,
    pub execution_date: DateTime<Utc>,
    pub priority_weight: i32,
}

/// Dispatch order within one evaluation cycle: higher priority weight
/// first, then older execution date, then task id for a stable total
/// order.
pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.priority_weight
            .cmp(&a.priority_weight)
            .then(a.execution_date.cmp(&b.execution_date))
            .then(a.task_id.cmp(&b.task_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use skein_core::dag::{DagBuilder, DagDefinition, TaskDefaults, TaskDefinition};
    use skein_core::instance::{TaskInstance, TaskInstanceKey};
    use skein_core::schedule::ScheduleConfig;

    fn exec_date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 1, 2, 0, 0, 0).unwrap()
    }

    fn two_task_dag(trigger_rule: TriggerRule) -> Dag {
        let def = DagDefinition {
            id: "pair".to_string(),
            schedule: ScheduleConfig::EverySecs(86_400),
            start_date: Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap(),
            concurrency: 16,
            paused: false,
            defaults: TaskDefaults::default(),
            tasks: vec![
                TaskDefinition {
                    id: "up".to_string(),
                    depends_on: vec![],
                    kind: None,
                    command: None,
                    trigger_rule: None,
                    depends_on_past: None,
                    retries: None,
                    retry_delay_secs: None,
                    pool: None,
                    priority_weight: None,
                },
                TaskDefinition {
                    id: "down".to_string(),
                    depends_on: vec!["up".to_string()],
                    kind: None,
                    command: None,
                    trigger_rule: Some(trigger_rule),
                    depends_on_past: None,
                    retries: None,
                    retry_delay_secs: None,
                    pool: None,
                    priority_weight: None,
                },
            ],
        };
        DagBuilder::new().build(&def).unwrap()
    }

    fn fresh_instance(dag_id: &str, task_id: &str) -> TaskInstance {
        TaskInstance::new(TaskInstanceKey::new(dag_id, task_id, exec_date()), None)
    }

    fn ctx<'a>(upstream: &'a [(String, TaskState)]) -> EvalContext<'a> {
        EvalContext {
            run_state: DagRunState::Running,
            upstream,
            prior: PriorInstance::NotApplicable,
            pool_has_capacity: true,
            active_in_dag: 0,
            now: Utc::now(),
            options: EvalOptions::default(),
        }
    }

    fn eval_down(rule: TriggerRule, upstream_state: TaskState) -> Decision {
        let dag = two_task_dag(rule);
        let task = dag.task("down").unwrap();
        let ti = fresh_instance("pair", "down");
        let upstream = vec![("up".to_string(), upstream_state)];
        evaluate(&dag, task, &ti, &ctx(&upstream))
    }

    #[test]
    fn test_all_success_waits_then_runs() {
        assert_eq!(
            eval_down(TriggerRule::AllSuccess, TaskState::Running),
            Decision::Blocked(BlockReason::UpstreamPending { pending: 1 })
        );
        assert_eq!(
            eval_down(TriggerRule::AllSuccess, TaskState::Success),
            Decision::Runnable
        );
    }

    #[test]
    fn test_all_success_cascades_failure() {
        assert_eq!(
            eval_down(TriggerRule::AllSuccess, TaskState::Failed),
            Decision::UpstreamFailed
        );
        assert_eq!(
            eval_down(TriggerRule::AllSuccess, TaskState::UpstreamFailed),
            Decision::UpstreamFailed
        );
    }

    #[test]
    fn test_all_success_cascades_skip() {
        assert_eq!(
            eval_down(TriggerRule::AllSuccess, TaskState::Skipped),
            Decision::Skipped
        );
    }

    #[test]
    fn test_all_failed_runs_only_on_failure() {
        assert_eq!(
            eval_down(TriggerRule::AllFailed, TaskState::Failed),
            Decision::Runnable
        );
        assert_eq!(
            eval_down(TriggerRule::AllFailed, TaskState::Success),
            Decision::Skipped
        );
        assert_eq!(
            eval_down(TriggerRule::AllFailed, TaskState::Queued),
            Decision::Blocked(BlockReason::UpstreamPending { pending: 1 })
        );
    }

    #[test]
    fn test_all_done_runs_on_any_terminal() {
        for state in [TaskState::Success, TaskState::Failed, TaskState::Skipped] {
            assert_eq!(eval_down(TriggerRule::AllDone, state), Decision::Runnable);
        }
        assert_eq!(
            eval_down(TriggerRule::AllDone, TaskState::Running),
            Decision::Blocked(BlockReason::UpstreamPending { pending: 1 })
        );
    }

    #[test]
    fn test_one_success_waits_for_all_settled() {
        let dag = two_task_dag(TriggerRule::OneSuccess);
        let task = dag.task("down").unwrap();
        let ti = fresh_instance("pair", "down");

        // With a single upstream the rule settles with it.
        let upstream = vec![("up".to_string(), TaskState::Success)];
        assert_eq!(evaluate(&dag, task, &ti, &ctx(&upstream)), Decision::Runnable);

        let upstream = vec![("up".to_string(), TaskState::Failed)];
        assert_eq!(
            evaluate(&dag, task, &ti, &ctx(&upstream)),
            Decision::UpstreamFailed
        );
    }

    #[test]
    fn test_one_failed_settles_without_failure() {
        assert_eq!(
            eval_down(TriggerRule::OneFailed, TaskState::Failed),
            Decision::Runnable
        );
        assert_eq!(
            eval_down(TriggerRule::OneFailed, TaskState::Success),
            Decision::Skipped
        );
    }

    #[test]
    fn test_no_upstream_is_satisfied() {
        let dag = two_task_dag(TriggerRule::AllSuccess);
        let task = dag.task("up").unwrap();
        let ti = fresh_instance("pair", "up");
        assert_eq!(evaluate(&dag, task, &ti, &ctx(&[])), Decision::Runnable);
    }

    #[test]
    fn test_paused_dag_blocks_everything() {
        let mut dag = two_task_dag(TriggerRule::AllSuccess);
        dag.paused = true;
        let task = dag.task("up").unwrap();
        let ti = fresh_instance("pair", "up");
        assert_eq!(
            evaluate(&dag, task, &ti, &ctx(&[])),
            Decision::Blocked(BlockReason::DagPaused)
        );
    }

    #[test]
    fn test_finished_run_blocks_everything() {
        let dag = two_task_dag(TriggerRule::AllSuccess);
        let task = dag.task("up").unwrap();
        let ti = fresh_instance("pair", "up");
        let mut c = ctx(&[]);
        c.run_state = DagRunState::Failed;
        assert_eq!(
            evaluate(&dag, task, &ti, &c),
            Decision::Blocked(BlockReason::RunFinished(DagRunState::Failed))
        );
    }

    #[test]
    fn test_terminal_instance_not_schedulable() {
        let dag = two_task_dag(TriggerRule::AllSuccess);
        let task = dag.task("up").unwrap();
        let mut ti = fresh_instance("pair", "up");
        ti.state = TaskState::Success;
        assert_eq!(
            evaluate(&dag, task, &ti, &ctx(&[])),
            Decision::Blocked(BlockReason::NotSchedulable(TaskState::Success))
        );
    }

    #[test]
    fn test_retry_waits_for_delay() {
        let dag = two_task_dag(TriggerRule::AllSuccess);
        let task = dag.task("up").unwrap();
        let mut ti = fresh_instance("pair", "up");
        ti.state = TaskState::UpForRetry;
        ti.end_date = Some(Utc::now());
        assert!(matches!(
            evaluate(&dag, task, &ti, &ctx(&[])),
            Decision::Blocked(BlockReason::RetryNotReady { .. })
        ));

        ti.end_date = Some(Utc::now() - Duration::seconds(600));
        assert_eq!(evaluate(&dag, task, &ti, &ctx(&[])), Decision::Runnable);
    }

    #[test]
    fn test_depends_on_past_gates_on_prior() {
        let mut def = DagDefinition {
            id: "daily".to_string(),
            schedule: ScheduleConfig::EverySecs(86_400),
            start_date: Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap(),
            concurrency: 16,
            paused: false,
            defaults: TaskDefaults::default(),
            tasks: vec![TaskDefinition {
                id: "t".to_string(),
                depends_on: vec![],
                kind: None,
                command: None,
                trigger_rule: None,
                depends_on_past: Some(true),
                retries: None,
                retry_delay_secs: None,
                pool: None,
                priority_weight: None,
            }],
        };
        def.defaults.depends_on_past = Some(true);
        let dag = DagBuilder::new().build(&def).unwrap();
        let task = dag.task("t").unwrap();
        let ti = fresh_instance("daily", "t");

        let mut c = ctx(&[]);
        c.prior = PriorInstance::State(TaskState::Failed);
        assert_eq!(
            evaluate(&dag, task, &ti, &c),
            Decision::Blocked(BlockReason::DependsOnPast {
                prior: Some(TaskState::Failed)
            })
        );

        c.prior = PriorInstance::Missing;
        assert_eq!(
            evaluate(&dag, task, &ti, &c),
            Decision::Blocked(BlockReason::DependsOnPast { prior: None })
        );

        c.prior = PriorInstance::State(TaskState::Success);
        assert_eq!(evaluate(&dag, task, &ti, &c), Decision::Runnable);

        // First period never consults the prior instance.
        c.prior = PriorInstance::NotApplicable;
        assert_eq!(evaluate(&dag, task, &ti, &c), Decision::Runnable);

        // ignore_depends_on_past waives the check.
        c.prior = PriorInstance::State(TaskState::Failed);
        c.options.ignore_depends_on_past = true;
        assert_eq!(evaluate(&dag, task, &ti, &c), Decision::Runnable);
    }

    #[test]
    fn test_ignore_task_deps_waives_upstream_and_past() {
        let dag = two_task_dag(TriggerRule::AllSuccess);
        let task = dag.task("down").unwrap();
        let ti = fresh_instance("pair", "down");
        let upstream = vec![("up".to_string(), TaskState::Failed)];
        let mut c = ctx(&upstream);
        c.options.ignore_task_deps = true;
        assert_eq!(evaluate(&dag, task, &ti, &c), Decision::Runnable);
    }

    #[test]
    fn test_pool_and_concurrency_gate_last() {
        let dag = two_task_dag(TriggerRule::AllSuccess);
        let task = dag.task("up").unwrap();
        let ti = fresh_instance("pair", "up");

        let mut c = ctx(&[]);
        c.pool_has_capacity = false;
        assert!(matches!(
            evaluate(&dag, task, &ti, &c),
            Decision::Blocked(BlockReason::PoolFull { .. })
        ));

        let mut c = ctx(&[]);
        c.active_in_dag = 16;
        assert_eq!(
            evaluate(&dag, task, &ti, &c),
            Decision::Blocked(BlockReason::ConcurrencyLimit {
                active: 16,
                limit: 16
            })
        );
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let dag = two_task_dag(TriggerRule::AllSuccess);
        let task = dag.task("down").unwrap();
        let ti = fresh_instance("pair", "down");
        let upstream = vec![("up".to_string(), TaskState::Running)];
        let c = ctx(&upstream);
        assert_eq!(evaluate(&dag, task, &ti, &c), evaluate(&dag, task, &ti, &c));
    }

    #[test]
    fn test_candidate_ordering() {
        let early = Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2016, 1, 2, 0, 0, 0).unwrap();
        let mut candidates = vec![
            Candidate {
                task_id: "b".to_string(),
                execution_date: late,
                priority_weight: 1,
            },
            Candidate {
                task_id: "a".to_string(),
                execution_date: late,
                priority_weight: 1,
            },
            Candidate {
                task_id: "c".to_string(),
                execution_date: early,
                priority_weight: 1,
            },
            Candidate {
                task_id: "z".to_string(),
                execution_date: late,
                priority_weight: 9,
            },
        ];
        sort_candidates(&mut candidates);
        let order: Vec<&str> = candidates.iter().map(|c| c.task_id.as_str()).collect();
        assert_eq!(order, vec!["z", "c", "a", "b"]);
    }
}
