//! Backfill behavior over the in-memory store and the inline executor.

use chrono::{DateTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use skein_core::Error;
use skein_core::dag::{Dag, DagBuilder, DagDefinition, TaskDefaults, TaskDefinition, TriggerRule};
use skein_core::instance::{DagRun, TaskInstance, TaskInstanceKey};
use skein_core::pool::Pool;
use skein_core::ports::{DagRunRepository, PoolRepository, TaskInstanceRepository};
use skein_core::schedule::ScheduleConfig;
use skein_core::state::{DagRunState, TaskState};
use skein_db::MemoryStateStore;
use skein_executor::{CallbackOperator, OperatorRegistry, SequentialExecutor};
use skein_scheduler::{BackfillJob, BackfillOptions, JobContext, PoolManager};
use std::sync::{Arc, Mutex};

fn date(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2016, 1, day, 0, 0, 0).unwrap()
}

fn task(id: &str, depends_on: &[&str]) -> TaskDefinition {
    TaskDefinition {
        id: id.to_string(),
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        kind: Some("work".to_string()),
        command: None,
        trigger_rule: None,
        depends_on_past: None,
        retries: None,
        retry_delay_secs: None,
        pool: None,
        priority_weight: None,
    }
}

fn daily_dag(id: &str, start: DateTime<Utc>, tasks: Vec<TaskDefinition>) -> Dag {
    DagBuilder::new()
        .build(&DagDefinition {
            id: id.to_string(),
            schedule: ScheduleConfig::EverySecs(86_400),
            start_date: start,
            concurrency: 16,
            paused: false,
            defaults: TaskDefaults::default(),
            tasks,
        })
        .unwrap()
}

/// Registry with a "work" kind that succeeds and a "boom" kind that
/// always fails.
fn registry() -> OperatorRegistry {
    let mut registry = OperatorRegistry::new();
    registry.register("work", Arc::new(CallbackOperator::new(|_| Ok(()))));
    registry.register(
        "boom",
        Arc::new(CallbackOperator::new(|_| {
            Err(Error::TaskFailed("boom".to_string()))
        })),
    );
    registry
}

fn context(store: &MemoryStateStore, registry: OperatorRegistry) -> JobContext {
    JobContext::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        PoolManager::new(Arc::new(store.clone())),
        Arc::new(SequentialExecutor::new(Arc::new(registry))),
    )
}

async fn instance_state(store: &MemoryStateStore, dag: &str, task: &str, day: u32) -> TaskState {
    TaskInstanceRepository::get(store, &TaskInstanceKey::new(dag, task, date(day)))
        .await
        .unwrap()
        .map(|ti| ti.state)
        .unwrap_or(TaskState::None)
}

async fn run_state(store: &MemoryStateStore, dag: &str, day: u32) -> DagRunState {
    DagRunRepository::get(store, dag, date(day))
        .await
        .unwrap()
        .unwrap()
        .state
}

#[tokio::test]
async fn test_backfill_linear_dag_completes() {
    let store = MemoryStateStore::new();
    let dag = daily_dag(
        "etl",
        date(1),
        vec![
            task("extract", &[]),
            task("transform", &["extract"]),
            task("load", &["transform"]),
        ],
    );
    let job = BackfillJob::new(
        context(&store, registry()),
        dag,
        date(1),
        date(3),
        BackfillOptions::default(),
    );

    job.run().await.unwrap();

    for day in 1..=3 {
        for t in ["extract", "transform", "load"] {
            assert_eq!(instance_state(&store, "etl", t, day).await, TaskState::Success);
        }
        assert_eq!(run_state(&store, "etl", day).await, DagRunState::Success);
    }
}

#[tokio::test]
async fn test_backfill_processes_dates_in_ascending_order() {
    let store = MemoryStateStore::new();
    let seen: Arc<Mutex<Vec<DateTime<Utc>>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();

    let mut registry = OperatorRegistry::new();
    registry.register(
        "work",
        Arc::new(CallbackOperator::new(move |ctx| {
            recorder.lock().unwrap().push(ctx.key.execution_date);
            Ok(())
        })),
    );

    let dag = daily_dag("ordered", date(1), vec![task("t", &[])]);
    let job = BackfillJob::new(
        context(&store, registry),
        dag,
        date(1),
        date(4),
        BackfillOptions::default(),
    );
    job.run().await.unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![date(1), date(2), date(3), date(4)]);
}

#[tokio::test]
async fn test_backfill_reports_failed_instances() {
    let store = MemoryStateStore::new();
    let mut boom = task("extract", &[]);
    boom.kind = Some("boom".to_string());
    let dag = daily_dag("broken", date(1), vec![boom, task("load", &["extract"])]);

    let job = BackfillJob::new(
        context(&store, registry()),
        dag,
        date(1),
        date(1),
        BackfillOptions::default(),
    );
    let err = job.run().await.unwrap_err();
    assert!(matches!(err, Error::BackfillFailed { .. }));

    assert_eq!(instance_state(&store, "broken", "extract", 1).await, TaskState::Failed);
    assert_eq!(
        instance_state(&store, "broken", "load", 1).await,
        TaskState::UpstreamFailed
    );
    assert_eq!(run_state(&store, "broken", 1).await, DagRunState::Failed);
}

#[tokio::test]
async fn test_backfill_all_done_leaf_succeeds_after_failure() {
    let store = MemoryStateStore::new();
    let mut boom = task("extract", &[]);
    boom.kind = Some("boom".to_string());
    let mut always = task("cleanup", &["extract"]);
    always.trigger_rule = Some(TriggerRule::AllDone);
    let dag = daily_dag("resilient", date(1), vec![boom, always]);

    let job = BackfillJob::new(
        context(&store, registry()),
        dag,
        date(1),
        date(1),
        BackfillOptions::default(),
    );
    let err = job.run().await.unwrap_err();
    assert!(matches!(err, Error::BackfillFailed { .. }));

    assert_eq!(
        instance_state(&store, "resilient", "extract", 1).await,
        TaskState::Failed
    );
    assert_eq!(
        instance_state(&store, "resilient", "cleanup", 1).await,
        TaskState::Success
    );
    // The leaf settled successfully, so the run did too.
    assert_eq!(run_state(&store, "resilient", 1).await, DagRunState::Success);
}

#[tokio::test]
async fn test_backfill_retries_until_success() {
    let store = MemoryStateStore::new();
    let mut registry = OperatorRegistry::new();
    registry.register(
        "work",
        Arc::new(CallbackOperator::new(|ctx| {
            if ctx.try_number == 0 {
                Err(Error::TaskFailed("transient".to_string()))
            } else {
                Ok(())
            }
        })),
    );

    let mut flaky = task("flaky", &[]);
    flaky.retries = Some(1);
    flaky.retry_delay_secs = Some(0);
    let dag = daily_dag("retrying", date(1), vec![flaky]);

    let job = BackfillJob::new(
        context(&store, registry),
        dag,
        date(1),
        date(1),
        BackfillOptions::default(),
    );
    job.run().await.unwrap();

    let ti = TaskInstanceRepository::get(&store, &TaskInstanceKey::new("retrying", "flaky", date(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ti.state, TaskState::Success);
    assert_eq!(ti.try_number, 1);
    assert_eq!(run_state(&store, "retrying", 1).await, DagRunState::Success);
}

#[tokio::test]
async fn test_backfill_depends_on_past_deadlocks_mid_history() {
    let store = MemoryStateStore::new();
    let mut t = task("t", &[]);
    t.depends_on_past = Some(true);
    let dag = daily_dag("historic", date(1), vec![t]);

    // Starting after the DAG's first period: the prior instance never
    // exists, so nothing can ever run.
    let job = BackfillJob::new(
        context(&store, registry()),
        dag,
        date(2),
        date(3),
        BackfillOptions::default(),
    );
    let err = job.run().await.unwrap_err();
    assert!(matches!(err, Error::BackfillDeadlocked { .. }));

    assert_eq!(run_state(&store, "historic", 2).await, DagRunState::Failed);
    assert_eq!(run_state(&store, "historic", 3).await, DagRunState::Failed);
    assert_eq!(instance_state(&store, "historic", "t", 2).await, TaskState::None);
}

#[tokio::test]
async fn test_backfill_ignore_first_depends_on_past_unblocks() {
    let store = MemoryStateStore::new();
    let mut t = task("t", &[]);
    t.depends_on_past = Some(true);
    let dag = daily_dag("historic", date(1), vec![t]);

    let options = BackfillOptions {
        ignore_first_depends_on_past: true,
        ..BackfillOptions::default()
    };
    let job = BackfillJob::new(context(&store, registry()), dag, date(2), date(3), options);
    job.run().await.unwrap();

    // The waiver applies to the earliest date only; the second date is
    // satisfied by the first date's success.
    assert_eq!(instance_state(&store, "historic", "t", 2).await, TaskState::Success);
    assert_eq!(instance_state(&store, "historic", "t", 3).await, TaskState::Success);
}

#[tokio::test]
async fn test_backfill_ignore_task_deps_runs_downstream_of_failure() {
    let store = MemoryStateStore::new();
    let mut boom = task("a", &[]);
    boom.kind = Some("boom".to_string());
    let dag = daily_dag("forced", date(1), vec![boom, task("b", &["a"])]);

    let options = BackfillOptions {
        ignore_task_deps: true,
        ..BackfillOptions::default()
    };
    let job = BackfillJob::new(context(&store, registry()), dag, date(1), date(1), options);
    let err = job.run().await.unwrap_err();

    // The failure is still reported, but the downstream task ran anyway.
    assert!(matches!(err, Error::BackfillFailed { .. }));
    assert_eq!(instance_state(&store, "forced", "a", 1).await, TaskState::Failed);
    assert_eq!(instance_state(&store, "forced", "b", 1).await, TaskState::Success);
}

#[tokio::test]
async fn test_backfill_one_failed_branch_runs_on_failure() {
    let store = MemoryStateStore::new();
    let mut boom = task("a", &[]);
    boom.kind = Some("boom".to_string());
    let mut cleanup = task("cleanup", &["a"]);
    cleanup.trigger_rule = Some(TriggerRule::OneFailed);
    let dag = daily_dag(
        "branching",
        date(1),
        vec![boom, cleanup, task("publish", &["a"])],
    );

    let job = BackfillJob::new(
        context(&store, registry()),
        dag,
        date(1),
        date(1),
        BackfillOptions::default(),
    );
    let err = job.run().await.unwrap_err();
    assert!(matches!(err, Error::BackfillFailed { .. }));

    assert_eq!(
        instance_state(&store, "branching", "cleanup", 1).await,
        TaskState::Success
    );
    assert_eq!(
        instance_state(&store, "branching", "publish", 1).await,
        TaskState::UpstreamFailed
    );
}

#[tokio::test]
async fn test_backfill_skip_cascades_down_untaken_branch() {
    let store = MemoryStateStore::new();
    let mut on_failure = task("on_failure", &["a"]);
    on_failure.trigger_rule = Some(TriggerRule::AllFailed);
    let dag = daily_dag(
        "skippy",
        date(1),
        vec![task("a", &[]), on_failure, task("after", &["on_failure"])],
    );

    let job = BackfillJob::new(
        context(&store, registry()),
        dag,
        date(1),
        date(1),
        BackfillOptions::default(),
    );
    job.run().await.unwrap();

    assert_eq!(instance_state(&store, "skippy", "a", 1).await, TaskState::Success);
    assert_eq!(
        instance_state(&store, "skippy", "on_failure", 1).await,
        TaskState::Skipped
    );
    assert_eq!(
        instance_state(&store, "skippy", "after", 1).await,
        TaskState::Skipped
    );
    // Skipped leaves still count toward a successful run.
    assert_eq!(run_state(&store, "skippy", 1).await, DagRunState::Success);
}

#[tokio::test]
async fn test_backfill_honors_pool_slots() {
    let store = MemoryStateStore::new();
    store.upsert(&Pool::new("narrow", 1)).await.unwrap();

    let mut tasks = Vec::new();
    for id in ["a", "b", "c"] {
        let mut t = task(id, &[]);
        t.pool = Some("narrow".to_string());
        tasks.push(t);
    }
    let dag = daily_dag("pooled", date(1), tasks);

    let job = BackfillJob::new(
        context(&store, registry()),
        dag,
        date(1),
        date(1),
        BackfillOptions::default(),
    );
    job.run().await.unwrap();

    for id in ["a", "b", "c"] {
        assert_eq!(instance_state(&store, "pooled", id, 1).await, TaskState::Success);
    }
    // Every claimed slot was returned.
    let pool = PoolRepository::get(&store, "narrow").await.unwrap().unwrap();
    assert_eq!(pool.used_slots, 0);
}

#[tokio::test]
async fn test_backfill_reset_reruns_existing_runs() {
    let store = MemoryStateStore::new();
    let dag = daily_dag("redo", date(1), vec![task("t", &[])]);

    // A previous attempt left the run failed.
    let run = DagRun::new("redo", date(1));
    store.create(&run).await.unwrap();
    store
        .set_state("redo", date(1), DagRunState::Failed)
        .await
        .unwrap();
    let mut stale = TaskInstance::new(TaskInstanceKey::new("redo", "t", date(1)), None);
    stale.state = TaskState::Failed;
    stale.try_number = 3;
    store.insert_if_absent(&stale).await.unwrap();

    let options = BackfillOptions {
        reset_dag_runs: true,
        ..BackfillOptions::default()
    };
    let job = BackfillJob::new(context(&store, registry()), dag, date(1), date(1), options);
    job.run().await.unwrap();

    let ti = TaskInstanceRepository::get(&store, &TaskInstanceKey::new("redo", "t", date(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ti.state, TaskState::Success);
    assert_eq!(ti.try_number, 0);
    assert_eq!(run_state(&store, "redo", 1).await, DagRunState::Success);
}

#[tokio::test]
async fn test_backfill_reset_releases_slots_of_inflight_instances() {
    let store = MemoryStateStore::new();
    store.upsert(&Pool::new("etl", 2)).await.unwrap();
    let mut t = task("t", &[]);
    t.pool = Some("etl".to_string());
    let dag = daily_dag("redo", date(1), vec![t]);

    // A crashed job left the instance running with its slot claimed.
    store.create(&DagRun::new("redo", date(1))).await.unwrap();
    let mut stale = TaskInstance::new(
        TaskInstanceKey::new("redo", "t", date(1)),
        Some("etl".to_string()),
    );
    stale.state = TaskState::Running;
    store.insert_if_absent(&stale).await.unwrap();
    assert!(store.try_acquire("etl").await.unwrap());

    let options = BackfillOptions {
        reset_dag_runs: true,
        ..BackfillOptions::default()
    };
    let job = BackfillJob::new(context(&store, registry()), dag, date(1), date(1), options);
    job.run().await.unwrap();

    assert_eq!(instance_state(&store, "redo", "t", 1).await, TaskState::Success);
    let pool = PoolRepository::get(&store, "etl").await.unwrap().unwrap();
    assert_eq!(pool.used_slots, 0);
}

#[tokio::test]
async fn test_backfill_empty_range_is_a_noop() {
    let store = MemoryStateStore::new();
    let dag = daily_dag("empty", date(1), vec![task("t", &[])]);

    let job = BackfillJob::new(
        context(&store, registry()),
        dag,
        date(5),
        date(4),
        BackfillOptions::default(),
    );
    job.run().await.unwrap();

    assert!(store.latest_execution_date("empty").await.unwrap().is_none());
}
