//! In-memory state store.
//!
//! A single async mutex guards all scheduling state, which makes the
//! compare-and-swap and pool-slot operations trivially linearizable. Used
//! by the test suite and by local single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skein_core::instance::{DagRun, TaskInstance, TaskInstanceKey};
use skein_core::pool::Pool;
use skein_core::ports::{DagRunRepository, PoolRepository, TaskInstanceRepository};
use skein_core::state::{DagRunState, TaskState};
use skein_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    runs: HashMap<(String, DateTime<Utc>), DagRun>,
    instances: HashMap<TaskInstanceKey, TaskInstance>,
    pools: HashMap<String, Pool>,
}

/// All three scheduling repositories over one shared mutex.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DagRunRepository for MemoryStateStore {
    async fn create(&self, run: &DagRun) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let key = (run.dag_id.clone(), run.execution_date);
        if inner.runs.contains_key(&key) {
            return Ok(false);
        }
        inner.runs.insert(key, run.clone());
        Ok(true)
    }

    async fn get(&self, dag_id: &str, execution_date: DateTime<Utc>) -> Result<Option<DagRun>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .get(&(dag_id.to_string(), execution_date))
            .cloned())
    }

    async fn set_state(
        &self,
        dag_id: &str,
        execution_date: DateTime<Utc>,
        state: DagRunState,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .runs
            .get_mut(&(dag_id.to_string(), execution_date))
            .ok_or_else(|| {
                Error::Database(format!(
                    "no dag run {} @ {}",
                    dag_id,
                    execution_date.to_rfc3339()
                ))
            })?;
        run.state = state;
        Ok(())
    }

    async fn list_running(&self, dag_id: &str) -> Result<Vec<DagRun>> {
        let inner = self.inner.lock().await;
        let mut runs: Vec<DagRun> = inner
            .runs
            .values()
            .filter(|r| r.dag_id == dag_id && r.state == DagRunState::Running)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.execution_date);
        Ok(runs)
    }

    async fn latest_execution_date(&self, dag_id: &str) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .values()
            .filter(|r| r.dag_id == dag_id)
            .map(|r| r.execution_date)
            .max())
    }
}

#[async_trait]
impl TaskInstanceRepository for MemoryStateStore {
    async fn get(&self, key: &TaskInstanceKey) -> Result<Option<TaskInstance>> {
        let inner = self.inner.lock().await;
        Ok(inner.instances.get(key).cloned())
    }

    async fn insert_if_absent(&self, instance: &TaskInstance) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.instances.contains_key(&instance.key) {
            return Ok(false);
        }
        inner.instances.insert(instance.key.clone(), instance.clone());
        Ok(true)
    }

    async fn update_if_state(
        &self,
        instance: &TaskInstance,
        expected: TaskState,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.instances.get_mut(&instance.key) {
            Some(current) if current.state == expected => {
                *current = instance.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_for_run(
        &self,
        dag_id: &str,
        execution_date: DateTime<Utc>,
    ) -> Result<Vec<TaskInstance>> {
        let inner = self.inner.lock().await;
        let mut instances: Vec<TaskInstance> = inner
            .instances
            .values()
            .filter(|ti| ti.key.dag_id == dag_id && ti.key.execution_date == execution_date)
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.key.task_id.cmp(&b.key.task_id));
        Ok(instances)
    }

    async fn get_previous(
        &self,
        dag_id: &str,
        task_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<TaskInstance>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .instances
            .values()
            .filter(|ti| {
                ti.key.dag_id == dag_id
                    && ti.key.task_id == task_id
                    && ti.key.execution_date < before
            })
            .max_by_key(|ti| ti.key.execution_date)
            .cloned())
    }

    async fn count_active(&self, dag_id: &str) -> Result<usize> {
        let inner = self.inner.lock().await;
        Ok(inner
            .instances
            .values()
            .filter(|ti| ti.key.dag_id == dag_id && ti.state.is_active())
            .count())
    }

    async fn list_active(&self) -> Result<Vec<TaskInstance>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .instances
            .values()
            .filter(|ti| ti.state.is_active())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PoolRepository for MemoryStateStore {
    async fn upsert(&self, pool: &Pool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.pools.get_mut(&pool.name) {
            // Resizing must not discard slots held by running instances.
            Some(existing) => existing.total_slots = pool.total_slots,
            None => {
                inner.pools.insert(pool.name.clone(), pool.clone());
            }
        }
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Pool>> {
        let inner = self.inner.lock().await;
        Ok(inner.pools.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<Pool>> {
        let inner = self.inner.lock().await;
        let mut pools: Vec<Pool> = inner.pools.values().cloned().collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pools)
    }

    async fn try_acquire(&self, name: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.pools.get_mut(name) {
            Some(pool) if pool.used_slots < pool.total_slots => {
                pool.used_slots += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(pool) = inner.pools.get_mut(name) {
            pool.used_slots = pool.used_slots.saturating_sub(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(task: &str) -> TaskInstanceKey {
        TaskInstanceKey::new("dag", task, Utc::now())
    }

    #[tokio::test]
    async fn test_dag_run_unique_insert() {
        let store = MemoryStateStore::new();
        let run = DagRun::new("dag", Utc::now());
        assert!(store.create(&run).await.unwrap());
        // losing the race is not an error
        assert!(!store.create(&run).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_if_state_is_a_cas() {
        let store = MemoryStateStore::new();
        let mut ti = TaskInstance::new(key("t"), None);
        store.insert_if_absent(&ti).await.unwrap();

        ti.state = TaskState::Queued;
        assert!(store.update_if_state(&ti, TaskState::None).await.unwrap());
        // second swap from the stale expectation must fail
        assert!(!store.update_if_state(&ti, TaskState::None).await.unwrap());

        let stored = TaskInstanceRepository::get(&store, &ti.key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, TaskState::Queued);
    }

    #[tokio::test]
    async fn test_pool_slots_never_exceed_capacity() {
        let store = MemoryStateStore::new();
        store.upsert(&Pool::new("etl", 2)).await.unwrap();

        assert!(store.try_acquire("etl").await.unwrap());
        assert!(store.try_acquire("etl").await.unwrap());
        assert!(!store.try_acquire("etl").await.unwrap());

        store.release("etl").await.unwrap();
        assert!(store.try_acquire("etl").await.unwrap());
    }

    #[tokio::test]
    async fn test_pool_acquire_under_contention() {
        let store = MemoryStateStore::new();
        store.upsert(&Pool::new("etl", 3)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(
                async move { store.try_acquire("etl").await },
            ));
        }

        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 3);

        let pool = PoolRepository::get(&store, "etl").await.unwrap().unwrap();
        assert_eq!(pool.used_slots, 3);
    }

    #[tokio::test]
    async fn test_pool_resize_preserves_used_slots() {
        let store = MemoryStateStore::new();
        store.upsert(&Pool::new("etl", 2)).await.unwrap();
        assert!(store.try_acquire("etl").await.unwrap());
        assert!(store.try_acquire("etl").await.unwrap());

        store.upsert(&Pool::new("etl", 1)).await.unwrap();
        let pool = PoolRepository::get(&store, "etl").await.unwrap().unwrap();
        assert_eq!(pool.used_slots, 2);
        assert_eq!(pool.total_slots, 1);
        // over capacity after shrinking, so no new claims until released
        assert!(!store.try_acquire("etl").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_unknown_pool_is_noop() {
        let store = MemoryStateStore::new();
        store.release("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_get_previous_picks_latest_earlier_date() {
        let store = MemoryStateStore::new();
        let base = Utc::now();
        for days in [1i64, 2, 3] {
            let ti = TaskInstance::new(
                TaskInstanceKey::new("dag", "t", base + chrono::Duration::days(days)),
                None,
            );
            store.insert_if_absent(&ti).await.unwrap();
        }

        let prev = store
            .get_previous("dag", "t", base + chrono::Duration::days(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(prev.key.execution_date, base + chrono::Duration::days(2));

        let none = store
            .get_previous("dag", "t", base + chrono::Duration::days(1))
            .await
            .unwrap();
        assert!(none.is_none());
    }
}
