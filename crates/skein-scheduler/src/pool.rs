//! Pool slot accounting for the scheduling loops.
//!
//! `PoolManager` wraps the pool repository with the policy the loops
//! need: tasks with no pool are unconstrained, and tasks naming an
//! undefined pool run unconstrained too (with a warning) rather than
//! wedging the DAG.

use skein_core::Result;
use skein_core::ports::PoolRepository;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct PoolManager {
    repo: Arc<dyn PoolRepository>,
}

impl PoolManager {
    pub fn new(repo: Arc<dyn PoolRepository>) -> Self {
        Self { repo }
    }

    /// Non-binding capacity check used during evaluation. The binding
    /// check is `try_acquire` at dispatch time.
    pub async fn has_capacity(&self, pool: Option<&str>) -> Result<bool> {
        let Some(name) = pool else { return Ok(true) };
        match self.repo.get(name).await? {
            Some(p) => Ok(p.open_slots() > 0),
            None => {
                warn!(pool = name, "Pool is not defined, running unconstrained");
                Ok(true)
            }
        }
    }

    /// Atomically claim a slot. Returns whether the claim succeeded;
    /// instances without a pool, or naming an undefined pool, always
    /// succeed without claiming anything.
    pub async fn try_acquire(&self, pool: Option<&str>) -> Result<bool> {
        let Some(name) = pool else { return Ok(true) };
        if self.repo.get(name).await?.is_none() {
            warn!(pool = name, "Pool is not defined, running unconstrained");
            return Ok(true);
        }
        self.repo.try_acquire(name).await
    }

    /// Return a slot claimed by `try_acquire`. No-op for unpooled
    /// instances and undefined pools.
    pub async fn release(&self, pool: Option<&str>) -> Result<()> {
        let Some(name) = pool else { return Ok(()) };
        if self.repo.get(name).await?.is_none() {
            return Ok(());
        }
        self.repo.release(name).await
    }
}
