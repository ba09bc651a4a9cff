//! Resource pools: named capacity limits on concurrently active task
//! instances.

use serde::{Deserialize, Serialize};

/// A named pool with a bounded number of concurrent slots.
///
/// `used_slots` reflects the instances currently QUEUED or RUNNING
/// against the pool. Allocation must be atomic with respect to other
/// concurrent allocators; the repository implementations guarantee
/// `0 <= used_slots <= total_slots` at all times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub total_slots: u32,
    pub used_slots: u32,
}

impl Pool {
    pub fn new(name: impl Into<String>, total_slots: u32) -> Self {
        Self {
            name: name.into(),
            total_slots,
            used_slots: 0,
        }
    }

    pub fn open_slots(&self) -> u32 {
        self.total_slots.saturating_sub(self.used_slots)
    }
}
