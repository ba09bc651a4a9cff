//! Scheduling loops for Skein: dependency evaluation, the live
//! scheduler, and bounded backfills.

pub mod backfill;
pub mod context;
pub mod deps;
pub mod pool;
pub mod scheduler;

pub use backfill::{BackfillJob, BackfillOptions};
pub use context::JobContext;
pub use deps::{BlockReason, Candidate, Decision, EvalContext, EvalOptions, PriorInstance};
pub use pool::PoolManager;
pub use scheduler::{SchedulerConfig, SchedulerJob};
