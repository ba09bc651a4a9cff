//! Persistence layer for Skein.
//!
//! Two interchangeable state stores behind the core repository ports:
//! PostgreSQL for deployments with cooperating scheduler replicas, and a
//! single-process in-memory store for tests, backfills, and local mode.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStateStore;
pub use postgres::{Database, PgDagRunRepository, PgPoolRepository, PgTaskInstanceRepository};
