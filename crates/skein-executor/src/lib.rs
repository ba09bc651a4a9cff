//! Executor implementations for Skein.
//!
//! The scheduling core only knows the `Executor` port; this crate
//! provides the in-process implementations and the operator registry
//! that maps task kinds to runnable logic.

pub mod local;
pub mod registry;

pub use local::{LocalExecutor, SequentialExecutor};
pub use registry::{CallbackOperator, NoopOperator, OperatorRegistry, ShellOperator};
