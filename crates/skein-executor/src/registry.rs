//! Operator registry: task kind -> executable logic.
//!
//! The set of task kinds is open-ended. New kinds are added by
//! registering a `TaskExecutable`, never by modifying the scheduler.

use async_trait::async_trait;
use skein_core::ports::{TaskContext, TaskExecutable};
use skein_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Registry mapping a task kind to its implementation.
pub struct OperatorRegistry {
    operators: HashMap<String, Arc<dyn TaskExecutable>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self {
            operators: HashMap::new(),
        }
    }

    /// Registry pre-populated with the built-in operators.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("noop", Arc::new(NoopOperator));
        registry.register("shell", Arc::new(ShellOperator));
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, operator: Arc<dyn TaskExecutable>) {
        self.operators.insert(kind.into(), operator);
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn TaskExecutable>> {
        self.operators
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownOperator(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.operators.keys().map(String::as_str).collect()
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Does nothing, successfully. Useful as a dependency anchor.
pub struct NoopOperator;

#[async_trait]
impl TaskExecutable for NoopOperator {
    async fn run(&self, ctx: &TaskContext) -> Result<()> {
        debug!(instance = %ctx.key, "Noop task executed");
        Ok(())
    }
}

/// Runs the task's command through `sh -c`.
pub struct ShellOperator;

#[async_trait]
impl TaskExecutable for ShellOperator {
    async fn run(&self, ctx: &TaskContext) -> Result<()> {
        let command = ctx
            .command
            .as_deref()
            .ok_or_else(|| Error::TaskFailed("shell task has no command".to_string()))?;

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| Error::TaskFailed(format!("failed to spawn command: {}", e)))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::TaskFailed(format!(
                "command exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            )))
        }
    }
}

/// Wraps a closure as an operator. Primarily for tests and embedders.
pub struct CallbackOperator {
    callback: Arc<dyn Fn(&TaskContext) -> Result<()> + Send + Sync>,
}

impl CallbackOperator {
    pub fn new(callback: impl Fn(&TaskContext) -> Result<()> + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }
}

#[async_trait]
impl TaskExecutable for CallbackOperator {
    async fn run(&self, ctx: &TaskContext) -> Result<()> {
        (self.callback)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use skein_core::instance::TaskInstanceKey;

    fn ctx(command: Option<&str>) -> TaskContext {
        TaskContext {
            key: TaskInstanceKey::new("d", "t", Utc::now()),
            try_number: 0,
            command: command.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_unknown_kind() {
        let registry = OperatorRegistry::with_builtins();
        assert!(matches!(
            registry.get("teleport"),
            Err(Error::UnknownOperator(_))
        ));
    }

    #[tokio::test]
    async fn test_noop_succeeds() {
        let registry = OperatorRegistry::with_builtins();
        let op = registry.get("noop").unwrap();
        assert!(op.run(&ctx(None)).await.is_ok());
    }

    #[tokio::test]
    async fn test_shell_success_and_failure() {
        let op = ShellOperator;
        assert!(op.run(&ctx(Some("true"))).await.is_ok());

        let err = op.run(&ctx(Some("exit 3"))).await.unwrap_err();
        assert!(matches!(err, Error::TaskFailed(_)));

        let err = op.run(&ctx(None)).await.unwrap_err();
        assert!(matches!(err, Error::TaskFailed(_)));
    }

    #[tokio::test]
    async fn test_callback_operator() {
        let op = CallbackOperator::new(|ctx| {
            if ctx.try_number == 0 {
                Err(Error::TaskFailed("first try fails".to_string()))
            } else {
                Ok(())
            }
        });
        assert!(op.run(&ctx(None)).await.is_err());
        let mut retry = ctx(None);
        retry.try_number = 1;
        assert!(op.run(&retry).await.is_ok());
    }
}
