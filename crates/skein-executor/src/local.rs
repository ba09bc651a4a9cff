//! In-process executors.
//!
//! `SequentialExecutor` runs each task inline during dispatch and is
//! fully deterministic; backfills and tests use it. `LocalExecutor`
//! spawns tasks onto the tokio runtime with a bounded worker count.
//! Both report progress through the polled event queue, never by
//! blocking the scheduling loop.

use async_trait::async_trait;
use skein_core::ports::{
    DispatchOutcome, Executor, ExecutorEvent, TaskContext, TaskOutcome, TaskPayload,
};
use skein_core::Result;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info};

use crate::registry::OperatorRegistry;

/// Runs tasks one at a time, inline with the dispatch call.
pub struct SequentialExecutor {
    registry: Arc<OperatorRegistry>,
    events: Mutex<VecDeque<ExecutorEvent>>,
}

impl SequentialExecutor {
    pub fn new(registry: Arc<OperatorRegistry>) -> Self {
        Self {
            registry,
            events: Mutex::new(VecDeque::new()),
        }
    }

    async fn push(&self, event: ExecutorEvent) {
        self.events.lock().await.push_back(event);
    }
}

#[async_trait]
impl Executor for SequentialExecutor {
    async fn dispatch(&self, payload: TaskPayload) -> Result<DispatchOutcome> {
        let operator = match self.registry.get(&payload.kind) {
            Ok(op) => op,
            Err(e) => return Ok(DispatchOutcome::Rejected(e.to_string())),
        };

        let ctx = TaskContext {
            key: payload.key.clone(),
            try_number: payload.try_number,
            command: payload.command.clone(),
        };

        self.push(ExecutorEvent::Started(payload.key.clone())).await;
        debug!(instance = %payload.key, kind = %payload.kind, "Running task inline");

        let outcome = match operator.run(&ctx).await {
            Ok(()) => TaskOutcome::Success,
            Err(e) => TaskOutcome::Failed(e.to_string()),
        };
        self.push(ExecutorEvent::Finished(payload.key, outcome)).await;

        Ok(DispatchOutcome::Accepted)
    }

    async fn poll_events(&self) -> Result<Vec<ExecutorEvent>> {
        let mut queue = self.events.lock().await;
        Ok(queue.drain(..).collect())
    }

    async fn is_alive(&self) -> bool {
        true
    }
}

/// Runs tasks concurrently on the tokio runtime, bounded by a worker
/// count.
pub struct LocalExecutor {
    registry: Arc<OperatorRegistry>,
    workers: Arc<Semaphore>,
    tx: tokio::sync::mpsc::UnboundedSender<ExecutorEvent>,
    rx: Mutex<tokio::sync::mpsc::UnboundedReceiver<ExecutorEvent>>,
}

impl LocalExecutor {
    pub fn new(registry: Arc<OperatorRegistry>, parallelism: usize) -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        info!(parallelism, "Local executor started");
        Self {
            registry,
            workers: Arc::new(Semaphore::new(parallelism.max(1))),
            tx,
            rx: Mutex::new(rx),
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn dispatch(&self, payload: TaskPayload) -> Result<DispatchOutcome> {
        let operator = match self.registry.get(&payload.kind) {
            Ok(op) => op,
            Err(e) => return Ok(DispatchOutcome::Rejected(e.to_string())),
        };

        let workers = self.workers.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            // Holding a permit bounds in-flight tasks; queued dispatches
            // wait here, not in the scheduling loop.
            let _permit = workers.acquire_owned().await;
            let _ = tx.send(ExecutorEvent::Started(payload.key.clone()));

            let ctx = TaskContext {
                key: payload.key.clone(),
                try_number: payload.try_number,
                command: payload.command.clone(),
            };
            let outcome = match operator.run(&ctx).await {
                Ok(()) => TaskOutcome::Success,
                Err(e) => TaskOutcome::Failed(e.to_string()),
            };
            let _ = tx.send(ExecutorEvent::Finished(payload.key, outcome));
        });

        Ok(DispatchOutcome::Accepted)
    }

    async fn poll_events(&self) -> Result<Vec<ExecutorEvent>> {
        let mut rx = self.rx.lock().await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        Ok(events)
    }

    async fn is_alive(&self) -> bool {
        true
    }
}
