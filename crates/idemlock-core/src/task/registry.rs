// Task registry
// Maps a task type to the handler triple that knows how to (de)hydrate and run it

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;
use idemlock_common::{IdemError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{Instrument, Span};

use super::model::{Task, TaskStatus};

pub type HydrateFn = Arc<dyn Fn(&[u8]) -> anyhow::Result<Value> + Send + Sync>;
pub type DehydrateFn = Arc<dyn Fn(&Value) -> anyhow::Result<Vec<u8>> + Send + Sync>;
pub type ExecuteFn = Arc<dyn Fn(Task, Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Everything needed to handle one task type: turn stored bytes into
/// metadata, metadata into bytes, and run the task.
#[derive(Clone)]
pub struct TaskHandler {
    pub hydrate: HydrateFn,
    pub dehydrate: DehydrateFn,
    pub execute: ExecuteFn,
}

impl fmt::Debug for TaskHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandler").finish_non_exhaustive()
    }
}

impl TaskHandler {
    pub fn new<H, D, E, Fut>(hydrate: H, dehydrate: D, execute: E) -> Self
    where
        H: Fn(&[u8]) -> anyhow::Result<Value> + Send + Sync + 'static,
        D: Fn(&Value) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
        E: Fn(Task, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            hydrate: Arc::new(hydrate),
            dehydrate: Arc::new(dehydrate),
            execute: Arc::new(move |task, metadata| execute(task, metadata).boxed()),
        }
    }

    /// Handler whose metadata is `M` stored as JSON.
    pub fn json<M, E, Fut>(execute: E) -> Self
    where
        M: Serialize + DeserializeOwned + Send + 'static,
        E: Fn(Task, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let execute = Arc::new(execute);
        Self::new(
            |data: &[u8]| {
                let metadata: M = serde_json::from_slice(data)?;
                Ok(serde_json::to_value(metadata)?)
            },
            |metadata: &Value| {
                let typed: M = serde_json::from_value(metadata.clone())?;
                Ok(serde_json::to_vec(&typed)?)
            },
            move |task, metadata| {
                let execute = execute.clone();
                async move {
                    let metadata: M = serde_json::from_value(metadata)?;
                    execute(task, metadata).await
                }
            },
        )
    }
}

/// Registry of task handlers keyed by task type.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    handlers: DashMap<String, TaskHandler>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `task_type`. The first registration wins; a
    /// duplicate is logged and ignored.
    pub fn register(&self, log: &Span, task_type: impl Into<String>, handler: TaskHandler) -> bool {
        let task_type = task_type.into();
        let _enter = log.enter();
        match self.handlers.entry(task_type) {
            Entry::Occupied(entry) => {
                tracing::warn!(task_type = %entry.key(), "Task type already registered, ignoring");
                false
            }
            Entry::Vacant(entry) => {
                tracing::info!(task_type = %entry.key(), "Task type registered");
                entry.insert(handler);
                true
            }
        }
    }

    pub fn lookup(&self, task_type: &str) -> Option<TaskHandler> {
        self.handlers.get(task_type).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Build a pending task, dehydrating `metadata` with the registered handler.
    pub fn create_task(&self, task_type: &str, metadata: &Value) -> Result<Task> {
        let handler = self
            .lookup(task_type)
            .ok_or_else(|| IdemError::UnknownTaskType(task_type.to_string()))?;
        let data = (handler.dehydrate)(metadata).map_err(|source| IdemError::TaskFailed {
            task_type: task_type.to_string(),
            source,
        })?;
        Ok(Task::new(task_type, data))
    }

    /// Hydrate and execute `task`, recording the outcome on it.
    pub async fn process(&self, log: &Span, task: &mut Task) -> Result<()> {
        async move {
            let handler = self
                .lookup(&task.task_type)
                .ok_or_else(|| IdemError::UnknownTaskType(task.task_type.clone()))?;

            task.exec_counter += 1;
            let outcome = match (handler.hydrate)(&task.data) {
                Ok(metadata) => (handler.execute)(task.clone(), metadata).await,
                Err(err) => Err(err),
            };

            match outcome {
                Ok(()) => {
                    task.mark(TaskStatus::Completed);
                    tracing::debug!(task_id = %task.id, task_type = %task.task_type, "Task completed");
                    Ok(())
                }
                Err(source) => {
                    task.mark(TaskStatus::Failed);
                    tracing::warn!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        exec_counter = task.exec_counter,
                        error = %source,
                        "Task failed"
                    );
                    Err(IdemError::TaskFailed {
                        task_type: task.task_type.clone(),
                        source,
                    })
                }
            }
        }
        .instrument(log.clone())
        .await
    }
}
