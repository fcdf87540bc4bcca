//! Task data types

use chrono::{DateTime, Utc};
use idemlock_persistence::db_now;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

/// A unit of deferred work. `data` holds the dehydrated metadata produced by
/// the handler registered for `task_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: Uuid,
    pub version: i64,
    pub task_type: String,
    pub data: Vec<u8>,
    /// How many times the task has been handed to its handler
    pub exec_counter: u32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, data: Vec<u8>) -> Self {
        let now = db_now();
        Self {
            id: Uuid::new_v4(),
            version: 1,
            task_type: task_type.into(),
            data,
            exec_counter: 0,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn mark(&mut self, status: TaskStatus) {
        self.status = status;
        self.version += 1;
        self.updated_at = db_now();
    }
}
