// SPDX-License-Identifier: GPL-3.0-or-later
use anyhow::Result;
use chrono::{DateTime, Utc};
use marquee_domain::{ScheduledTask, ScheduledTaskId, Task, TaskId, TaskProgress, TaskStatus};

// ============================================================================
// Repository Traits
// ============================================================================

/// Optional filters for task listings; `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub command_name: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self
                .command_name
                .as_deref()
                .map_or(true, |c| task.command_name == c)
    }
}

/// Durable store of task records.
///
/// Every write touches a single row. State changes go through
/// [`TaskRepository::compare_and_set`] so concurrent writers cannot overwrite
/// each other's transitions.
#[async_trait::async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert(&self, task: &Task) -> Result<()>;
    async fn get_by_id(&self, id: TaskId) -> Result<Option<Task>>;

    /// Newest first.
    async fn list(&self, filter: &TaskFilter, limit: i64, offset: i64) -> Result<Vec<Task>>;
    async fn count(&self, filter: &TaskFilter) -> Result<i64>;

    /// Oldest first; used for startup recovery.
    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;

    /// Persist status, progress, timestamps and error of `task` if the stored
    /// status is still `expected`. Returns whether the row was updated.
    async fn compare_and_set(&self, task: &Task, expected: TaskStatus) -> Result<bool>;

    /// Overwrite progress of a running task. Returns false if the task is not running.
    async fn update_progress(&self, id: TaskId, progress: &TaskProgress) -> Result<bool>;

    /// Remove terminal tasks that ended before `cutoff`. Returns the number removed.
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Store of recurring task definitions.
#[async_trait::async_trait]
pub trait ScheduledTaskRepository: Send + Sync {
    async fn create(&self, scheduled: &ScheduledTask) -> Result<()>;
    async fn get_by_id(&self, id: ScheduledTaskId) -> Result<Option<ScheduledTask>>;
    async fn get_by_name(&self, name: &str) -> Result<Option<ScheduledTask>>;
    async fn list(&self) -> Result<Vec<ScheduledTask>>;
    async fn update(&self, scheduled: &ScheduledTask) -> Result<()>;
    /// Returns false if no definition had that id.
    async fn delete(&self, id: ScheduledTaskId) -> Result<bool>;
}
