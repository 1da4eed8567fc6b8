// SPDX-License-Identifier: GPL-3.0-or-later
//! In-process stores with the same semantics as the SQLite adapters.
//!
//! Useful for tests and for embedding the engine without a database. The task
//! store can be switched offline to exercise store-unavailable paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use marquee_domain::{ScheduledTask, ScheduledTaskId, Task, TaskId, TaskProgress, TaskStatus};
use tracing::warn;

use crate::repositories::{ScheduledTaskRepository, TaskFilter, TaskRepository};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!(target: "repository", "in-memory store mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

#[derive(Clone, Default)]
pub struct InMemoryTaskRepository {
    tasks: Arc<Mutex<HashMap<TaskId, Task>>>,
    offline: Arc<AtomicBool>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail, as if the backing database went away.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            bail!("task store is unavailable");
        }
        Ok(())
    }

    fn sorted(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut tasks: Vec<Task> = lock(&self.tasks)
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.queued_at.cmp(&a.queued_at).then(a.id.0.cmp(&b.id.0)));
        tasks
    }
}

#[async_trait::async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn insert(&self, task: &Task) -> Result<()> {
        self.check_online()?;
        let mut tasks = lock(&self.tasks);
        if tasks.contains_key(&task.id) {
            bail!("task {} already exists", task.id);
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: TaskId) -> Result<Option<Task>> {
        self.check_online()?;
        Ok(lock(&self.tasks).get(&id).cloned())
    }

    async fn list(&self, filter: &TaskFilter, limit: i64, offset: i64) -> Result<Vec<Task>> {
        self.check_online()?;
        let offset = usize::try_from(offset.max(0))?;
        let limit = usize::try_from(limit.max(0))?;
        Ok(self
            .sorted(filter)
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn count(&self, filter: &TaskFilter) -> Result<i64> {
        self.check_online()?;
        let count = lock(&self.tasks).values().filter(|t| filter.matches(t)).count();
        Ok(i64::try_from(count)?)
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.check_online()?;
        let filter = TaskFilter {
            status: Some(status),
            ..Default::default()
        };
        let mut tasks = self.sorted(&filter);
        tasks.reverse();
        Ok(tasks)
    }

    async fn compare_and_set(&self, task: &Task, expected: TaskStatus) -> Result<bool> {
        self.check_online()?;
        let mut tasks = lock(&self.tasks);
        match tasks.get_mut(&task.id) {
            Some(stored) if stored.status == expected => {
                stored.status = task.status;
                stored.progress = task.progress.clone();
                stored.started_at = task.started_at;
                stored.ended_at = task.ended_at;
                stored.error = task.error.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_progress(&self, id: TaskId, progress: &TaskProgress) -> Result<bool> {
        self.check_online()?;
        let mut tasks = lock(&self.tasks);
        match tasks.get_mut(&id) {
            Some(stored) if stored.status == TaskStatus::Running => {
                stored.progress = progress.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_online()?;
        let mut tasks = lock(&self.tasks);
        let before = tasks.len();
        tasks.retain(|_, t| !(t.is_terminal() && t.ended_at.is_some_and(|end| end < cutoff)));
        Ok(u64::try_from(before - tasks.len())?)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryScheduledTaskRepository {
    entries: Arc<Mutex<HashMap<ScheduledTaskId, ScheduledTask>>>,
}

impl InMemoryScheduledTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ScheduledTaskRepository for InMemoryScheduledTaskRepository {
    async fn create(&self, scheduled: &ScheduledTask) -> Result<()> {
        let mut entries = lock(&self.entries);
        if entries.values().any(|e| e.name == scheduled.name) {
            bail!("scheduled task named '{}' already exists", scheduled.name);
        }
        entries.insert(scheduled.id, scheduled.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: ScheduledTaskId) -> Result<Option<ScheduledTask>> {
        Ok(lock(&self.entries).get(&id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<ScheduledTask>> {
        Ok(lock(&self.entries).values().find(|e| e.name == name).cloned())
    }

    async fn list(&self) -> Result<Vec<ScheduledTask>> {
        let mut entries: Vec<ScheduledTask> = lock(&self.entries).values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn update(&self, scheduled: &ScheduledTask) -> Result<()> {
        lock(&self.entries).insert(scheduled.id, scheduled.clone());
        Ok(())
    }

    async fn delete(&self, id: ScheduledTaskId) -> Result<bool> {
        Ok(lock(&self.entries).remove(&id).is_some())
    }
}
