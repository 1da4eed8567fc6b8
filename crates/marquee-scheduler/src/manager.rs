// SPDX-License-Identifier: GPL-3.0-or-later
//! Admission and cancellation of tasks.

use std::sync::Arc;
use std::time::Duration;

use marquee_domain::{ScheduledTaskId, Task, TaskBody, TaskId, TaskPriority, TaskStatus, TaskTrigger};
use marquee_infrastructure::TaskRepository;
use serde_json::Value;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::queue::{PoolKind, PoolQueues, QueueError};
use crate::registry::HandlerRegistry;
use crate::supervisor::RunningTasks;

/// A request to run a command once.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub command_name: String,
    /// Must be a JSON object; `null` is treated as an empty body.
    pub body: Value,
    pub priority: TaskPriority,
    pub trigger: TaskTrigger,
    pub scheduled_task_id: Option<ScheduledTaskId>,
}

impl NewTask {
    pub fn new(name: impl Into<String>, command_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command_name: command_name.into(),
            body: Value::Null,
            priority: TaskPriority::Normal,
            trigger: TaskTrigger::Api,
            scheduled_task_id: None,
        }
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn trigger(mut self, trigger: TaskTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn spawned_by(mut self, scheduled_task_id: ScheduledTaskId) -> Self {
        self.scheduled_task_id = Some(scheduled_task_id);
        self.trigger = TaskTrigger::Scheduler;
        self
    }
}

pub(crate) fn body_object(body: Value) -> Result<TaskBody> {
    match body {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(TaskBody::new()),
        other => Err(EngineError::MalformedBody(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub struct QueueManager {
    tasks: Arc<dyn TaskRepository>,
    registry: Arc<HandlerRegistry>,
    queues: Arc<PoolQueues>,
    running: RunningTasks,
    clock: Arc<dyn Clock>,
    enqueue_timeout: Duration,
}

impl QueueManager {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        registry: Arc<HandlerRegistry>,
        queues: Arc<PoolQueues>,
        running: RunningTasks,
        clock: Arc<dyn Clock>,
        enqueue_timeout: Duration,
    ) -> Self {
        Self {
            tasks,
            registry,
            queues,
            running,
            clock,
            enqueue_timeout,
        }
    }

    /// Validate, persist and queue a task, waiting up to the enqueue timeout
    /// for queue capacity.
    ///
    /// Capacity is reserved before the task is written, so every rejection
    /// leaves the store untouched.
    pub async fn enqueue(&self, request: NewTask) -> Result<Task> {
        self.admit(request, Some(self.enqueue_timeout)).await
    }

    /// Like [`enqueue`](Self::enqueue) but rejects with `QueueFull` at once
    /// when the pool has no free capacity.
    pub async fn try_enqueue(&self, request: NewTask) -> Result<Task> {
        self.admit(request, None).await
    }

    async fn admit(&self, request: NewTask, wait: Option<Duration>) -> Result<Task> {
        if !self.registry.contains(&request.command_name) {
            return Err(EngineError::UnknownCommand(request.command_name));
        }
        let body = body_object(request.body)?;

        let pool = PoolKind::for_priority(request.priority);
        let queue = self.queues.get(pool);
        let reserved = match wait {
            Some(wait) => queue.reserve(wait).await,
            None => queue.try_reserve(),
        };
        let slot = reserved.map_err(|e| match e {
            QueueError::Full => EngineError::QueueFull { pool },
            QueueError::Closed => EngineError::ShuttingDown,
        })?;

        let mut task = Task::new(
            request.name,
            request.command_name,
            body,
            request.priority,
            request.trigger,
            self.clock.now(),
        );
        if let Some(scheduled_task_id) = request.scheduled_task_id {
            task = task.spawned_by(scheduled_task_id);
        }

        self.tasks.insert(&task).await?;
        queue.push(slot, task.id, task.priority);

        info!(
            target: "queue",
            task_id = %task.id,
            command = %task.command_name,
            %pool,
            trigger = %task.trigger,
            "task queued"
        );
        Ok(task)
    }

    /// Put an already persisted Queued task back into its pool, waiting for capacity.
    pub(crate) async fn requeue(&self, task: &Task) -> Result<()> {
        let queue = self.queues.for_priority(task.priority);
        let slot = queue
            .reserve_unbounded()
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        queue.push(slot, task.id, task.priority);
        debug!(target: "queue", task_id = %task.id, pool = %queue.kind(), "task requeued");
        Ok(())
    }

    /// Cancel a queued or running task.
    ///
    /// A queued task is cancelled immediately. A running task is only
    /// signalled; it becomes Cancelled once its handler returns.
    pub async fn cancel(&self, task_id: TaskId) -> Result<()> {
        loop {
            let task = self
                .tasks
                .get_by_id(task_id)
                .await?
                .ok_or(EngineError::TaskNotFound(task_id))?;
            if task.is_terminal() {
                return Err(EngineError::AlreadyTerminal(task_id));
            }

            if self.running.signal(task_id) {
                info!(target: "queue", %task_id, "cancellation requested for running task");
                return Ok(());
            }

            // Store first: a failed write must leave the entry queued.
            let expected = task.status;
            let mut cancelled = task;
            cancelled.cancel(self.clock.now())?;
            if self.tasks.compare_and_set(&cancelled, expected).await? {
                if expected == TaskStatus::Queued {
                    self.queues.for_priority(cancelled.priority).remove(task_id);
                }
                info!(target: "queue", %task_id, previous = %expected, "task cancelled");
                return Ok(());
            }
            // Status moved underneath us; look again.
            debug!(target: "queue", %task_id, "cancel lost a race, retrying");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::handler::{TaskContext, TaskHandler};
    use async_trait::async_trait;
    use marquee_infrastructure::{InMemoryTaskRepository, TaskFilter};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct Noop;

    #[async_trait]
    impl TaskHandler for Noop {
        fn name(&self) -> String {
            "Noop".to_string()
        }

        async fn execute(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn manager(repo: &InMemoryTaskRepository, capacity: usize) -> (QueueManager, Arc<PoolQueues>) {
        let queues = Arc::new(PoolQueues::new(capacity));
        let registry = HandlerRegistry::builder().register("RssSync", Noop).build();
        let manager = QueueManager::new(
            Arc::new(repo.clone()),
            registry,
            queues.clone(),
            RunningTasks::default(),
            Arc::new(SystemClock),
            Duration::from_millis(20),
        );
        (manager, queues)
    }

    #[tokio::test]
    async fn enqueue_persists_then_queues() {
        let repo = InMemoryTaskRepository::new();
        let (manager, queues) = manager(&repo, 4);

        let task = manager
            .enqueue(
                NewTask::new("RSS Sync", "RssSync")
                    .priority(TaskPriority::High)
                    .body(json!({"force": true})),
            )
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.body["force"], json!(true));
        assert_eq!(repo.len(), 1);
        assert_eq!(queues.get(PoolKind::High).depth(), 1);
        assert_eq!(queues.get(PoolKind::Normal).depth(), 0);
    }

    #[tokio::test]
    async fn rejections_leave_no_task_behind() {
        let repo = InMemoryTaskRepository::new();
        let (manager, _queues) = manager(&repo, 1);

        let unknown = manager.enqueue(NewTask::new("x", "Missing")).await.unwrap_err();
        assert!(matches!(unknown, EngineError::UnknownCommand(ref c) if c == "Missing"));

        let malformed = manager
            .enqueue(NewTask::new("x", "RssSync").body(json!([1, 2])))
            .await
            .unwrap_err();
        assert!(matches!(malformed, EngineError::MalformedBody(_)));

        manager.enqueue(NewTask::new("x", "RssSync")).await.unwrap();
        let full = manager.enqueue(NewTask::new("x", "RssSync")).await.unwrap_err();
        assert!(matches!(full, EngineError::QueueFull { pool: PoolKind::Normal }));
        assert!(full.is_rejection());

        assert_eq!(repo.count(&TaskFilter::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn store_outage_rejects_and_releases_capacity() {
        let repo = InMemoryTaskRepository::new();
        let (manager, queues) = manager(&repo, 1);

        repo.set_offline(true);
        let err = manager.enqueue(NewTask::new("x", "RssSync")).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));

        repo.set_offline(false);
        assert!(manager.enqueue(NewTask::new("x", "RssSync")).await.is_ok());
        assert_eq!(queues.get(PoolKind::Normal).depth(), 1);
    }

    #[tokio::test]
    async fn try_enqueue_rejects_immediately_when_full() {
        let repo = InMemoryTaskRepository::new();
        let queues = Arc::new(PoolQueues::new(1));
        let registry = HandlerRegistry::builder().register("RssSync", Noop).build();
        let manager = QueueManager::new(
            Arc::new(repo.clone()),
            registry,
            queues,
            RunningTasks::default(),
            Arc::new(SystemClock),
            Duration::from_secs(60),
        );

        manager.try_enqueue(NewTask::new("x", "RssSync")).await.unwrap();
        let started = std::time::Instant::now();
        let full = manager
            .try_enqueue(NewTask::new("x", "RssSync"))
            .await
            .unwrap_err();
        assert!(matches!(full, EngineError::QueueFull { pool: PoolKind::Normal }));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(repo.len(), 1);
    }

    /// Reads succeed, status writes fail.
    struct ReadOnlyTasks(InMemoryTaskRepository);

    #[async_trait]
    impl TaskRepository for ReadOnlyTasks {
        async fn insert(&self, task: &Task) -> anyhow::Result<()> {
            self.0.insert(task).await
        }

        async fn get_by_id(&self, id: TaskId) -> anyhow::Result<Option<Task>> {
            self.0.get_by_id(id).await
        }

        async fn list(
            &self,
            filter: &TaskFilter,
            limit: i64,
            offset: i64,
        ) -> anyhow::Result<Vec<Task>> {
            self.0.list(filter, limit, offset).await
        }

        async fn count(&self, filter: &TaskFilter) -> anyhow::Result<i64> {
            self.0.count(filter).await
        }

        async fn list_by_status(&self, status: TaskStatus) -> anyhow::Result<Vec<Task>> {
            self.0.list_by_status(status).await
        }

        async fn compare_and_set(&self, _task: &Task, _expected: TaskStatus) -> anyhow::Result<bool> {
            anyhow::bail!("database is locked")
        }

        async fn update_progress(
            &self,
            id: TaskId,
            progress: &marquee_domain::TaskProgress,
        ) -> anyhow::Result<bool> {
            self.0.update_progress(id, progress).await
        }

        async fn delete_finished_before(
            &self,
            cutoff: chrono::DateTime<chrono::Utc>,
        ) -> anyhow::Result<u64> {
            self.0.delete_finished_before(cutoff).await
        }
    }

    #[tokio::test]
    async fn failed_cancel_keeps_the_task_queued() {
        let repo = InMemoryTaskRepository::new();
        let queues = Arc::new(PoolQueues::new(4));
        let registry = HandlerRegistry::builder().register("RssSync", Noop).build();
        let manager = QueueManager::new(
            Arc::new(ReadOnlyTasks(repo.clone())),
            registry,
            queues.clone(),
            RunningTasks::default(),
            Arc::new(SystemClock),
            Duration::from_millis(20),
        );
        let task = manager.enqueue(NewTask::new("x", "RssSync")).await.unwrap();

        let err = manager.cancel(task.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));

        assert_eq!(queues.get(PoolKind::Normal).depth(), 1);
        assert_eq!(
            repo.get_by_id(task.id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn second_cancel_reports_already_terminal() {
        let repo = InMemoryTaskRepository::new();
        let (manager, queues) = manager(&repo, 4);
        let task = manager.enqueue(NewTask::new("x", "RssSync")).await.unwrap();

        manager.cancel(task.id).await.unwrap();
        assert_eq!(queues.get(PoolKind::Normal).depth(), 0);
        let stored = repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert!(stored.ended_at.is_some());

        let again = manager.cancel(task.id).await.unwrap_err();
        assert!(matches!(again, EngineError::AlreadyTerminal(id) if id == task.id));

        let missing = manager.cancel(TaskId::new()).await.unwrap_err();
        assert!(matches!(missing, EngineError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn cancel_after_close_still_marks_task() {
        let repo = InMemoryTaskRepository::new();
        let (manager, queues) = manager(&repo, 4);
        let task = manager.enqueue(NewTask::new("x", "RssSync")).await.unwrap();
        queues.close_all();

        let token = CancellationToken::new();
        assert_eq!(queues.get(PoolKind::Normal).pop(&token).await, None);
        manager.cancel(task.id).await.unwrap();
        let err = manager.enqueue(NewTask::new("x", "RssSync")).await.unwrap_err();
        assert!(matches!(err, EngineError::ShuttingDown));
    }
}
