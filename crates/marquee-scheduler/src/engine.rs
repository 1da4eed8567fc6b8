// SPDX-License-Identifier: GPL-3.0-or-later
//! The task engine facade: one value owning the queues, worker pools and scheduler.
//!
//! Everything is constructed explicitly through [`TaskEngineBuilder`]; there is
//! no global state, so several engines can coexist (tests do exactly that).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use marquee_config::{AppConfig, SchedulerConfig, TaskConfig, WorkerConfig};
use marquee_domain::{
    ScheduleTimezone, ScheduledTask, ScheduledTaskId, Task, TaskId, TaskStatus,
};
use marquee_infrastructure::{ScheduledTaskRepository, TaskFilter, TaskRepository};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{EngineError, Result};
use crate::manager::{NewTask, QueueManager};
use crate::pool::{QueueStatus, WorkerPoolSet};
use crate::queue::PoolQueues;
use crate::registry::{CommandInfo, HandlerRegistry};
use crate::scheduler::{NewScheduledTask, ScheduledTaskUpdate, Scheduler, SchedulerHandle};
use crate::supervisor::{ExecutionSupervisor, RunningTasks};

const MAX_PAGE_SIZE: i64 = 1000;

/// Filter and page for task listings.
#[derive(Debug, Clone)]
pub struct TaskQuery {
    pub status: Option<TaskStatus>,
    pub command_name: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for TaskQuery {
    fn default() -> Self {
        Self {
            status: None,
            command_name: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: i64,
}

pub struct TaskEngineBuilder {
    tasks: Arc<dyn TaskRepository>,
    definitions: Arc<dyn ScheduledTaskRepository>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    workers: WorkerConfig,
    scheduler: SchedulerConfig,
    task_config: TaskConfig,
    builtins: Vec<NewScheduledTask>,
}

impl TaskEngineBuilder {
    /// Take worker, scheduler and task settings from the application config.
    pub fn config(mut self, config: &AppConfig) -> Self {
        self.workers = config.workers.clone();
        self.scheduler = config.scheduler.clone();
        self.task_config = config.tasks.clone();
        self
    }

    pub fn workers(mut self, workers: WorkerConfig) -> Self {
        self.workers = workers;
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn tasks(mut self, tasks: TaskConfig) -> Self {
        self.task_config = tasks;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Recurring definitions to create on first start if their command is registered.
    pub fn builtin_schedules(mut self, definitions: Vec<NewScheduledTask>) -> Self {
        self.builtins = definitions;
        self
    }

    /// Recover interrupted work, then start the worker pools and the scheduler.
    pub async fn start(self) -> Result<TaskEngine> {
        let tz: ScheduleTimezone = self.scheduler.timezone.parse()?;

        info!(
            target: "engine",
            commands = self.registry.len(),
            high = self.workers.high,
            normal = self.workers.normal,
            background = self.workers.background,
            queue_capacity = self.workers.queue_capacity,
            "starting task engine"
        );

        let failed = recover_interrupted(self.tasks.as_ref(), self.clock.as_ref()).await?;
        let pending = self.tasks.list_by_status(TaskStatus::Queued).await?;

        let queues = Arc::new(PoolQueues::new(self.workers.queue_capacity));
        let running = RunningTasks::default();
        let supervisor = Arc::new(ExecutionSupervisor::new(
            self.tasks.clone(),
            self.registry.clone(),
            running.clone(),
            self.clock.clone(),
            self.task_config.clone(),
        ));
        let queue = Arc::new(QueueManager::new(
            self.tasks.clone(),
            self.registry.clone(),
            queues.clone(),
            running,
            self.clock.clone(),
            self.workers.enqueue_timeout(),
        ));
        let pools = WorkerPoolSet::start(&self.workers, queues, supervisor);

        let shutdown = CancellationToken::new();
        let mut background = Vec::new();

        if !pending.is_empty() {
            info!(target: "engine", count = pending.len(), "requeueing tasks left queued by a previous run");
            let queue = queue.clone();
            background.push(tokio::spawn(async move {
                for task in pending {
                    if let Err(e) = queue.requeue(&task).await {
                        warn!(target: "engine", task_id = %task.id, error = %e, "stopped requeueing recovered tasks");
                        break;
                    }
                }
            }));
        }

        let (mut scheduler, handle) = Scheduler::new(
            self.definitions.clone(),
            self.tasks.clone(),
            queue.clone(),
            self.registry.clone(),
            self.clock.clone(),
            tz,
        );
        scheduler.load().await?;
        let seeded = scheduler.seed(self.builtins).await?;
        if seeded > 0 {
            info!(target: "engine", seeded, "created built-in scheduled tasks");
        }
        background.push(tokio::spawn(
            scheduler.run(self.scheduler.tick_interval(), shutdown.clone()),
        ));

        info!(target: "engine", recovered_failed = failed, "task engine started");
        Ok(TaskEngine {
            tasks: self.tasks,
            registry: self.registry,
            queue,
            pools,
            scheduler: handle,
            shutdown,
            background: Mutex::new(background),
        })
    }
}

/// Tasks still Running in the store belong to a process that is gone.
async fn recover_interrupted(tasks: &dyn TaskRepository, clock: &dyn Clock) -> Result<usize> {
    let mut recovered = 0;
    for mut task in tasks.list_by_status(TaskStatus::Running).await? {
        task.fail("interrupted by shutdown", clock.now())?;
        if tasks.compare_and_set(&task, TaskStatus::Running).await? {
            warn!(target: "engine", task_id = %task.id, command = %task.command_name, "marked interrupted task as failed");
            recovered += 1;
        }
    }
    Ok(recovered)
}

pub struct TaskEngine {
    tasks: Arc<dyn TaskRepository>,
    registry: Arc<HandlerRegistry>,
    queue: Arc<QueueManager>,
    pools: WorkerPoolSet,
    scheduler: SchedulerHandle,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskEngine {
    pub fn builder(
        tasks: Arc<dyn TaskRepository>,
        definitions: Arc<dyn ScheduledTaskRepository>,
        registry: Arc<HandlerRegistry>,
    ) -> TaskEngineBuilder {
        TaskEngineBuilder {
            tasks,
            definitions,
            registry,
            clock: Arc::new(SystemClock),
            workers: WorkerConfig::default(),
            scheduler: SchedulerConfig::default(),
            task_config: TaskConfig::default(),
            builtins: Vec::new(),
        }
    }

    pub async fn queue_task(&self, request: NewTask) -> Result<Task> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        self.queue.enqueue(request).await
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.tasks
            .get_by_id(id)
            .await?
            .ok_or(EngineError::TaskNotFound(id))
    }

    /// Newest first.
    pub async fn list_tasks(&self, query: &TaskQuery) -> Result<TaskPage> {
        let filter = TaskFilter {
            status: query.status,
            command_name: query.command_name.clone(),
        };
        let limit = query.limit.clamp(1, MAX_PAGE_SIZE);
        let offset = query.offset.max(0);
        let tasks = self.tasks.list(&filter, limit, offset).await?;
        let total = self.tasks.count(&filter).await?;
        Ok(TaskPage { tasks, total })
    }

    pub async fn cancel_task(&self, id: TaskId) -> Result<()> {
        self.queue.cancel(id).await
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.pools.snapshot()
    }

    pub fn commands(&self) -> Vec<CommandInfo> {
        self.registry.commands()
    }

    pub async fn create_scheduled_task(&self, request: NewScheduledTask) -> Result<ScheduledTask> {
        self.scheduler.create(request).await
    }

    pub async fn update_scheduled_task(
        &self,
        id: ScheduledTaskId,
        update: ScheduledTaskUpdate,
    ) -> Result<ScheduledTask> {
        self.scheduler.update(id, update).await
    }

    pub async fn delete_scheduled_task(&self, id: ScheduledTaskId) -> Result<()> {
        self.scheduler.delete(id).await
    }

    pub async fn get_scheduled_task(&self, id: ScheduledTaskId) -> Result<ScheduledTask> {
        self.scheduler.get(id).await
    }

    pub async fn list_scheduled_tasks(&self) -> Result<Vec<ScheduledTask>> {
        self.scheduler.list().await
    }

    pub async fn run_scheduled_task_now(&self, id: ScheduledTaskId) -> Result<ScheduledTask> {
        self.scheduler.run_now(id).await
    }

    /// Stop the scheduler, refuse new tasks and drain the worker pools.
    ///
    /// Running tasks get `grace` to finish before they are cancelled. Calling
    /// this more than once is harmless.
    pub async fn shutdown(&self, grace: Duration) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(target: "engine", ?grace, "shutting down task engine");
        self.shutdown.cancel();

        // Closing the queues also releases the scheduler and the requeue loop if they wait for capacity.
        self.pools.shutdown(grace).await;

        let background: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.background.lock().unwrap_or_else(|p| p.into_inner()));
        for handle in background {
            let abort = handle.abort_handle();
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(target: "engine", error = %e, "background task ended abnormally");
                }
                Err(_) => {
                    warn!(target: "engine", "background task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        info!(target: "engine", "task engine stopped");
    }
}
