// SPDX-License-Identifier: GPL-3.0-or-later
//! Recurring task definitions and the loop that fires them.
//!
//! The [`Scheduler`] exclusively owns the in-memory definition table. Other
//! components change it through a [`SchedulerHandle`], whose commands are
//! applied between ticks, so a tick always sees a consistent table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use marquee_domain::{
    Schedule, ScheduleTimezone, ScheduledTask, ScheduledTaskId, TaskPriority,
};
use marquee_infrastructure::{ScheduledTaskRepository, TaskRepository};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::manager::{body_object, NewTask, QueueManager};
use crate::registry::HandlerRegistry;

const COMMAND_BUFFER: usize = 64;

/// Definition of a new recurring task.
#[derive(Debug, Clone)]
pub struct NewScheduledTask {
    pub name: String,
    pub command_name: String,
    pub body: Value,
    pub schedule: Schedule,
    pub priority: TaskPriority,
    pub enabled: bool,
}

impl NewScheduledTask {
    pub fn new(
        name: impl Into<String>,
        command_name: impl Into<String>,
        schedule: Schedule,
    ) -> Self {
        Self {
            name: name.into(),
            command_name: command_name.into(),
            body: Value::Null,
            schedule,
            priority: TaskPriority::Normal,
            enabled: true,
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

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Partial update of a recurring task. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ScheduledTaskUpdate {
    pub name: Option<String>,
    pub body: Option<Value>,
    pub schedule: Option<Schedule>,
    pub priority: Option<TaskPriority>,
    pub enabled: Option<bool>,
}

pub(crate) enum SchedulerCommand {
    Create {
        request: NewScheduledTask,
        reply: oneshot::Sender<Result<ScheduledTask>>,
    },
    Update {
        id: ScheduledTaskId,
        update: ScheduledTaskUpdate,
        reply: oneshot::Sender<Result<ScheduledTask>>,
    },
    Delete {
        id: ScheduledTaskId,
        reply: oneshot::Sender<Result<()>>,
    },
    Get {
        id: ScheduledTaskId,
        reply: oneshot::Sender<Result<ScheduledTask>>,
    },
    List {
        reply: oneshot::Sender<Vec<ScheduledTask>>,
    },
    RunNow {
        id: ScheduledTaskId,
        reply: oneshot::Sender<Result<ScheduledTask>>,
    },
}

/// Cloneable sender side of the scheduler's command channel.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        response.await.map_err(|_| EngineError::ShuttingDown)
    }

    pub async fn create(&self, request: NewScheduledTask) -> Result<ScheduledTask> {
        self.request(|reply| SchedulerCommand::Create { request, reply })
            .await?
    }

    pub async fn update(
        &self,
        id: ScheduledTaskId,
        update: ScheduledTaskUpdate,
    ) -> Result<ScheduledTask> {
        self.request(|reply| SchedulerCommand::Update { id, update, reply })
            .await?
    }

    pub async fn delete(&self, id: ScheduledTaskId) -> Result<()> {
        self.request(|reply| SchedulerCommand::Delete { id, reply })
            .await?
    }

    pub async fn get(&self, id: ScheduledTaskId) -> Result<ScheduledTask> {
        self.request(|reply| SchedulerCommand::Get { id, reply })
            .await?
    }

    pub async fn list(&self) -> Result<Vec<ScheduledTask>> {
        self.request(|reply| SchedulerCommand::List { reply }).await
    }

    /// Make the definition due immediately; it fires on the next tick.
    pub async fn run_now(&self, id: ScheduledTaskId) -> Result<ScheduledTask> {
        self.request(|reply| SchedulerCommand::RunNow { id, reply })
            .await?
    }
}

pub struct Scheduler {
    entries: HashMap<ScheduledTaskId, ScheduledTask>,
    definitions: Arc<dyn ScheduledTaskRepository>,
    tasks: Arc<dyn TaskRepository>,
    queue: Arc<QueueManager>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    tz: ScheduleTimezone,
    commands: mpsc::Receiver<SchedulerCommand>,
}

impl Scheduler {
    pub fn new(
        definitions: Arc<dyn ScheduledTaskRepository>,
        tasks: Arc<dyn TaskRepository>,
        queue: Arc<QueueManager>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        tz: ScheduleTimezone,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let scheduler = Self {
            entries: HashMap::new(),
            definitions,
            tasks,
            queue,
            registry,
            clock,
            tz,
            commands: rx,
        };
        (scheduler, SchedulerHandle { commands: tx })
    }

    /// Read every stored definition into the table.
    pub async fn load(&mut self) -> Result<usize> {
        let stored = self.definitions.list().await?;
        for entry in stored {
            if !self.registry.contains(&entry.command_name) {
                warn!(target: "scheduler", name = %entry.name, command = %entry.command_name, "scheduled task refers to an unregistered command");
            }
            self.entries.insert(entry.id, entry);
        }
        info!(target: "scheduler", count = self.entries.len(), "loaded scheduled tasks");
        Ok(self.entries.len())
    }

    /// Add definitions that are not stored yet, matched by name. Existing ones
    /// keep their user edits. Definitions for unregistered commands are skipped.
    pub async fn seed(&mut self, definitions: Vec<NewScheduledTask>) -> Result<usize> {
        let mut added = 0;
        for request in definitions {
            if !self.registry.contains(&request.command_name) {
                debug!(target: "scheduler", name = %request.name, command = %request.command_name, "not seeding definition for unregistered command");
                continue;
            }
            if self.entries.values().any(|e| e.name == request.name) {
                continue;
            }
            self.create(request).await?;
            added += 1;
        }
        Ok(added)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fire every due definition once. Returns how many tasks were queued.
    ///
    /// A definition whose previous task is still Queued or Running is skipped
    /// for this occurrence. Either way its next run moves strictly past now.
    pub async fn tick(&mut self) -> usize {
        let now = self.clock.now();
        let mut due: Vec<ScheduledTaskId> = self
            .entries
            .values()
            .filter(|e| e.is_due(now))
            .map(|e| e.id)
            .collect();
        due.sort_by_key(|id| self.entries.get(id).map(|e| e.next_run_at));

        let mut fired = 0;
        for id in due {
            let Some(mut entry) = self.entries.get(&id).cloned() else {
                continue;
            };

            if self.is_busy(&entry).await {
                info!(target: "scheduler", name = %entry.name, "previous run still active, skipping this occurrence");
            } else {
                let request = NewTask::new(entry.name.clone(), entry.command_name.clone())
                    .body(Value::Object(entry.body.clone()))
                    .priority(entry.priority)
                    .spawned_by(entry.id);
                match self.queue.try_enqueue(request).await {
                    Ok(task) => {
                        info!(target: "scheduler", name = %entry.name, task_id = %task.id, "scheduled task fired");
                        entry.record_firing(task.id, now);
                        fired += 1;
                    }
                    Err(e) => {
                        warn!(target: "scheduler", name = %entry.name, error = %e, "failed to queue scheduled task");
                    }
                }
            }

            if let Err(e) = entry.advance(now, self.tz) {
                error!(target: "scheduler", name = %entry.name, error = %e, "cannot compute next run, disabling");
                entry.enabled = false;
                entry.updated_at = now;
            }
            if let Err(e) = self.definitions.update(&entry).await {
                error!(target: "scheduler", name = %entry.name, error = %e, "failed to persist scheduled task");
            }
            self.entries.insert(id, entry);
        }
        fired
    }

    async fn is_busy(&self, entry: &ScheduledTask) -> bool {
        let Some(last) = entry.last_task_id else {
            return false;
        };
        match self.tasks.get_by_id(last).await {
            Ok(Some(task)) => task.status.is_active(),
            Ok(None) => false,
            Err(e) => {
                // Unknown counts as busy.
                warn!(target: "scheduler", name = %entry.name, error = %e, "could not check previous run");
                true
            }
        }
    }

    /// Apply every command already waiting in the channel.
    pub async fn drain_commands(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command).await;
            applied += 1;
        }
        applied
    }

    pub async fn run(mut self, tick_interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(target: "scheduler", ?tick_interval, definitions = self.entries.len(), "scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.apply(command).await,
                _ = ticker.tick() => {
                    let fired = self.tick().await;
                    if fired > 0 {
                        debug!(target: "scheduler", fired, "tick complete");
                    }
                }
            }
        }
        info!(target: "scheduler", "scheduler stopped");
    }

    async fn apply(&mut self, command: SchedulerCommand) {
        // A dropped receiver only means the caller gave up waiting.
        match command {
            SchedulerCommand::Create { request, reply } => {
                let _ = reply.send(self.create(request).await);
            }
            SchedulerCommand::Update { id, update, reply } => {
                let _ = reply.send(self.update(id, update).await);
            }
            SchedulerCommand::Delete { id, reply } => {
                let _ = reply.send(self.delete(id).await);
            }
            SchedulerCommand::Get { id, reply } => {
                let _ = reply.send(
                    self.entries
                        .get(&id)
                        .cloned()
                        .ok_or(EngineError::ScheduledTaskNotFound(id)),
                );
            }
            SchedulerCommand::List { reply } => {
                let mut entries: Vec<ScheduledTask> = self.entries.values().cloned().collect();
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                let _ = reply.send(entries);
            }
            SchedulerCommand::RunNow { id, reply } => {
                let _ = reply.send(self.run_now(id).await);
            }
        }
    }

    fn ensure_unique_name(&self, name: &str, except: Option<ScheduledTaskId>) -> Result<()> {
        let taken = self
            .entries
            .values()
            .any(|e| e.name == name && Some(e.id) != except);
        if taken {
            return Err(EngineError::DuplicateScheduledTask(name.to_string()));
        }
        Ok(())
    }

    async fn create(&mut self, request: NewScheduledTask) -> Result<ScheduledTask> {
        if !self.registry.contains(&request.command_name) {
            return Err(EngineError::UnknownCommand(request.command_name));
        }
        request.schedule.validate()?;
        let body = body_object(request.body)?;
        self.ensure_unique_name(&request.name, None)?;

        let mut entry = ScheduledTask::new(
            request.name,
            request.command_name,
            body,
            request.schedule,
            request.priority,
            self.clock.now(),
            self.tz,
        )?;
        entry.enabled = request.enabled;

        self.definitions.create(&entry).await?;
        info!(target: "scheduler", name = %entry.name, schedule = %entry.schedule, next_run_at = %entry.next_run_at, "scheduled task created");
        self.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn update(
        &mut self,
        id: ScheduledTaskId,
        update: ScheduledTaskUpdate,
    ) -> Result<ScheduledTask> {
        let mut entry = self
            .entries
            .get(&id)
            .cloned()
            .ok_or(EngineError::ScheduledTaskNotFound(id))?;
        let now = self.clock.now();

        if let Some(name) = update.name {
            self.ensure_unique_name(&name, Some(id))?;
            entry.name = name;
        }
        if let Some(body) = update.body {
            entry.body = body_object(body)?;
        }
        if let Some(priority) = update.priority {
            entry.priority = priority;
        }
        if let Some(enabled) = update.enabled {
            entry.enabled = enabled;
        }
        if let Some(schedule) = update.schedule {
            schedule.validate()?;
            entry.next_run_at = schedule.next_after(now, self.tz)?;
            entry.schedule = schedule;
        }
        entry.updated_at = now;

        self.definitions.update(&entry).await?;
        info!(target: "scheduler", name = %entry.name, enabled = entry.enabled, next_run_at = %entry.next_run_at, "scheduled task updated");
        self.entries.insert(id, entry.clone());
        Ok(entry)
    }

    async fn delete(&mut self, id: ScheduledTaskId) -> Result<()> {
        if !self.entries.contains_key(&id) {
            return Err(EngineError::ScheduledTaskNotFound(id));
        }
        self.definitions.delete(id).await?;
        if let Some(entry) = self.entries.remove(&id) {
            info!(target: "scheduler", name = %entry.name, "scheduled task deleted");
        }
        Ok(())
    }

    async fn run_now(&mut self, id: ScheduledTaskId) -> Result<ScheduledTask> {
        let mut entry = self
            .entries
            .get(&id)
            .cloned()
            .ok_or(EngineError::ScheduledTaskNotFound(id))?;
        let now = self.clock.now();
        entry.next_run_at = now;
        entry.updated_at = now;
        self.definitions.update(&entry).await?;
        info!(target: "scheduler", name = %entry.name, "scheduled task will run on the next tick");
        self.entries.insert(id, entry.clone());
        Ok(entry)
    }
}
