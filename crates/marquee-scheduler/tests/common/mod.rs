// SPDX-License-Identifier: GPL-3.0-or-later
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use marquee_config::{SchedulerConfig, TaskConfig, WorkerConfig};
use marquee_domain::{Task, TaskId, TaskStatus};
use marquee_infrastructure::{InMemoryScheduledTaskRepository, InMemoryTaskRepository};
use marquee_scheduler::{
    Clock, HandlerRegistry, NewScheduledTask, TaskCancelled, TaskContext, TaskEngine, TaskHandler,
};
use tokio::sync::Notify;
use tokio::time::Instant;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn workers(high: usize, normal: usize, background: usize) -> WorkerConfig {
    WorkerConfig {
        high,
        normal,
        background,
        queue_capacity: 64,
        enqueue_timeout_ms: 50,
        shutdown_timeout_secs: 5,
    }
}

pub fn fast_scheduler() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval_ms: 10,
        ..SchedulerConfig::default()
    }
}

pub struct Harness {
    pub engine: TaskEngine,
    pub tasks: InMemoryTaskRepository,
    pub definitions: InMemoryScheduledTaskRepository,
}

pub struct HarnessBuilder {
    registry: Arc<HandlerRegistry>,
    workers: WorkerConfig,
    tasks_config: TaskConfig,
    tasks: InMemoryTaskRepository,
    definitions: InMemoryScheduledTaskRepository,
    clock: Option<Arc<dyn Clock>>,
    builtins: Vec<NewScheduledTask>,
}

pub fn harness(registry: Arc<HandlerRegistry>) -> HarnessBuilder {
    HarnessBuilder {
        registry,
        workers: workers(1, 1, 1),
        tasks_config: TaskConfig::default(),
        tasks: InMemoryTaskRepository::new(),
        definitions: InMemoryScheduledTaskRepository::new(),
        clock: None,
        builtins: Vec::new(),
    }
}

impl HarnessBuilder {
    pub fn workers(mut self, workers: WorkerConfig) -> Self {
        self.workers = workers;
        self
    }

    pub fn tasks_config(mut self, config: TaskConfig) -> Self {
        self.tasks_config = config;
        self
    }

    pub fn stores(
        mut self,
        tasks: InMemoryTaskRepository,
        definitions: InMemoryScheduledTaskRepository,
    ) -> Self {
        self.tasks = tasks;
        self.definitions = definitions;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn builtins(mut self, builtins: Vec<NewScheduledTask>) -> Self {
        self.builtins = builtins;
        self
    }

    pub async fn start(self) -> Harness {
        let mut builder = TaskEngine::builder(
            Arc::new(self.tasks.clone()),
            Arc::new(self.definitions.clone()),
            self.registry,
        )
        .workers(self.workers)
        .scheduler(fast_scheduler())
        .tasks(self.tasks_config)
        .builtin_schedules(self.builtins);
        if let Some(clock) = self.clock {
            builder = builder.clock(clock);
        }
        Harness {
            engine: builder.start().await.expect("engine should start"),
            tasks: self.tasks,
            definitions: self.definitions,
        }
    }
}

/// Poll `condition` until it holds, panicking after [`WAIT`].
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT;
    while !condition().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_status(engine: &TaskEngine, id: TaskId, status: TaskStatus) -> Task {
    let deadline = Instant::now() + WAIT;
    loop {
        let task = engine.get_task(id).await.expect("task should exist");
        if task.status == status {
            return task;
        }
        assert!(
            Instant::now() < deadline,
            "task {id} stuck in {} waiting for {status}",
            task.status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Completes immediately.
pub struct Quick;

#[async_trait]
impl TaskHandler for Quick {
    fn name(&self) -> String {
        "Quick".to_string()
    }

    async fn execute(&self, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }
}

/// Panics on every run.
pub struct Explodes;

#[async_trait]
impl TaskHandler for Explodes {
    fn name(&self) -> String {
        "Explodes".to_string()
    }

    async fn execute(&self, _ctx: &TaskContext) -> Result<()> {
        panic!("handler bug")
    }
}

/// Runs until cancelled, optionally with its own time limit.
pub struct UntilCancelled {
    pub limit: Option<Duration>,
}

#[async_trait]
impl TaskHandler for UntilCancelled {
    fn name(&self) -> String {
        "Until Cancelled".to_string()
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        ctx.cancelled().await;
        Err(TaskCancelled.into())
    }

    fn timeout(&self) -> Option<Duration> {
        self.limit
    }
}

/// Stops when cancelled but reports success.
pub struct StopsQuietly {
    pub limit: Option<Duration>,
}

#[async_trait]
impl TaskHandler for StopsQuietly {
    fn name(&self) -> String {
        "Stops Quietly".to_string()
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        ctx.cancelled().await;
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.limit
    }
}

/// Runs until released by the test. Observes cancellation only after release.
#[derive(Clone, Default)]
pub struct Held {
    pub started: Arc<AtomicUsize>,
    pub release: Arc<Notify>,
}

impl Held {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for Held {
    fn name(&self) -> String {
        "Held".to_string()
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        ctx.check_cancelled()
    }
}

/// Records how often each task ran and whether any task ran twice at once.
#[derive(Clone, Default)]
pub struct Counting {
    pub runs: Arc<Mutex<HashMap<TaskId, usize>>>,
    pub in_flight: Arc<Mutex<HashSet<TaskId>>>,
    pub overlaps: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for Counting {
    fn name(&self) -> String {
        "Counting".to_string()
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let id = ctx.task_id();
        if !self.in_flight.lock().unwrap().insert(id) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        *self.runs.lock().unwrap().entry(id).or_default() += 1;
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.in_flight.lock().unwrap().remove(&id);
        Ok(())
    }
}
