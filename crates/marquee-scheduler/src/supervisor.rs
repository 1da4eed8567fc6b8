// SPDX-License-Identifier: GPL-3.0-or-later
//! Runs one task to completion and records exactly one final state for it.
//!
//! The supervisor owns every transition after a task leaves its queue:
//! Queued -> Running on pickup, then Running -> Completed / Failed / Cancelled
//! once the handler returns, panics or overruns its limit. All transitions are
//! compare-and-set against the store, so a concurrent cancellation of a queued
//! task and a worker picking it up can never both win.
//!
//! Store failures on pickup or on the final write are retried with backoff
//! until the store recovers or the pools shut down. A task abandoned at
//! shutdown is repaired by startup recovery.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use marquee_config::TaskConfig;
use marquee_domain::{Task, TaskId, TaskStatus};
use marquee_infrastructure::TaskRepository;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::handler::{ProgressReporter, TaskContext, TaskHandler};
use crate::registry::HandlerRegistry;

const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(50);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Cancellation tokens of tasks currently owned by a worker.
#[derive(Clone, Default)]
pub struct RunningTasks {
    tokens: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
}

impl RunningTasks {
    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(|poisoned| {
            warn!(target: "supervisor", "running task map poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn register(&self, task_id: TaskId) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock().insert(task_id, token.clone());
        token
    }

    fn remove(&self, task_id: TaskId) {
        self.lock().remove(&task_id);
    }

    /// Request cancellation of a task a worker has picked up. Returns false if no worker owns it.
    pub fn signal(&self, task_id: TaskId) -> bool {
        match self.lock().get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Signal every running task. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let tokens = self.lock();
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes the task's token when the supervisor is done with it, on every path.
struct RunningGuard<'a> {
    running: &'a RunningTasks,
    task_id: TaskId,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(self.task_id);
    }
}

enum Outcome {
    Succeeded,
    Errored(anyhow::Error),
    Panicked(String),
}

pub struct ExecutionSupervisor {
    tasks: Arc<dyn TaskRepository>,
    registry: Arc<HandlerRegistry>,
    running: RunningTasks,
    clock: Arc<dyn Clock>,
    limits: TaskConfig,
}

impl ExecutionSupervisor {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        registry: Arc<HandlerRegistry>,
        running: RunningTasks,
        clock: Arc<dyn Clock>,
        limits: TaskConfig,
    ) -> Self {
        Self {
            tasks,
            registry,
            running,
            clock,
            limits,
        }
    }

    pub fn running(&self) -> &RunningTasks {
        &self.running
    }

    /// Configured limit for the command, then the handler's own, then the global default.
    fn time_limit(&self, command_name: &str, handler: &dyn TaskHandler) -> Option<Duration> {
        self.limits
            .command_timeout(command_name)
            .or_else(|| handler.timeout())
            .or_else(|| self.limits.default_timeout())
    }

    /// Execute a dequeued task. Never panics and never returns an error; every
    /// problem ends up on the task record or in the log. `stop` ends store
    /// retries once the pools shut down.
    pub async fn run(&self, task_id: TaskId, worker: &str, stop: &CancellationToken) {
        let loaded = with_retry(stop, task_id, "load", || self.tasks.get_by_id(task_id)).await;
        let task = match loaded {
            Some(Some(task)) => task,
            Some(None) => {
                warn!(target: "supervisor", %task_id, worker, "dequeued task no longer exists");
                return;
            }
            None => return,
        };
        if task.status != TaskStatus::Queued {
            debug!(target: "supervisor", %task_id, status = %task.status, "skipping task that is no longer queued");
            return;
        }

        // Registered before the claim so a cancel racing the pickup always finds the token.
        let token = self.running.register(task_id);
        let _guard = RunningGuard {
            running: &self.running,
            task_id,
        };

        let mut running = task;
        if running.start(self.clock.now()).is_err() {
            return;
        }
        let claimed = with_retry(stop, task_id, "claim", || {
            self.tasks.compare_and_set(&running, TaskStatus::Queued)
        })
        .await;
        match claimed {
            Some(true) => {}
            Some(false) => {
                debug!(target: "supervisor", %task_id, "task was claimed or cancelled before pickup");
                return;
            }
            None => return,
        }

        info!(
            target: "supervisor",
            %task_id,
            worker,
            command = %running.command_name,
            name = %running.name,
            "task started"
        );

        let progress = ProgressReporter::new(task_id, self.tasks.clone());

        let Some(handler) = self.registry.resolve(&running.command_name) else {
            let reason = format!("no handler registered for command '{}'", running.command_name);
            self.finish(running, TaskStatus::Failed, Some(reason), &progress, stop)
                .await;
            return;
        };

        if token.is_cancelled() {
            self.finish(running, TaskStatus::Cancelled, None, &progress, stop)
                .await;
            return;
        }

        let limit = self.time_limit(&running.command_name, handler.as_ref());
        let ctx = TaskContext::new(running.clone(), token.clone(), progress.clone());
        let (outcome, timed_out) = invoke(handler.as_ref(), &ctx, limit).await;

        // A limit or a cancel request decides the outcome before the handler's result does.
        let (status, reason) = if timed_out {
            (
                TaskStatus::Failed,
                Some(format!(
                    "timed out after {}s",
                    limit.unwrap_or_default().as_secs_f64()
                )),
            )
        } else if token.is_cancelled() {
            (TaskStatus::Cancelled, None)
        } else {
            match outcome {
                Outcome::Succeeded => (TaskStatus::Completed, None),
                Outcome::Panicked(message) => (
                    TaskStatus::Failed,
                    Some(format!("handler panicked: {message}")),
                ),
                Outcome::Errored(e) => (TaskStatus::Failed, Some(format!("{e:#}"))),
            }
        };

        self.finish(running, status, reason, &progress, stop).await;
    }

    async fn finish(
        &self,
        mut task: Task,
        status: TaskStatus,
        reason: Option<String>,
        progress: &ProgressReporter,
        stop: &CancellationToken,
    ) {
        let now = self.clock.now();
        task.progress = progress.latest();
        let applied = match status {
            TaskStatus::Completed => task.complete(now),
            TaskStatus::Failed => task.fail(reason.clone().unwrap_or_default(), now),
            _ => task.cancel(now),
        };
        if let Err(e) = applied {
            error!(target: "supervisor", task_id = %task.id, error = %e, "refusing illegal final transition");
            return;
        }

        let recorded = with_retry(stop, task.id, "record outcome", || {
            self.tasks.compare_and_set(&task, TaskStatus::Running)
        })
        .await;
        match recorded {
            Some(true) => match status {
                TaskStatus::Completed => {
                    info!(target: "supervisor", task_id = %task.id, command = %task.command_name, "task completed")
                }
                TaskStatus::Cancelled => {
                    info!(target: "supervisor", task_id = %task.id, command = %task.command_name, "task cancelled")
                }
                _ => {
                    warn!(
                        target: "supervisor",
                        task_id = %task.id,
                        command = %task.command_name,
                        error = reason.as_deref().unwrap_or(""),
                        "task failed"
                    )
                }
            },
            Some(false) => {
                warn!(target: "supervisor", task_id = %task.id, %status, "task left Running before its outcome was recorded");
            }
            None => {
                error!(target: "supervisor", task_id = %task.id, %status, "outcome not recorded, task stays Running until the next start");
            }
        }
    }
}

/// Retry a store call with exponential backoff until it succeeds.
///
/// Once `stop` fires the call gets one more attempt; if that fails too the
/// error is logged and `None` returned.
async fn with_retry<T, F, Fut>(
    stop: &CancellationToken,
    task_id: TaskId,
    action: &str,
    mut attempt: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut delay = RETRY_INITIAL_DELAY;
    loop {
        match attempt().await {
            Ok(value) => return Some(value),
            Err(e) if stop.is_cancelled() => {
                error!(target: "supervisor", %task_id, action, error = %e, "task store unavailable during shutdown, giving up");
                return None;
            }
            Err(e) => {
                warn!(target: "supervisor", %task_id, action, error = %e, retry_in = ?delay, "task store call failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.cancelled() => {}
                }
                delay = (delay * 2).min(RETRY_MAX_DELAY);
            }
        }
    }
}

/// Run the handler, containing panics and enforcing `limit`.
///
/// On timeout the task's token is cancelled and the handler is still awaited,
/// so its resources are released before the outcome is recorded.
async fn invoke(
    handler: &dyn TaskHandler,
    ctx: &TaskContext,
    limit: Option<Duration>,
) -> (Outcome, bool) {
    let execution = AssertUnwindSafe(handler.execute(ctx)).catch_unwind();
    tokio::pin!(execution);

    let mut timed_out = false;
    let result = match limit {
        Some(limit) => match tokio::time::timeout(limit, &mut execution).await {
            Ok(result) => result,
            Err(_) => {
                timed_out = true;
                warn!(target: "supervisor", task_id = %ctx.task_id(), ?limit, "task exceeded its time limit, cancelling");
                ctx.cancellation().cancel();
                execution.await
            }
        },
        None => execution.await,
    };

    let outcome = match result {
        Ok(Ok(())) => Outcome::Succeeded,
        Ok(Err(e)) => Outcome::Errored(e),
        Err(payload) => Outcome::Panicked(panic_message(payload)),
    };
    (outcome, timed_out)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::handler::TaskCancelled;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use chrono::Utc;
    use marquee_domain::{TaskBody, TaskPriority, TaskTrigger};
    use marquee_infrastructure::InMemoryTaskRepository;

    struct Succeeds;

    #[async_trait]
    impl TaskHandler for Succeeds {
        fn name(&self) -> String {
            "Succeeds".to_string()
        }

        async fn execute(&self, ctx: &TaskContext) -> Result<()> {
            ctx.report_progress(50, "halfway").await;
            Ok(())
        }
    }

    struct Errors;

    #[async_trait]
    impl TaskHandler for Errors {
        fn name(&self) -> String {
            "Errors".to_string()
        }

        async fn execute(&self, _ctx: &TaskContext) -> Result<()> {
            bail!("indexer returned 503")
        }
    }

    struct Panics;

    #[async_trait]
    impl TaskHandler for Panics {
        fn name(&self) -> String {
            "Panics".to_string()
        }

        async fn execute(&self, _ctx: &TaskContext) -> Result<()> {
            panic!("corrupt release name")
        }
    }

    /// Waits for cancellation and reports it.
    struct Sleeps {
        limit: Option<Duration>,
    }

    #[async_trait]
    impl TaskHandler for Sleeps {
        fn name(&self) -> String {
            "Sleeps".to_string()
        }

        async fn execute(&self, ctx: &TaskContext) -> Result<()> {
            ctx.cancelled().await;
            Err(TaskCancelled.into())
        }

        fn timeout(&self) -> Option<Duration> {
            self.limit
        }
    }

    /// Stops cooperatively and reports success anyway.
    struct ReturnsOkWhenCancelled;

    #[async_trait]
    impl TaskHandler for ReturnsOkWhenCancelled {
        fn name(&self) -> String {
            "ReturnsOkWhenCancelled".to_string()
        }

        async fn execute(&self, ctx: &TaskContext) -> Result<()> {
            ctx.cancelled().await;
            Ok(())
        }
    }

    /// Takes the store away just before returning and brings it back shortly after.
    struct StoreBlipOnFinish {
        repo: InMemoryTaskRepository,
    }

    #[async_trait]
    impl TaskHandler for StoreBlipOnFinish {
        fn name(&self) -> String {
            "StoreBlipOnFinish".to_string()
        }

        async fn execute(&self, _ctx: &TaskContext) -> Result<()> {
            self.repo.set_offline(true);
            let repo = self.repo.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                repo.set_offline(false);
            });
            Ok(())
        }
    }

    fn supervisor(repo: &InMemoryTaskRepository, limits: TaskConfig) -> ExecutionSupervisor {
        let registry = HandlerRegistry::builder()
            .register("Succeeds", Succeeds)
            .register("ReturnsOkWhenCancelled", ReturnsOkWhenCancelled)
            .register("StoreBlipOnFinish", StoreBlipOnFinish { repo: repo.clone() })
            .register("Errors", Errors)
            .register("Panics", Panics)
            .register(
                "Sleeps",
                Sleeps {
                    limit: Some(Duration::from_millis(30)),
                },
            )
            .build();
        ExecutionSupervisor::new(
            Arc::new(repo.clone()),
            registry,
            RunningTasks::default(),
            Arc::new(SystemClock),
            limits,
        )
    }

    async fn queued(repo: &InMemoryTaskRepository, command: &str) -> TaskId {
        let task = Task::new(
            command,
            command,
            TaskBody::new(),
            TaskPriority::Normal,
            TaskTrigger::Api,
            Utc::now(),
        );
        repo.insert(&task).await.unwrap();
        task.id
    }

    async fn stored(repo: &InMemoryTaskRepository, id: TaskId) -> Task {
        repo.get_by_id(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn success_completes_with_full_progress() {
        let repo = InMemoryTaskRepository::new();
        let supervisor = supervisor(&repo, TaskConfig::default());
        let id = queued(&repo, "Succeeds").await;

        supervisor.run(id, "normal-0", &CancellationToken::new()).await;

        let task = stored(&repo, id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress.percent, 100);
        assert_eq!(task.progress.message.as_deref(), Some("halfway"));
        assert!(task.started_at.is_some() && task.ended_at.is_some());
        assert!(supervisor.running().is_empty());
    }

    #[tokio::test]
    async fn handler_error_is_recorded() {
        let repo = InMemoryTaskRepository::new();
        let supervisor = supervisor(&repo, TaskConfig::default());
        let id = queued(&repo, "Errors").await;

        supervisor.run(id, "normal-0", &CancellationToken::new()).await;

        let task = stored(&repo, id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("indexer returned 503"));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let repo = InMemoryTaskRepository::new();
        let supervisor = supervisor(&repo, TaskConfig::default());
        let id = queued(&repo, "Panics").await;

        supervisor.run(id, "normal-0", &CancellationToken::new()).await;

        let task = stored(&repo, id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error.as_deref(),
            Some("handler panicked: corrupt release name")
        );
    }

    #[tokio::test]
    async fn handler_timeout_fails_the_task() {
        let repo = InMemoryTaskRepository::new();
        let supervisor = supervisor(&repo, TaskConfig::default());
        let id = queued(&repo, "Sleeps").await;

        supervisor.run(id, "normal-0", &CancellationToken::new()).await;

        let task = stored(&repo, id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().starts_with("timed out after"));
    }

    #[tokio::test]
    async fn configured_limit_overrides_handler_limit() {
        let repo = InMemoryTaskRepository::new();
        let mut limits = TaskConfig::default();
        limits.command_timeouts.insert("Sleeps".to_string(), 0);
        let supervisor = supervisor(&repo, limits);

        let handler = Sleeps {
            limit: Some(Duration::from_secs(60)),
        };
        assert_eq!(
            supervisor.time_limit("Sleeps", &handler),
            Some(Duration::ZERO)
        );
        assert_eq!(
            supervisor.time_limit("Succeeds", &handler),
            Some(Duration::from_secs(60))
        );
        assert_eq!(supervisor.time_limit("Succeeds", &Succeeds), None);
    }

    #[tokio::test]
    async fn unknown_command_fails_without_running() {
        let repo = InMemoryTaskRepository::new();
        let supervisor = supervisor(&repo, TaskConfig::default());
        let id = queued(&repo, "Vanished").await;

        supervisor.run(id, "normal-0", &CancellationToken::new()).await;

        let task = stored(&repo, id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("Vanished"));
    }

    #[tokio::test]
    async fn non_queued_tasks_are_skipped() {
        let repo = InMemoryTaskRepository::new();
        let supervisor = supervisor(&repo, TaskConfig::default());
        let id = queued(&repo, "Succeeds").await;

        let mut task = stored(&repo, id).await;
        task.cancel(Utc::now()).unwrap();
        assert!(repo.compare_and_set(&task, TaskStatus::Queued).await.unwrap());

        supervisor.run(id, "normal-0", &CancellationToken::new()).await;
        assert_eq!(stored(&repo, id).await.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn timeout_wins_over_a_successful_return() {
        let repo = InMemoryTaskRepository::new();
        let mut limits = TaskConfig::default();
        limits
            .command_timeouts
            .insert("ReturnsOkWhenCancelled".to_string(), 0);
        let supervisor = supervisor(&repo, limits);
        let id = queued(&repo, "ReturnsOkWhenCancelled").await;

        supervisor.run(id, "normal-0", &CancellationToken::new()).await;

        let task = stored(&repo, id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().starts_with("timed out after"));
        assert_ne!(task.progress.percent, 100);
    }

    #[tokio::test]
    async fn cancel_request_wins_over_a_successful_return() {
        let repo = InMemoryTaskRepository::new();
        let supervisor = Arc::new(supervisor(&repo, TaskConfig::default()));
        let id = queued(&repo, "ReturnsOkWhenCancelled").await;

        let worker = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                supervisor.run(id, "normal-0", &CancellationToken::new()).await;
            })
        };
        while !supervisor.running().signal(id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        worker.await.unwrap();

        let task = stored(&repo, id).await;
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn outcome_is_recorded_once_the_store_comes_back() {
        let repo = InMemoryTaskRepository::new();
        let supervisor = supervisor(&repo, TaskConfig::default());
        let id = queued(&repo, "StoreBlipOnFinish").await;

        supervisor.run(id, "normal-0", &CancellationToken::new()).await;

        let task = stored(&repo, id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.ended_at.is_some());
        assert!(supervisor.running().is_empty());
    }

    #[tokio::test]
    async fn pickup_waits_for_the_store() {
        let repo = InMemoryTaskRepository::new();
        let supervisor = supervisor(&repo, TaskConfig::default());
        let id = queued(&repo, "Succeeds").await;

        repo.set_offline(true);
        let restore = {
            let repo = repo.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                repo.set_offline(false);
            })
        };
        supervisor.run(id, "normal-0", &CancellationToken::new()).await;
        restore.await.unwrap();

        assert_eq!(stored(&repo, id).await.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn store_outage_during_shutdown_leaves_task_for_recovery() {
        let repo = InMemoryTaskRepository::new();
        let supervisor = supervisor(&repo, TaskConfig::default());
        let id = queued(&repo, "Succeeds").await;

        let stop = CancellationToken::new();
        stop.cancel();
        repo.set_offline(true);
        supervisor.run(id, "normal-0", &stop).await;
        repo.set_offline(false);

        assert_eq!(stored(&repo, id).await.status, TaskStatus::Queued);
        assert!(supervisor.running().is_empty());
    }

    #[test]
    fn running_tasks_signal_only_known_ids() {
        let running = RunningTasks::default();
        let id = TaskId::new();
        assert!(!running.signal(id));

        let token = running.register(id);
        assert!(running.signal(id));
        assert!(token.is_cancelled());
        assert_eq!(running.cancel_all(), 1);

        running.remove(id);
        assert!(running.is_empty());
    }
}
