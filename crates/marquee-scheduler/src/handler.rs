// SPDX-License-Identifier: GPL-3.0-or-later
//! Contract between the engine and command implementations.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use marquee_domain::{Task, TaskBody, TaskId, TaskProgress};
use marquee_infrastructure::TaskRepository;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Returned by handlers that stop early because cancellation was requested.
#[derive(Debug, Clone, Copy, Error)]
#[error("task cancelled")]
pub struct TaskCancelled;

/// A unit of work the engine can run for a command name.
///
/// Handlers must return promptly once [`TaskContext::is_cancelled`] becomes true.
/// Returning `Ok` means the work succeeded; any error marks the task failed
/// unless cancellation or a timeout was requested first.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Human readable name
    fn name(&self) -> String;

    fn description(&self) -> String {
        String::new()
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()>;

    /// Execution limit used when configuration does not set one for this command.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

impl fmt::Debug for dyn TaskHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandler")
            .field("name", &self.name())
            .finish()
    }
}

/// Persists progress reported by a running handler.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    tasks: Arc<dyn TaskRepository>,
    latest: Arc<Mutex<TaskProgress>>,
}

impl ProgressReporter {
    pub fn new(task_id: TaskId, tasks: Arc<dyn TaskRepository>) -> Self {
        Self {
            task_id,
            tasks,
            latest: Arc::new(Mutex::new(TaskProgress::default())),
        }
    }

    /// Store the update immediately. Store failures are logged, never surfaced to the handler.
    pub async fn report(&self, percent: u8, message: Option<String>) {
        let progress = TaskProgress::new(percent, message);
        *self.latest.lock().unwrap_or_else(|p| p.into_inner()) = progress.clone();

        match self.tasks.update_progress(self.task_id, &progress).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(target: "supervisor", task_id = %self.task_id, "progress reported for a task that is no longer running");
            }
            Err(e) => {
                warn!(target: "supervisor", task_id = %self.task_id, error = %e, "failed to persist task progress");
            }
        }
    }

    /// Last progress reported through this reporter.
    pub fn latest(&self) -> TaskProgress {
        self.latest.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Everything a handler gets to see about the task it is running.
#[derive(Clone)]
pub struct TaskContext {
    task: Task,
    cancellation: CancellationToken,
    progress: ProgressReporter,
}

impl TaskContext {
    pub fn new(task: Task, cancellation: CancellationToken, progress: ProgressReporter) -> Self {
        Self {
            task,
            cancellation,
            progress,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    pub fn body(&self) -> &TaskBody {
        &self.task.body
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once cancellation (user, timeout or shutdown) has been requested.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Bail out with [`TaskCancelled`] if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(TaskCancelled.into());
        }
        Ok(())
    }

    pub async fn report_progress(&self, percent: u8, message: impl Into<String>) {
        self.progress.report(percent, Some(message.into())).await
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}
