// SPDX-License-Identifier: GPL-3.0-or-later

use marquee_domain::{InvalidTransition, ScheduleError, ScheduledTaskId, TaskId};
use thiserror::Error;

use crate::queue::PoolKind;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("malformed task body: {0}")]
    MalformedBody(String),

    #[error("{pool} queue is full")]
    QueueFull { pool: PoolKind },

    #[error("task engine is shutting down")]
    ShuttingDown,

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("scheduled task not found: {0}")]
    ScheduledTaskNotFound(ScheduledTaskId),

    #[error("scheduled task named '{0}' already exists")]
    DuplicateScheduledTask(String),

    #[error("task {0} has already finished")]
    AlreadyTerminal(TaskId),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),

    #[error("task store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    /// Errors that refused new work outright; no task was created.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::UnknownCommand(_)
                | Self::MalformedBody(_)
                | Self::QueueFull { .. }
                | Self::ShuttingDown
                | Self::Store(_)
        )
    }
}
