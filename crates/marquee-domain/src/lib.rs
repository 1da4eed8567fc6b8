// SPDX-License-Identifier: GPL-3.0-or-later
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub mod schedule;

pub use schedule::{Schedule, ScheduleError, ScheduleTimezone};

/// Opaque handler payload. The engine stores and forwards it but never looks inside.
pub type TaskBody = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Value Objects & IDs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduledTaskId(pub Uuid);

impl ScheduledTaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ScheduledTaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScheduledTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ScheduledTaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ============================================================================
// Enums
// ============================================================================

/// Error returned when a stored enum value cannot be parsed back
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

impl FromStr for TaskPriority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(ParseEnumError {
                kind: "task priority",
                value: other.to_string(),
            }),
        }
    }
}

/// How a task came to exist. Recorded for auditing, never consulted for behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskTrigger {
    Api,
    Scheduler,
    System,
}

impl std::fmt::Display for TaskTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Api => write!(f, "api"),
            Self::Scheduler => write!(f, "scheduler"),
            Self::System => write!(f, "system"),
        }
    }
}

impl FromStr for TaskTrigger {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(Self::Api),
            "scheduler" => Ok(Self::Scheduler),
            "system" => Ok(Self::System),
            other => Err(ParseEnumError {
                kind: "task trigger",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        Self::Queued,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Queued or Running
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Legal moves: Queued -> Running | Cancelled, Running -> Completed | Failed | Cancelled.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseEnumError {
                kind: "task status",
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// Task
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid task transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Progress reported by a running handler.
///
/// Handlers are expected to report a non-decreasing percentage; this is not enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub percent: u8,
    pub message: Option<String>,
}

impl TaskProgress {
    pub fn new(percent: u8, message: Option<String>) -> Self {
        Self {
            percent: percent.min(100),
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub command_name: String,
    pub body: TaskBody,
    pub priority: TaskPriority,
    pub trigger: TaskTrigger,
    pub status: TaskStatus,
    pub progress: TaskProgress,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Recurring definition that spawned this task, if any
    pub scheduled_task_id: Option<ScheduledTaskId>,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        command_name: impl Into<String>,
        body: TaskBody,
        priority: TaskPriority,
        trigger: TaskTrigger,
        queued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            command_name: command_name.into(),
            body,
            priority,
            trigger,
            status: TaskStatus::Queued,
            progress: TaskProgress::default(),
            queued_at,
            started_at: None,
            ended_at: None,
            error: None,
            scheduled_task_id: None,
        }
    }

    pub fn spawned_by(mut self, scheduled_task_id: ScheduledTaskId) -> Self {
        self.scheduled_task_id = Some(scheduled_task_id);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a state change, stamping `started_at` / `ended_at` as appropriate.
    ///
    /// On failure the task is left untouched.
    pub fn transition(
        &mut self,
        to: TaskStatus,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }

        match to {
            TaskStatus::Running => self.started_at = Some(at),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.ended_at = Some(at)
            }
            TaskStatus::Queued => {}
        }
        if to != TaskStatus::Failed {
            self.error = None;
        }
        self.status = to;
        Ok(())
    }

    pub fn start(&mut self, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Running, at)
    }

    pub fn complete(&mut self, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Completed, at)?;
        self.progress.percent = 100;
        Ok(())
    }

    pub fn fail(
        &mut self,
        error: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Failed, at)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn cancel(&mut self, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Cancelled, at)
    }
}

// ============================================================================
// Scheduled Task
// ============================================================================

/// A recurring definition that periodically spawns tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: ScheduledTaskId,
    pub name: String,
    pub command_name: String,
    pub body: TaskBody,
    pub schedule: Schedule,
    pub priority: TaskPriority,
    pub enabled: bool,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_task_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// Build a definition whose first run is the schedule's next occurrence after `now`.
    pub fn new(
        name: impl Into<String>,
        command_name: impl Into<String>,
        body: TaskBody,
        schedule: Schedule,
        priority: TaskPriority,
        now: DateTime<Utc>,
        tz: ScheduleTimezone,
    ) -> Result<Self, ScheduleError> {
        let next_run_at = schedule.next_after(now, tz)?;
        Ok(Self {
            id: ScheduledTaskId::new(),
            name: name.into(),
            command_name: command_name.into(),
            body,
            schedule,
            priority,
            enabled: true,
            next_run_at,
            last_run_at: None,
            last_task_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at <= now
    }

    /// Move `next_run_at` to the first occurrence strictly after `now`.
    pub fn advance(
        &mut self,
        now: DateTime<Utc>,
        tz: ScheduleTimezone,
    ) -> Result<(), ScheduleError> {
        self.next_run_at = self.schedule.next_after(now, tz)?;
        self.updated_at = now;
        Ok(())
    }

    /// Record that `task_id` was spawned at `now`.
    pub fn record_firing(&mut self, task_id: TaskId, now: DateTime<Utc>) {
        self.last_task_id = Some(task_id);
        self.last_run_at = Some(now);
        self.updated_at = now;
    }
}
