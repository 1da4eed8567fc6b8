// SPDX-License-Identifier: GPL-3.0-or-later
//! Background task engine: priority worker pools, a supervised execution
//! lifecycle and a recurring-task scheduler.
//!
//! Build a [`HandlerRegistry`] with one [`TaskHandler`] per command, then start
//! a [`TaskEngine`] over a task store and a scheduled-task store.

pub mod clock;
pub mod engine;
pub mod error;
pub mod handler;
pub mod jobs;
pub mod manager;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod supervisor;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{TaskEngine, TaskEngineBuilder, TaskPage, TaskQuery};
pub use error::{EngineError, Result};
pub use handler::{ProgressReporter, TaskCancelled, TaskContext, TaskHandler};
pub use jobs::{builtin_schedules, CheckHealthHandler, HealthCheck, HousekeepingHandler};
pub use manager::NewTask;
pub use pool::{PoolStatus, QueueStatus};
pub use queue::PoolKind;
pub use registry::{CommandInfo, HandlerRegistry, HandlerRegistryBuilder};
pub use scheduler::{NewScheduledTask, ScheduledTaskUpdate, SchedulerHandle};
