// SPDX-License-Identifier: GPL-3.0-or-later
//! Handlers the engine ships with and their default schedules.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use marquee_domain::{Schedule, TaskPriority};
use marquee_infrastructure::TaskRepository;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::handler::{TaskContext, TaskHandler};
use crate::scheduler::NewScheduledTask;

pub const HOUSEKEEPING: &str = "Housekeeping";
pub const CHECK_HEALTH: &str = "CheckHealth";

/// Default recurring definitions for the built-in commands.
pub fn builtin_schedules() -> Vec<NewScheduledTask> {
    vec![
        NewScheduledTask::new("Housekeeping", HOUSEKEEPING, Schedule::cron("0 3 * * *"))
            .priority(TaskPriority::Low),
        NewScheduledTask::new("Check Health", CHECK_HEALTH, Schedule::interval(6 * 60 * 60))
            .priority(TaskPriority::High),
    ]
}

/// Deletes finished tasks older than the retention window.
pub struct HousekeepingHandler {
    tasks: Arc<dyn TaskRepository>,
    retention: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl HousekeepingHandler {
    /// `clock` should be the engine's, so cutoffs line up with recorded timestamps.
    pub fn new(tasks: Arc<dyn TaskRepository>, retention_days: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            tasks,
            retention: chrono::Duration::days(i64::from(retention_days)),
            clock,
        }
    }
}

#[async_trait]
impl TaskHandler for HousekeepingHandler {
    fn name(&self) -> String {
        "Housekeeping".to_string()
    }

    fn description(&self) -> String {
        "Removes finished task history past its retention period".to_string()
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        ctx.check_cancelled()?;
        let cutoff = self.clock.now() - self.retention;
        let removed = self.tasks.delete_finished_before(cutoff).await?;
        info!(target: "jobs", removed, %cutoff, "pruned task history");
        ctx.report_progress(100, format!("removed {removed} finished tasks"))
            .await;
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(10 * 60))
    }
}

/// A single probe run by [`CheckHealthHandler`].
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> String;

    async fn check(&self) -> Result<()>;
}

/// Runs every configured health check and fails if any of them fails.
pub struct CheckHealthHandler {
    checks: Vec<Arc<dyn HealthCheck>>,
}

impl CheckHealthHandler {
    pub fn new(checks: Vec<Arc<dyn HealthCheck>>) -> Self {
        Self { checks }
    }
}

#[async_trait]
impl TaskHandler for CheckHealthHandler {
    fn name(&self) -> String {
        "Check Health".to_string()
    }

    fn description(&self) -> String {
        "Probes the services the application depends on".to_string()
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let total = self.checks.len();
        let mut failures = Vec::new();

        for (index, check) in self.checks.iter().enumerate() {
            ctx.check_cancelled()?;
            let name = check.name();
            match check.check().await {
                Ok(()) => info!(target: "jobs", check = %name, "health check passed"),
                Err(e) => {
                    warn!(target: "jobs", check = %name, error = %e, "health check failed");
                    failures.push(format!("{name}: {e:#}"));
                }
            }
            let percent = u8::try_from((index + 1) * 100 / total).unwrap_or(100);
            ctx.report_progress(percent, name).await;
        }

        if !failures.is_empty() {
            bail!(
                "{} of {} health checks failed: {}",
                failures.len(),
                total,
                failures.join("; ")
            );
        }
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(5 * 60))
    }
}
