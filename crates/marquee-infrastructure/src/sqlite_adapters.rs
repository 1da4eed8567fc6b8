// SPDX-License-Identifier: GPL-3.0-or-later
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use marquee_domain::{
    Schedule, ScheduledTask, ScheduledTaskId, Task, TaskBody, TaskId, TaskProgress, TaskStatus,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::debug;

use crate::repositories::{ScheduledTaskRepository, TaskFilter, TaskRepository};

/// SQLx-backed task store
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn insert(&self, task: &Task) -> Result<()> {
        debug!(target: "repository", task_id = %task.id, command = %task.command_name, "inserting task");
        let q = r#"
            INSERT INTO tasks (
                id, name, command_name, body, priority, task_trigger, status,
                progress_percent, progress_message, queued_at, started_at, ended_at,
                error, scheduled_task_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#;

        sqlx::query(q)
            .bind(task.id.to_string())
            .bind(&task.name)
            .bind(&task.command_name)
            .bind(serde_json::to_string(&task.body)?)
            .bind(task.priority.to_string())
            .bind(task.trigger.to_string())
            .bind(task.status.to_string())
            .bind(i64::from(task.progress.percent))
            .bind(task.progress.message.as_deref())
            .bind(format_dt(task.queued_at))
            .bind(task.started_at.map(format_dt))
            .bind(task.ended_at.map(format_dt))
            .bind(task.error.as_deref())
            .bind(task.scheduled_task_id.map(|id| id.to_string()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_by_id(&self, id: TaskId) -> Result<Option<Task>> {
        debug!(target: "repository", task_id = %id, "fetching task by id");
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ? LIMIT 1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_task(&r)).transpose()
    }

    async fn list(&self, filter: &TaskFilter, limit: i64, offset: i64) -> Result<Vec<Task>> {
        debug!(target: "repository", ?filter, limit, offset, "listing tasks");
        let q = r#"
            SELECT * FROM tasks
            WHERE (? IS NULL OR status = ?)
              AND (? IS NULL OR command_name = ?)
            ORDER BY queued_at DESC, id
            LIMIT ? OFFSET ?
        "#;
        let status = filter.status.map(|s| s.to_string());
        let rows = sqlx::query(q)
            .bind(status.clone())
            .bind(status)
            .bind(filter.command_name.clone())
            .bind(filter.command_name.clone())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(row_to_task(&r)?);
        }
        Ok(out)
    }

    async fn count(&self, filter: &TaskFilter) -> Result<i64> {
        let q = r#"
            SELECT COUNT(*) AS total FROM tasks
            WHERE (? IS NULL OR status = ?)
              AND (? IS NULL OR command_name = ?)
        "#;
        let status = filter.status.map(|s| s.to_string());
        let row = sqlx::query(q)
            .bind(status.clone())
            .bind(status)
            .bind(filter.command_name.clone())
            .bind(filter.command_name.clone())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        debug!(target: "repository", %status, "listing tasks by status");
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = ? ORDER BY queued_at, id")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(row_to_task(&r)?);
        }
        Ok(out)
    }

    async fn compare_and_set(&self, task: &Task, expected: TaskStatus) -> Result<bool> {
        debug!(target: "repository", task_id = %task.id, from = %expected, to = %task.status, "updating task status");
        let q = r#"
            UPDATE tasks SET
                status = ?,
                progress_percent = ?,
                progress_message = ?,
                started_at = ?,
                ended_at = ?,
                error = ?
            WHERE id = ? AND status = ?
        "#;
        let result = sqlx::query(q)
            .bind(task.status.to_string())
            .bind(i64::from(task.progress.percent))
            .bind(task.progress.message.as_deref())
            .bind(task.started_at.map(format_dt))
            .bind(task.ended_at.map(format_dt))
            .bind(task.error.as_deref())
            .bind(task.id.to_string())
            .bind(expected.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_progress(&self, id: TaskId, progress: &TaskProgress) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET progress_percent = ?, progress_message = ? WHERE id = ? AND status = ?",
        )
        .bind(i64::from(progress.percent))
        .bind(progress.message.as_deref())
        .bind(id.to_string())
        .bind(TaskStatus::Running.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        debug!(target: "repository", %cutoff, "pruning finished tasks");
        let result = sqlx::query(
            "DELETE FROM tasks WHERE status IN ('completed', 'failed', 'cancelled') AND ended_at < ?",
        )
        .bind(format_dt(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================

/// SQLx-backed scheduled task store
pub struct SqliteScheduledTaskRepository {
    pool: SqlitePool,
}

impl SqliteScheduledTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ScheduledTaskRepository for SqliteScheduledTaskRepository {
    async fn create(&self, scheduled: &ScheduledTask) -> Result<()> {
        debug!(target: "repository", scheduled_task_id = %scheduled.id, name = %scheduled.name, "creating scheduled task");
        let q = r#"
            INSERT INTO scheduled_tasks (
                id, name, command_name, body, schedule, priority, enabled,
                next_run_at, last_run_at, last_task_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#;
        sqlx::query(q)
            .bind(scheduled.id.to_string())
            .bind(&scheduled.name)
            .bind(&scheduled.command_name)
            .bind(serde_json::to_string(&scheduled.body)?)
            .bind(serde_json::to_string(&scheduled.schedule)?)
            .bind(scheduled.priority.to_string())
            .bind(scheduled.enabled)
            .bind(format_dt(scheduled.next_run_at))
            .bind(scheduled.last_run_at.map(format_dt))
            .bind(scheduled.last_task_id.map(|id| id.to_string()))
            .bind(format_dt(scheduled.created_at))
            .bind(format_dt(scheduled.updated_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_by_id(&self, id: ScheduledTaskId) -> Result<Option<ScheduledTask>> {
        debug!(target: "repository", scheduled_task_id = %id, "fetching scheduled task by id");
        let row = sqlx::query("SELECT * FROM scheduled_tasks WHERE id = ? LIMIT 1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_scheduled_task(&r)).transpose()
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<ScheduledTask>> {
        debug!(target: "repository", name, "fetching scheduled task by name");
        let row = sqlx::query("SELECT * FROM scheduled_tasks WHERE name = ? LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_scheduled_task(&r)).transpose()
    }

    async fn list(&self) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query("SELECT * FROM scheduled_tasks ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(row_to_scheduled_task(&r)?);
        }
        Ok(out)
    }

    async fn update(&self, scheduled: &ScheduledTask) -> Result<()> {
        debug!(target: "repository", scheduled_task_id = %scheduled.id, "updating scheduled task");
        let q = r#"
            UPDATE scheduled_tasks SET
                name = ?,
                command_name = ?,
                body = ?,
                schedule = ?,
                priority = ?,
                enabled = ?,
                next_run_at = ?,
                last_run_at = ?,
                last_task_id = ?,
                updated_at = ?
            WHERE id = ?
        "#;
        sqlx::query(q)
            .bind(&scheduled.name)
            .bind(&scheduled.command_name)
            .bind(serde_json::to_string(&scheduled.body)?)
            .bind(serde_json::to_string(&scheduled.schedule)?)
            .bind(scheduled.priority.to_string())
            .bind(scheduled.enabled)
            .bind(format_dt(scheduled.next_run_at))
            .bind(scheduled.last_run_at.map(format_dt))
            .bind(scheduled.last_task_id.map(|id| id.to_string()))
            .bind(format_dt(scheduled.updated_at))
            .bind(scheduled.id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: ScheduledTaskId) -> Result<bool> {
        debug!(target: "repository", scheduled_task_id = %id, "deleting scheduled task");
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// Fixed-width UTC timestamps so that text comparison orders chronologically.
fn format_dt(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_dt(s: String) -> Result<DateTime<Utc>> {
    // Try RFC3339 first
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Fallback to SQLite default CURRENT_TIMESTAMP format: "YYYY-MM-DD HH:MM:SS"
    let ndt = NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
}

fn parse_dt_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(parse_dt).transpose()
}

fn parse_body(s: &str) -> Result<TaskBody> {
    serde_json::from_str(s).context("task body is not a JSON object")
}

fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    let trigger: String = row.try_get("task_trigger")?;
    let body: String = row.try_get("body")?;
    let percent: i64 = row.try_get("progress_percent")?;
    let scheduled_task_id: Option<String> = row.try_get("scheduled_task_id")?;

    Ok(Task {
        id: id.parse()?,
        name: row.try_get("name")?,
        command_name: row.try_get("command_name")?,
        body: parse_body(&body)?,
        priority: priority.parse()?,
        trigger: trigger.parse()?,
        status: status.parse()?,
        progress: TaskProgress::new(
            u8::try_from(percent.clamp(0, 100))?,
            row.try_get("progress_message")?,
        ),
        queued_at: parse_dt(row.try_get("queued_at")?)?,
        started_at: parse_dt_opt(row.try_get("started_at")?)?,
        ended_at: parse_dt_opt(row.try_get("ended_at")?)?,
        error: row.try_get("error")?,
        scheduled_task_id: scheduled_task_id.map(|s| s.parse()).transpose()?,
    })
}

fn row_to_scheduled_task(row: &SqliteRow) -> Result<ScheduledTask> {
    let id: String = row.try_get("id")?;
    let body: String = row.try_get("body")?;
    let schedule: String = row.try_get("schedule")?;
    let priority: String = row.try_get("priority")?;
    let last_task_id: Option<String> = row.try_get("last_task_id")?;

    Ok(ScheduledTask {
        id: id.parse()?,
        name: row.try_get("name")?,
        command_name: row.try_get("command_name")?,
        body: parse_body(&body)?,
        schedule: serde_json::from_str::<Schedule>(&schedule)?,
        priority: priority.parse()?,
        enabled: row.try_get("enabled")?,
        next_run_at: parse_dt(row.try_get("next_run_at")?)?,
        last_run_at: parse_dt_opt(row.try_get("last_run_at")?)?,
        last_task_id: last_task_id.map(|s| s.parse::<TaskId>()).transpose()?,
        created_at: parse_dt(row.try_get("created_at")?)?,
        updated_at: parse_dt(row.try_get("updated_at")?)?,
    })
}

// ============================================================================
// Tests
// ============================================================================
