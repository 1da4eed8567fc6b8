// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use marquee_config::{load as load_config, AppConfig, TelemetryConfig};
use marquee_infrastructure::{
    init_database, ScheduledTaskRepository, SqliteScheduledTaskRepository, SqliteTaskRepository,
    TaskRepository,
};
use marquee_scheduler::jobs::{CHECK_HEALTH, HOUSEKEEPING};
use marquee_scheduler::{
    builtin_schedules, CheckHealthHandler, Clock, HandlerRegistry, HealthCheck,
    HousekeepingHandler, SystemClock, TaskEngine,
};
use sqlx::SqlitePool;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CONFIG_ENV: &str = "MARQUEE_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path();
    let config = load_config(config_path.as_deref())?;
    init_tracing(&config.telemetry);

    let pool = init_database(&config).await?;
    let engine = start_engine(&config, pool).await?;

    shutdown_signal().await;
    engine.shutdown(config.workers.shutdown_timeout()).await;

    Ok(())
}

fn config_path() -> Option<PathBuf> {
    std::env::var_os(CONFIG_ENV).map(PathBuf::from)
}

fn init_tracing(telemetry: &TelemetryConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&telemetry.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if telemetry.json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_level(true),
            )
            .init();
    }
}

/// Confirms the database still answers queries.
struct DatabaseHealthCheck {
    pool: SqlitePool,
}

#[async_trait]
impl HealthCheck for DatabaseHealthCheck {
    fn name(&self) -> String {
        "database".to_string()
    }

    async fn check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

async fn start_engine(config: &AppConfig, pool: SqlitePool) -> Result<TaskEngine> {
    let tasks: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let definitions: Arc<dyn ScheduledTaskRepository> =
        Arc::new(SqliteScheduledTaskRepository::new(pool.clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let registry = HandlerRegistry::builder()
        .register(
            HOUSEKEEPING,
            HousekeepingHandler::new(tasks.clone(), config.tasks.retention_days, clock.clone()),
        )
        .register(
            CHECK_HEALTH,
            CheckHealthHandler::new(vec![Arc::new(DatabaseHealthCheck { pool })]),
        )
        .build();

    let engine = TaskEngine::builder(tasks, definitions, registry)
        .config(config)
        .clock(clock)
        .builtin_schedules(builtin_schedules())
        .start()
        .await?;

    let status = engine.queue_status();
    info!(
        target: "cli",
        pools = status.pools.len(),
        commands = engine.commands().len(),
        "marquee is running, press Ctrl+C to stop"
    );
    Ok(engine)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut interrupt), Ok(mut terminate)) => {
                tokio::select! {
                    _ = interrupt.recv() => {},
                    _ = terminate.recv() => {},
                }
            }
            _ => {
                tracing::warn!(target: "cli", "could not install signal handlers, falling back to ctrl_c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!(target: "cli", "shutdown signal received");
}
