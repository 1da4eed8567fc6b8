// SPDX-License-Identifier: GPL-3.0-or-later
//! Fixed-size worker pools draining the per-pool queues.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use marquee_config::WorkerConfig;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::{PoolKind, PoolQueues, TaskQueue};
use crate::supervisor::ExecutionSupervisor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub pool: PoolKind,
    pub workers: usize,
    pub active: usize,
    pub depth: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pools: Vec<PoolStatus>,
    pub running: usize,
}

impl QueueStatus {
    pub fn pool(&self, kind: PoolKind) -> Option<&PoolStatus> {
        self.pools.iter().find(|p| p.pool == kind)
    }
}

#[derive(Default)]
struct PoolCounters {
    workers: usize,
    active: Arc<AtomicUsize>,
}

pub struct WorkerPoolSet {
    queues: Arc<PoolQueues>,
    supervisor: Arc<ExecutionSupervisor>,
    stop: CancellationToken,
    high: PoolCounters,
    normal: PoolCounters,
    background: PoolCounters,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPoolSet {
    /// Spawn every worker. Must be called from within a Tokio runtime.
    pub fn start(
        config: &WorkerConfig,
        queues: Arc<PoolQueues>,
        supervisor: Arc<ExecutionSupervisor>,
    ) -> Self {
        let mut set = Self {
            queues,
            supervisor,
            stop: CancellationToken::new(),
            high: PoolCounters::default(),
            normal: PoolCounters::default(),
            background: PoolCounters::default(),
            handles: Mutex::new(Vec::new()),
        };

        let mut handles = Vec::new();
        for (kind, size) in [
            (PoolKind::High, config.high),
            (PoolKind::Normal, config.normal),
            (PoolKind::Background, config.background),
        ] {
            if size == 0 {
                warn!(target: "workers", pool = %kind, "pool has no workers; its tasks will stay queued");
            }
            set.counters_mut(kind).workers = size;
            let active = set.counters(kind).active.clone();
            for index in 0..size {
                handles.push(tokio::spawn(worker_loop(
                    format!("{kind}-{index}"),
                    set.queues.clone(),
                    kind,
                    set.supervisor.clone(),
                    active.clone(),
                    set.stop.clone(),
                )));
            }
            info!(target: "workers", pool = %kind, workers = size, "worker pool started");
        }
        set.handles = Mutex::new(handles);
        set
    }

    fn counters(&self, kind: PoolKind) -> &PoolCounters {
        match kind {
            PoolKind::High => &self.high,
            PoolKind::Normal => &self.normal,
            PoolKind::Background => &self.background,
        }
    }

    fn counters_mut(&mut self, kind: PoolKind) -> &mut PoolCounters {
        match kind {
            PoolKind::High => &mut self.high,
            PoolKind::Normal => &mut self.normal,
            PoolKind::Background => &mut self.background,
        }
    }

    pub fn snapshot(&self) -> QueueStatus {
        let pools = PoolKind::ALL
            .into_iter()
            .map(|kind| {
                let queue: &TaskQueue = self.queues.get(kind);
                let counters = self.counters(kind);
                PoolStatus {
                    pool: kind,
                    workers: counters.workers,
                    active: counters.active.load(Ordering::SeqCst),
                    depth: queue.depth(),
                    capacity: queue.capacity(),
                }
            })
            .collect();
        QueueStatus {
            pools,
            running: self.supervisor.running().len(),
        }
    }

    /// Stop dequeuing, give running tasks `grace` to finish, then cancel them and
    /// wait another `grace` before abandoning the workers.
    ///
    /// Tasks still queued stay Queued in the store and are picked up on the next start.
    pub async fn shutdown(&self, grace: Duration) {
        self.stop.cancel();
        self.queues.close_all();

        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(|p| p.into_inner()),
        );
        if handles.is_empty() {
            return;
        }
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let mut joined = std::pin::pin!(join_all(handles));

        info!(target: "workers", running = self.supervisor.running().len(), "waiting for running tasks to finish");
        if tokio::time::timeout(grace, joined.as_mut()).await.is_ok() {
            info!(target: "workers", "all workers stopped");
            return;
        }

        let signalled = self.supervisor.running().cancel_all();
        warn!(target: "workers", signalled, ?grace, "grace period elapsed, cancelling running tasks");
        if tokio::time::timeout(grace, joined.as_mut()).await.is_ok() {
            info!(target: "workers", "all workers stopped after cancellation");
            return;
        }

        error!(target: "workers", "workers ignored cancellation, aborting them");
        for abort in aborts {
            abort.abort();
        }
    }
}

async fn worker_loop(
    worker: String,
    queues: Arc<PoolQueues>,
    kind: PoolKind,
    supervisor: Arc<ExecutionSupervisor>,
    active: Arc<AtomicUsize>,
    stop: CancellationToken,
) {
    debug!(target: "workers", %worker, "worker started");
    let queue = queues.get(kind);
    while let Some(task_id) = queue.pop(&stop).await {
        active.fetch_add(1, Ordering::SeqCst);
        supervisor.run(task_id, &worker, &stop).await;
        active.fetch_sub(1, Ordering::SeqCst);
    }
    debug!(target: "workers", %worker, "worker stopped");
}
