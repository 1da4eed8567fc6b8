// SPDX-License-Identifier: GPL-3.0-or-later
//! Bounded, priority-ordered queues of task ids, one per worker pool.
//!
//! Capacity is enforced with a semaphore. A producer reserves a [`QueueSlot`]
//! before it persists anything, so a full queue rejects work without leaving a
//! stored task behind. The slot travels with the queued entry and is released
//! when a worker pops it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use marquee_domain::{TaskId, TaskPriority};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Worker pool a task runs in. Each pool has its own queue and workers, so a
/// backlog in one never delays another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    High,
    Normal,
    Background,
}

impl PoolKind {
    pub const ALL: [PoolKind; 3] = [Self::High, Self::Normal, Self::Background];

    pub fn for_priority(priority: TaskPriority) -> Self {
        match priority {
            TaskPriority::High => Self::High,
            TaskPriority::Normal => Self::Normal,
            TaskPriority::Low => Self::Background,
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Background => write!(f, "background"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is closed")]
    Closed,
}

/// Reserved capacity in a queue, consumed by [`TaskQueue::push`].
#[derive(Debug)]
pub struct QueueSlot {
    permit: OwnedSemaphorePermit,
}

struct QueuedEntry {
    priority: TaskPriority,
    seq: u64,
    task_id: TaskId,
    _slot: OwnedSemaphorePermit,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    // Max-heap: higher priority first, then the earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedEntry>,
    next_seq: u64,
    closed: bool,
}

pub struct TaskQueue {
    kind: PoolKind,
    capacity: usize,
    slots: Arc<Semaphore>,
    state: Mutex<QueueState>,
    available: Notify,
}

impl TaskQueue {
    pub fn new(kind: PoolKind, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            kind,
            capacity,
            slots: Arc::new(Semaphore::new(capacity)),
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn depth(&self) -> usize {
        self.lock().heap.len()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!(target: "queue", pool = %self.kind, "queue mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Wait up to `wait` for free capacity.
    pub async fn reserve(&self, wait: Duration) -> Result<QueueSlot, QueueError> {
        match tokio::time::timeout(wait, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(QueueSlot { permit }),
            Ok(Err(_)) => Err(QueueError::Closed),
            Err(_) => Err(QueueError::Full),
        }
    }

    /// Take free capacity if there is any, without waiting.
    pub fn try_reserve(&self) -> Result<QueueSlot, QueueError> {
        match self.slots.clone().try_acquire_owned() {
            Ok(permit) => Ok(QueueSlot { permit }),
            Err(TryAcquireError::NoPermits) => Err(QueueError::Full),
            Err(TryAcquireError::Closed) => Err(QueueError::Closed),
        }
    }

    /// Wait as long as it takes for free capacity.
    pub async fn reserve_unbounded(&self) -> Result<QueueSlot, QueueError> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map(|permit| QueueSlot { permit })
            .map_err(|_| QueueError::Closed)
    }

    /// Add a task using previously reserved capacity.
    ///
    /// Entries pushed after [`close`](Self::close) stay queued but are never
    /// handed to a worker; the store keeps them Queued for the next start.
    pub fn push(&self, slot: QueueSlot, task_id: TaskId, priority: TaskPriority) {
        {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(QueuedEntry {
                priority,
                seq,
                task_id,
                _slot: slot.permit,
            });
        }
        self.available.notify_one();
    }

    /// Next task in priority order, or `None` once the queue is closed or
    /// `shutdown` fires.
    pub async fn pop(&self, shutdown: &CancellationToken) -> Option<TaskId> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            let notified = self.available.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(entry) = state.heap.pop() {
                    if !state.heap.is_empty() {
                        // Pass the wakeup on; one push may have been absorbed by a worker that was already awake.
                        self.available.notify_one();
                    }
                    return Some(entry.task_id);
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    /// Drop a task that has not been dequeued yet. Returns whether it was found.
    pub fn remove(&self, task_id: TaskId) -> bool {
        let mut state = self.lock();
        let before = state.heap.len();
        state.heap.retain(|entry| entry.task_id != task_id);
        state.heap.len() != before
    }

    /// Stop handing out work and refuse new reservations.
    pub fn close(&self) {
        self.lock().closed = true;
        self.slots.close();
        self.available.notify_waiters();
    }
}

/// The three per-pool queues.
pub struct PoolQueues {
    high: TaskQueue,
    normal: TaskQueue,
    background: TaskQueue,
}

impl PoolQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            high: TaskQueue::new(PoolKind::High, capacity),
            normal: TaskQueue::new(PoolKind::Normal, capacity),
            background: TaskQueue::new(PoolKind::Background, capacity),
        }
    }

    pub fn get(&self, kind: PoolKind) -> &TaskQueue {
        match kind {
            PoolKind::High => &self.high,
            PoolKind::Normal => &self.normal,
            PoolKind::Background => &self.background,
        }
    }

    pub fn for_priority(&self, priority: TaskPriority) -> &TaskQueue {
        self.get(PoolKind::for_priority(priority))
    }

    pub fn close_all(&self) {
        for kind in PoolKind::ALL {
            self.get(kind).close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn priorities_map_to_pools() {
        assert_eq!(PoolKind::for_priority(TaskPriority::High), PoolKind::High);
        assert_eq!(PoolKind::for_priority(TaskPriority::Normal), PoolKind::Normal);
        assert_eq!(PoolKind::for_priority(TaskPriority::Low), PoolKind::Background);
        assert_eq!(PoolKind::Background.to_string(), "background");
    }

    #[tokio::test]
    async fn pops_in_priority_then_arrival_order() {
        let queue = TaskQueue::new(PoolKind::Normal, 8);
        let token = CancellationToken::new();
        let first = TaskId::new();
        let second = TaskId::new();
        let urgent = TaskId::new();

        for (id, priority) in [
            (first, TaskPriority::Normal),
            (second, TaskPriority::Normal),
            (urgent, TaskPriority::High),
        ] {
            let slot = queue.reserve(SHORT).await.unwrap();
            queue.push(slot, id, priority);
        }

        assert_eq!(queue.pop(&token).await, Some(urgent));
        assert_eq!(queue.pop(&token).await, Some(first));
        assert_eq!(queue.pop(&token).await, Some(second));
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn reserve_fails_when_full_and_recovers_after_pop() {
        let queue = TaskQueue::new(PoolKind::Background, 1);
        let token = CancellationToken::new();

        let slot = queue.reserve(SHORT).await.unwrap();
        queue.push(slot, TaskId::new(), TaskPriority::Low);
        assert_eq!(queue.reserve(SHORT).await.unwrap_err(), QueueError::Full);

        queue.pop(&token).await.unwrap();
        assert!(queue.reserve(SHORT).await.is_ok());
    }

    #[test]
    fn try_reserve_never_waits() {
        let queue = TaskQueue::new(PoolKind::Normal, 1);
        let slot = queue.try_reserve().unwrap();
        assert_eq!(queue.try_reserve().unwrap_err(), QueueError::Full);
        drop(slot);
        assert!(queue.try_reserve().is_ok());

        queue.close();
        assert_eq!(queue.try_reserve().unwrap_err(), QueueError::Closed);
    }

    #[tokio::test]
    async fn dropped_slot_returns_capacity() {
        let queue = TaskQueue::new(PoolKind::High, 1);
        let slot = queue.reserve(SHORT).await.unwrap();
        drop(slot);
        assert!(queue.reserve(SHORT).await.is_ok());
    }

    #[tokio::test]
    async fn remove_frees_capacity() {
        let queue = TaskQueue::new(PoolKind::Normal, 1);
        let id = TaskId::new();
        let slot = queue.reserve(SHORT).await.unwrap();
        queue.push(slot, id, TaskPriority::Normal);

        assert!(queue.remove(id));
        assert!(!queue.remove(id));
        assert_eq!(queue.depth(), 0);
        assert!(queue.reserve(SHORT).await.is_ok());
    }

    #[tokio::test]
    async fn waiting_pop_wakes_on_push() {
        let queue = Arc::new(TaskQueue::new(PoolKind::Normal, 4));
        let token = CancellationToken::new();
        let id = TaskId::new();

        let waiter = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.pop(&token).await })
        };
        tokio::time::sleep(SHORT).await;

        let slot = queue.reserve(SHORT).await.unwrap();
        queue.push(slot, id, TaskPriority::Normal);
        assert_eq!(waiter.await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn close_releases_waiters_and_rejects_reservations() {
        let queue = Arc::new(TaskQueue::new(PoolKind::Normal, 4));
        let token = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.pop(&token).await })
        };
        tokio::time::sleep(SHORT).await;

        queue.close();
        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(queue.reserve(SHORT).await.unwrap_err(), QueueError::Closed);
    }

    #[tokio::test]
    async fn shutdown_token_stops_pop() {
        let queue = TaskQueue::new(PoolKind::High, 4);
        let token = CancellationToken::new();
        let slot = queue.reserve(SHORT).await.unwrap();
        queue.push(slot, TaskId::new(), TaskPriority::High);

        token.cancel();
        assert_eq!(queue.pop(&token).await, None);
        assert_eq!(queue.depth(), 1);
    }
}
