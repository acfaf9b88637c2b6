//! Worker pool — bounded execution with fail-fast admission.
//!
//! `submit` never waits for a worker. A task is admitted only while the
//! pool's occupancy (queued + running) is below `worker_count +
//! queue_capacity`; otherwise it is answered with SYSTEM_BUSY inside the
//! `submit` call and dropped. Admitted tasks run in FIFO order.
//!
//! Work runs on tokio's blocking thread pool, one task per worker at a
//! time, so a handler that blocks never stalls the I/O tasks that submit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use courier_core::codes;
use courier_core::config::{ConfigError, FastFailureConfig, PoolConfig};

use crate::task::DispatchTask;

pub const OVERLOAD_REMARK: &str = "[OVERLOAD]system busy, start flow control for a while";
pub const SHUTDOWN_REMARK: &str = "[SHUTDOWN]worker pool is shutting down";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("worker pool saturated")]
    Overloaded,
    #[error("worker pool shut down")]
    ShutDown,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub queued: usize,
    pub running: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub expired: u64,
}

/// Handle to a running pool. Clones share the same workers and queue.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
    workers: Arc<tokio::sync::Mutex<Vec<JoinHandle<()>>>>,
}

struct Inner {
    name: String,
    worker_count: usize,
    queue_capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    accepted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    expired: AtomicU64,
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Arc<DispatchTask>>,
    running: usize,
    shut_down: bool,
}

enum Next {
    Task(Arc<DispatchTask>),
    Idle,
    Stop,
}

impl WorkerPool {
    /// Spawn the workers. Must be called from within a tokio runtime.
    pub fn start(name: impl Into<String>, config: &PoolConfig) -> Result<Self, ConfigError> {
        if config.worker_count == 0 {
            return Err(ConfigError::NotPositive("pool.worker_count"));
        }
        if config.queue_capacity == 0 {
            return Err(ConfigError::NotPositive("pool.queue_capacity"));
        }

        let inner = Arc::new(Inner {
            name: name.into(),
            worker_count: config.worker_count,
            queue_capacity: config.queue_capacity,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        });

        let workers: Vec<_> = (0..config.worker_count)
            .map(|index| tokio::spawn(worker_loop(inner.clone(), index)))
            .collect();

        tracing::info!(
            pool = %inner.name,
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            "worker pool started"
        );

        Ok(Self {
            inner,
            workers: Arc::new(tokio::sync::Mutex::new(workers)),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Admit `task` or answer it with SYSTEM_BUSY. Never blocks.
    pub fn submit(&self, task: Arc<DispatchTask>) -> Result<(), SubmitError> {
        let rejection = {
            let mut state = lock(&self.inner.state);
            if state.shut_down {
                Some(SubmitError::ShutDown)
            } else if state.tasks.len() + state.running >= self.inner.limit() {
                Some(SubmitError::Overloaded)
            } else {
                state.tasks.push_back(task.clone());
                None
            }
        };

        let Some(err) = rejection else {
            self.inner.accepted.fetch_add(1, Ordering::Relaxed);
            self.inner.notify.notify_one();
            return Ok(());
        };

        self.inner.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            pool = %self.inner.name,
            opaque = task.origin().opaque,
            code = task.origin().code,
            connection = %task.connection_id(),
            error = %err,
            "request rejected"
        );
        let remark = match err {
            SubmitError::Overloaded => OVERLOAD_REMARK,
            SubmitError::ShutDown => SHUTDOWN_REMARK,
        };
        task.send_failure_response(codes::SYSTEM_BUSY, remark);
        Err(err)
    }

    /// Answer and drop queued tasks that have waited longer than `max_wait`.
    ///
    /// Only the queue head is inspected, so the scan stops at the first
    /// task young enough to keep. Tasks already cancelled are dropped
    /// without an answer. Returns how many were answered.
    pub fn expire_stale(&self, max_wait: Duration) -> usize {
        let stale: Vec<(Arc<DispatchTask>, usize)> = {
            let mut state = lock(&self.inner.state);
            let mut stale = Vec::new();
            while state
                .tasks
                .front()
                .is_some_and(|task| task.queued_for() > max_wait)
            {
                if let Some(task) = state.tasks.pop_front() {
                    stale.push((task, state.tasks.len()));
                }
            }
            stale
        };

        let mut answered = 0;
        for (task, queue_len) in &stale {
            // Already cancelled means someone else answers it.
            if task.cancel() {
                answered += 1;
                task.send_failure_response(
                    codes::SYSTEM_BUSY,
                    format!(
                        "[TIMEOUT_CLEAN_QUEUE]system busy, start flow control for a while, \
                         period in queue: {}ms, size of queue: {}",
                        task.queued_for().as_millis(),
                        queue_len
                    ),
                );
            }
        }

        if answered > 0 {
            self.inner
                .expired
                .fetch_add(answered as u64, Ordering::Relaxed);
            tracing::warn!(
                pool = %self.inner.name,
                expired = answered,
                max_wait_ms = max_wait.as_millis() as u64,
                "expired stale queued requests"
            );
        }
        answered
    }

    /// Run the queue-expiry sweep on an interval if fast failure is on.
    pub fn spawn_expiry_loop(&self, config: &FastFailureConfig) -> Option<JoinHandle<()>> {
        if !config.enabled {
            return None;
        }
        Some(tokio::spawn(expiry_loop(
            self.clone(),
            config.max_queue_wait(),
            config.sweep_interval(),
        )))
    }

    /// Stop admitting, answer everything still queued, and wait for the
    /// workers to finish their current task.
    ///
    /// Safe to call more than once. Every caller returns only after the
    /// workers have stopped.
    pub async fn shutdown(&self) {
        let drained: Option<Vec<Arc<DispatchTask>>> = {
            let mut state = lock(&self.inner.state);
            if state.shut_down {
                None
            } else {
                state.shut_down = true;
                Some(state.tasks.drain(..).collect())
            }
        };

        if let Some(drained) = drained {
            for task in &drained {
                if task.cancel() {
                    task.send_failure_response(codes::SYSTEM_BUSY, SHUTDOWN_REMARK);
                }
            }
            tracing::info!(
                pool = %self.inner.name,
                drained = drained.len(),
                "worker pool shutting down"
            );
            self.inner.notify.notify_waiters();
        }

        // Held across the joins so a second caller waits for the first.
        let mut workers = self.workers.lock().await;
        for (index, worker) in workers.drain(..).enumerate() {
            if let Err(e) = worker.await {
                tracing::warn!(
                    pool = %self.inner.name,
                    worker = index,
                    error = %e,
                    "worker did not stop cleanly"
                );
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.inner.state).shut_down
    }

    pub fn stats(&self) -> PoolStats {
        let (queued, running) = {
            let state = lock(&self.inner.state);
            (state.tasks.len(), state.running)
        };
        PoolStats {
            queued,
            running,
            accepted: self.inner.accepted.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            expired: self.inner.expired.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn limit(&self) -> usize {
        self.worker_count + self.queue_capacity
    }

    fn next(&self) -> Next {
        let mut state = lock(&self.state);
        if let Some(task) = state.tasks.pop_front() {
            state.running += 1;
            Next::Task(task)
        } else if state.shut_down {
            Next::Stop
        } else {
            Next::Idle
        }
    }

    fn finish(&self) {
        lock(&self.state).running -= 1;
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn worker_loop(inner: Arc<Inner>, index: usize) {
    loop {
        // Register for wakeups before looking at the queue so a submit or
        // shutdown between the check and the await is not missed.
        let notified = inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let task = match inner.next() {
            Next::Task(task) => task,
            Next::Idle => {
                notified.await;
                continue;
            }
            Next::Stop => break,
        };

        let opaque = task.origin().opaque;
        tracing::trace!(
            pool = %inner.name,
            worker = index,
            opaque,
            waited_ms = task.queued_for().as_millis() as u64,
            "running task"
        );

        let result = tokio::task::spawn_blocking(move || task.execute()).await;
        inner.finish();

        if let Err(e) = result {
            tracing::warn!(
                pool = %inner.name,
                worker = index,
                opaque,
                error = %e,
                "task panicked"
            );
        }
    }
    tracing::debug!(pool = %inner.name, worker = index, "worker stopped");
}

/// Expire stale queued tasks until the pool shuts down.
pub async fn expiry_loop(pool: WorkerPool, max_wait: Duration, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if pool.is_shut_down() {
            break;
        }
        pool.expire_stale(max_wait);
    }
}
