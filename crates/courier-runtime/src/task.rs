//! Dispatch task — one inbound request bound to the work that answers it.
//!
//! A task is consumed exactly once: a worker executes it, or the pool
//! answers it through [`DispatchTask::send_failure_response`] (overload,
//! queue expiry, shutdown). Never both.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use courier_core::Command;

use crate::connection::{Connection, ConnectionId};

/// The business handler invocation.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;
const FINISHED: u8 = 3;

pub struct DispatchTask {
    work: Mutex<Option<Work>>,
    connection: Arc<dyn Connection>,
    origin: Command,
    created_at: Instant,
    /// PENDING → RUNNING → FINISHED, or PENDING → CANCELLED.
    state: AtomicU8,
}

impl DispatchTask {
    pub fn new(
        work: impl FnOnce() + Send + 'static,
        connection: Arc<dyn Connection>,
        origin: Command,
    ) -> Self {
        Self::with_created_at(work, connection, origin, Instant::now())
    }

    pub(crate) fn with_created_at(
        work: impl FnOnce() + Send + 'static,
        connection: Arc<dyn Connection>,
        origin: Command,
        created_at: Instant,
    ) -> Self {
        Self {
            work: Mutex::new(Some(Box::new(work))),
            connection,
            origin,
            created_at,
            state: AtomicU8::new(PENDING),
        }
    }

    /// Run the work unless the task was cancelled first.
    ///
    /// Only the first call can run it. Panics from the work propagate to
    /// the caller.
    pub fn execute(&self) {
        if self
            .state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!(opaque = self.origin.opaque, "task not pending, skipping");
            return;
        }

        let work = match self.work.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        // Mark finished even if the work panics.
        let _finish = FinishGuard(&self.state);
        if let Some(work) = work {
            work();
        }
    }

    /// Prevent a not-yet-started execution. Idempotent.
    ///
    /// Returns true if the task is cancelled after the call. A task that
    /// already started keeps running and this returns false.
    pub fn cancel(&self) -> bool {
        match self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == CANCELLED,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Answer the origin request directly, bypassing the work.
    ///
    /// One write attempt, no waiting, no retry.
    pub fn send_failure_response(&self, code: i32, message: impl Into<String>) {
        let response = Command::response_to(&self.origin, code, message);
        if let Err(e) = self.connection.write(response) {
            tracing::debug!(
                opaque = self.origin.opaque,
                code,
                error = %e,
                "failure response not written"
            );
        }
    }

    pub fn origin(&self) -> &Command {
        &self.origin
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since the task was created.
    pub fn queued_for(&self) -> Duration {
        self.created_at.elapsed()
    }
}

struct FinishGuard<'a>(&'a AtomicU8);

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.0.store(FINISHED, Ordering::Release);
    }
}

/// Content equality: creation time, cancellation, connection, and origin
/// opaque. The work itself is not compared.
impl PartialEq for DispatchTask {
    fn eq(&self, other: &Self) -> bool {
        self.created_at == other.created_at
            && self.is_cancelled() == other.is_cancelled()
            && self.connection_id() == other.connection_id()
            && self.origin.opaque == other.origin.opaque
    }
}

impl fmt::Debug for DispatchTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTask")
            .field("connection", &self.connection_id())
            .field("opaque", &self.origin.opaque)
            .field("code", &self.origin.code)
            .field("created_at", &self.created_at)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}
