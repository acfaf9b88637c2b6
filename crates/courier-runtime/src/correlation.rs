//! Correlation table — matches responses to the calls waiting for them.
//!
//! Each outstanding call owns one slot keyed by its opaque. A slot is
//! fulfilled at most once, by whichever comes first: the real response,
//! a synthesized failure, the local timeout sweep, or loss of the
//! connection. Removing the entry from the map is what grants the right to
//! fulfil it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use courier_core::config::CorrelationConfig;
use courier_core::Command;

use crate::connection::{Connection, ConnectionId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("connection {0} lost before the response arrived")]
    ConnectionLost(ConnectionId),
    #[error("call failed: {0}")]
    Failed(String),
    #[error("correlation table dropped the call")]
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("opaque {0} already has a pending call")]
    DuplicateOpaque(i32),
}

struct PendingCall {
    connection: ConnectionId,
    deadline: Instant,
    timeout: Duration,
    slot: oneshot::Sender<Result<Command, CallError>>,
}

/// Resolves to the response, or to the reason none will come.
#[derive(Debug)]
pub struct PendingResponse {
    opaque: i32,
    rx: oneshot::Receiver<Result<Command, CallError>>,
}

impl PendingResponse {
    pub fn opaque(&self) -> i32 {
        self.opaque
    }
}

impl Future for PendingResponse {
    type Output = Result<Command, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CallError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct CorrelationTable {
    pending: DashMap<i32, PendingCall>,
    next_opaque: AtomicI32,
    default_timeout: Duration,
}

impl CorrelationTable {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            next_opaque: AtomicI32::new(1),
            default_timeout,
        }
    }

    /// A table using the configured default timeout, swept on the
    /// configured interval for as long as it lives.
    pub fn start(config: &CorrelationConfig) -> Arc<Self> {
        let table = Arc::new(Self::new(config.default_timeout()));
        table.spawn_sweep_loop(config.sweep_interval());
        table
    }

    /// A fresh opaque for an outbound request. Wraps on overflow.
    pub fn next_opaque(&self) -> i32 {
        self.next_opaque.fetch_add(1, Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Open a slot for `opaque` on `connection`. `None` uses the table's
    /// default timeout.
    pub fn register(
        &self,
        opaque: i32,
        connection: ConnectionId,
        timeout: Option<Duration>,
    ) -> Result<PendingResponse, CorrelationError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        match self.pending.entry(opaque) {
            Entry::Occupied(_) => Err(CorrelationError::DuplicateOpaque(opaque)),
            Entry::Vacant(vacant) => {
                let (slot, rx) = oneshot::channel();
                vacant.insert(PendingCall {
                    connection,
                    deadline: Instant::now() + timeout,
                    timeout,
                    slot,
                });
                Ok(PendingResponse { opaque, rx })
            }
        }
    }

    /// Deliver a response to its waiting call. Returns false if nothing was
    /// waiting for this opaque (already answered, timed out, or unknown).
    pub fn complete(&self, response: Command) -> bool {
        let opaque = response.opaque;
        match self.pending.remove(&opaque) {
            Some((_, call)) => {
                // The waiter may have given up; that's fine.
                let _ = call.slot.send(Ok(response));
                true
            }
            None => {
                tracing::warn!(opaque, code = response.code, "response has no pending call");
                false
            }
        }
    }

    /// Resolve a pending call with an error.
    pub fn fail(&self, opaque: i32, error: CallError) -> bool {
        match self.pending.remove(&opaque) {
            Some((_, call)) => {
                let _ = call.slot.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every call still waiting on `connection`. Returns how many.
    pub fn fail_connection(&self, connection: ConnectionId) -> usize {
        let opaques: Vec<i32> = self
            .pending
            .iter()
            .filter(|entry| entry.value().connection == connection)
            .map(|entry| *entry.key())
            .collect();

        let failed = opaques
            .into_iter()
            .filter(|opaque| self.fail(*opaque, CallError::ConnectionLost(connection)))
            .count();

        if failed > 0 {
            tracing::info!(%connection, failed, "failed pending calls of closed connection");
        }
        failed
    }

    /// Fail calls past their deadline. Returns how many.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<i32> = self
            .pending
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut swept = 0;
        for opaque in expired {
            // Re-check under the shard lock; a response may have won the race.
            if let Some((_, call)) = self.pending.remove_if(&opaque, |_, c| c.deadline <= now) {
                tracing::debug!(opaque, connection = %call.connection, "call timed out");
                let _ = call.slot.send(Err(CallError::Timeout(call.timeout)));
                swept += 1;
            }
        }
        swept
    }

    /// Sweep on an interval. Stops once the table is dropped.
    pub fn spawn_sweep_loop(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(sweep_loop(Arc::downgrade(self), every))
    }

    /// Send `request` on `connection` and wait for the matching response.
    ///
    /// Assigns a fresh opaque to the request.
    pub async fn call(
        &self,
        connection: &dyn Connection,
        mut request: Command,
        timeout: Option<Duration>,
    ) -> Result<Command, CallError> {
        let opaque = self.next_opaque();
        request.opaque = opaque;
        let pending = self
            .register(opaque, connection.id(), timeout)
            .map_err(|e| CallError::Failed(e.to_string()))?;

        if let Err(e) = connection.write(request) {
            self.fail(opaque, CallError::Failed(e.to_string()));
        }
        pending.await
    }
}

async fn sweep_loop(table: Weak<CorrelationTable>, every: Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;

        let Some(strong) = table.upgrade() else {
            break;
        };
        let swept = strong.sweep_expired();
        if swept > 0 {
            tracing::debug!(swept, "expired pending calls");
        }
    }
}
