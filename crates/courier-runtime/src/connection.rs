//! Connection handles — where responses are written.
//!
//! The runtime never owns a connection. It only needs to tell two handles
//! apart and to queue a command for writing without waiting on the socket.
//! Serializing concurrent writes is the transport's job.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use courier_core::Command;

/// Identity of a connection, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// A process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
}

/// An outbound channel to a remote peer.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Queue `command` for writing. Must not block.
    ///
    /// An `Ok` only means the command was handed to the transport; delivery
    /// failures after that are reported through the transport itself.
    fn write(&self, command: Command) -> Result<(), ConnectionError>;
}

/// A connection backed by the transport's outbound write queue.
///
/// The transport (or a test) drains the paired receiver and puts the
/// commands on the wire.
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Command>,
}

impl ChannelConnection {
    /// Create a connection with a fresh id and its write-queue receiver.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Command>) {
        Self::with_id(ConnectionId::next())
    }

    pub fn with_id(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Connection for ChannelConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn write(&self, command: Command) -> Result<(), ConnectionError> {
        self.tx
            .send(command)
            .map_err(|_| ConnectionError::Closed(self.id))
    }
}
