//! courier-runtime — executes inbound commands on a bounded worker pool
//! and guarantees every request is answered, even under overload.
//!
//! The decode layer hands each command to a [`CommandDispatcher`]. Requests
//! become [`DispatchTask`]s on a [`WorkerPool`]; responses resolve pending
//! calls in the [`CorrelationTable`].

pub mod connection;
pub mod correlation;
pub mod dispatcher;
pub mod pool;
pub mod task;

pub use connection::{ChannelConnection, Connection, ConnectionError, ConnectionId};
pub use correlation::{CallError, CorrelationError, CorrelationTable, PendingResponse};
pub use dispatcher::{CommandDispatcher, CommandProcessor, Dispatched};
pub use pool::{PoolStats, SubmitError, WorkerPool};
pub use task::DispatchTask;
