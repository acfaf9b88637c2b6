//! Routes decoded commands: responses to the correlation table, requests
//! to the processor registered for their code.
//!
//! Each request becomes a [`DispatchTask`] on the processor's pool. The
//! task's work runs the processor and writes whatever it returns back to
//! the originating connection under the request's opaque.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;

use courier_core::{codes, Command};

use crate::connection::{Connection, ConnectionId};
use crate::correlation::CorrelationTable;
use crate::pool::{SubmitError, WorkerPool};
use crate::task::DispatchTask;

pub const REJECT_REQUEST_REMARK: &str =
    "[REJECTREQUEST]system busy, start flow control for a while";

/// Business logic for one or more request codes.
pub trait CommandProcessor: Send + Sync {
    /// Handle a request. Runs on a pool worker and may block.
    ///
    /// `Ok(Some(response))` is written back with the request's opaque
    /// (unless the request is oneway). An `Err` or a panic is answered with
    /// SYSTEM_ERROR.
    fn process(&self, connection: &Arc<dyn Connection>, request: Command)
        -> Result<Option<Command>>;

    /// Processor-level flow control, checked before a task is built.
    fn reject_request(&self) -> bool {
        false
    }
}

/// What `dispatch` did with a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// A response; `true` if a pending call was waiting for it.
    Response(bool),
    /// Admitted to a worker pool.
    Submitted,
    /// Refused by the pool and answered with SYSTEM_BUSY.
    Rejected(SubmitError),
    /// The processor asked for flow control; answered with SYSTEM_BUSY.
    Refused,
    /// No processor for the code; answered with REQUEST_CODE_NOT_SUPPORTED.
    Unsupported,
}

#[derive(Clone)]
struct Route {
    processor: Arc<dyn CommandProcessor>,
    pool: WorkerPool,
}

pub struct CommandDispatcher {
    routes: HashMap<i32, Route>,
    default_route: Option<Route>,
    correlation: Arc<CorrelationTable>,
}

impl CommandDispatcher {
    pub fn new(correlation: Arc<CorrelationTable>) -> Self {
        Self {
            routes: HashMap::new(),
            default_route: None,
            correlation,
        }
    }

    /// Route requests with `code` to `processor`, executed on `pool`.
    /// Several codes may share a processor or a pool.
    pub fn register(&mut self, code: i32, processor: Arc<dyn CommandProcessor>, pool: WorkerPool) {
        self.routes.insert(code, Route { processor, pool });
    }

    /// Fallback for codes with no registered processor.
    pub fn register_default(&mut self, processor: Arc<dyn CommandProcessor>, pool: WorkerPool) {
        self.default_route = Some(Route { processor, pool });
    }

    pub fn correlation(&self) -> &Arc<CorrelationTable> {
        &self.correlation
    }

    /// Handle one decoded command from `connection`. Never blocks.
    pub fn dispatch(&self, connection: &Arc<dyn Connection>, command: Command) -> Dispatched {
        if command.is_response() {
            return Dispatched::Response(self.correlation.complete(command));
        }

        let Some(route) = self.routes.get(&command.code).or(self.default_route.as_ref()) else {
            tracing::warn!(
                code = command.code,
                opaque = command.opaque,
                connection = %connection.id(),
                "request code not supported"
            );
            let remark = format!("request type {} not supported", command.code);
            write_response(
                connection,
                Command::response_to(&command, codes::REQUEST_CODE_NOT_SUPPORTED, remark),
            );
            return Dispatched::Unsupported;
        };

        if route.processor.reject_request() {
            write_response(
                connection,
                Command::response_to(&command, codes::SYSTEM_BUSY, REJECT_REQUEST_REMARK),
            );
            return Dispatched::Refused;
        }

        let work = {
            let processor = route.processor.clone();
            let connection = connection.clone();
            let request = command.clone();
            move || run_processor(processor.as_ref(), &connection, request)
        };
        let task = Arc::new(DispatchTask::new(work, connection.clone(), command));

        match route.pool.submit(task) {
            Ok(()) => Dispatched::Submitted,
            Err(e) => Dispatched::Rejected(e),
        }
    }

    /// The connection is gone; fail the calls still waiting on it.
    pub fn connection_closed(&self, connection: ConnectionId) -> usize {
        self.correlation.fail_connection(connection)
    }

    /// Shut down every pool this dispatcher routes to.
    pub async fn shutdown(&self) {
        for route in self.routes.values().chain(self.default_route.iter()) {
            route.pool.shutdown().await;
        }
    }
}

fn run_processor(
    processor: &dyn CommandProcessor,
    connection: &Arc<dyn Connection>,
    request: Command,
) {
    let opaque = request.opaque;
    let code = request.code;
    let oneway = request.is_oneway();

    let outcome =
        panic::catch_unwind(AssertUnwindSafe(|| processor.process(connection, request)));
    let response = match outcome {
        Ok(Ok(Some(mut response))) => {
            response.opaque = opaque;
            response.mark_response();
            response
        }
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            tracing::warn!(opaque, code, error = %e, "processor failed");
            Command::response(codes::SYSTEM_ERROR, format!("{e:#}")).with_opaque(opaque)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::warn!(opaque, code, panic = %message, "processor panicked");
            Command::response(codes::SYSTEM_ERROR, format!("processor panicked: {message}"))
                .with_opaque(opaque)
        }
    };

    if oneway {
        tracing::trace!(opaque, code, "oneway request, response dropped");
        return;
    }
    write_response(connection, response);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

fn write_response(connection: &Arc<dyn Connection>, response: Command) {
    let opaque = response.opaque;
    if let Err(e) = connection.write(response) {
        tracing::debug!(opaque, error = %e, "response not written");
    }
}
