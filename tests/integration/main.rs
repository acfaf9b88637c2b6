//! Courier integration test harness.
//!
//! Each test wires a client and a server over an in-memory link: the
//! client's writes are dispatched by the server's dispatcher and the
//! server's writes (responses) come back through the client's dispatcher,
//! which resolves them in its correlation table.
//!
//!   cargo test --test integration
//!
//! Set RUST_LOG=courier_runtime=debug to see the runtime's logs.

use std::sync::{Arc, Condvar, Mutex, Once};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use courier_core::Command;
use courier_runtime::{ChannelConnection, CommandDispatcher, Connection, CorrelationTable};

mod round_trip;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a test-friendly subscriber once per process.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A connected client/server pair.
pub struct Link {
    pub client: Arc<CommandDispatcher>,
    pub client_conn: Arc<dyn Connection>,
    pub server: Arc<CommandDispatcher>,
    pumps: Vec<JoinHandle<()>>,
}

impl Link {
    /// Connect a fresh client to `server`.
    pub fn open(server: CommandDispatcher) -> Self {
        init_tracing();

        let client = Arc::new(CommandDispatcher::new(Arc::new(CorrelationTable::new(
            CALL_TIMEOUT,
        ))));
        let server = Arc::new(server);

        let (client_conn, client_out) = ChannelConnection::new();
        let (server_conn, server_out) = ChannelConnection::new();
        let client_conn: Arc<dyn Connection> = Arc::new(client_conn);
        let server_conn: Arc<dyn Connection> = Arc::new(server_conn);

        let pumps = vec![
            pump(client_out, server.clone(), server_conn.clone()),
            pump(server_out, client.clone(), client_conn.clone()),
        ];

        Self {
            client,
            client_conn,
            server,
            pumps,
        }
    }

    /// Send a request from the client and wait for its response.
    pub async fn call(&self, request: Command) -> Result<Command, courier_runtime::CallError> {
        self.client
            .correlation()
            .call(self.client_conn.as_ref(), request, None)
            .await
    }

    /// Same as [`Link::call`] with an explicit timeout.
    pub async fn call_with_timeout(
        &self,
        request: Command,
        timeout: Duration,
    ) -> Result<Command, courier_runtime::CallError> {
        self.client
            .correlation()
            .call(self.client_conn.as_ref(), request, Some(timeout))
            .await
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// Move everything written on one side into the other side's dispatcher.
fn pump(
    mut outbound: mpsc::UnboundedReceiver<Command>,
    dispatcher: Arc<CommandDispatcher>,
    arrived_on: Arc<dyn Connection>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = outbound.recv().await {
            dispatcher.dispatch(&arrived_on, command);
        }
    })
}

/// Blocks processor threads until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }
}

/// Poll `pred` until it holds or five seconds pass.
pub async fn eventually(mut pred: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
