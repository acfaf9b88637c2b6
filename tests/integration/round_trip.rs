use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;

use courier_core::config::PoolConfig;
use courier_core::{codes, Command};
use courier_runtime::{
    CallError, CommandDispatcher, CommandProcessor, Connection, CorrelationTable, WorkerPool,
};

use crate::*;

const ECHO: i32 = 1;
const BROKEN: i32 = 2;
const SILENT: i32 = 3;

struct Echo;

impl CommandProcessor for Echo {
    fn process(&self, _: &Arc<dyn Connection>, request: Command) -> Result<Option<Command>> {
        Ok(Some(
            Command::response(codes::SUCCESS, "echo").with_body(request.body),
        ))
    }
}

struct Broken;

impl CommandProcessor for Broken {
    fn process(&self, _: &Arc<dyn Connection>, request: Command) -> Result<Option<Command>> {
        bail!("cannot handle {} bytes", request.body.len())
    }
}

/// Never answers; counts what it saw.
#[derive(Default)]
struct Silent(AtomicUsize);

impl CommandProcessor for Silent {
    fn process(&self, _: &Arc<dyn Connection>, _: Command) -> Result<Option<Command>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

fn server(silent: Arc<Silent>) -> CommandDispatcher {
    let pool = WorkerPool::start(
        "server",
        &PoolConfig {
            worker_count: 4,
            queue_capacity: 64,
        },
    )
    .unwrap();

    let mut d = CommandDispatcher::new(Arc::new(CorrelationTable::new(CALL_TIMEOUT)));
    d.register(ECHO, Arc::new(Echo), pool.clone());
    d.register(BROKEN, Arc::new(Broken), pool.clone());
    d.register(SILENT, silent, pool);
    d
}

#[tokio::test]
async fn echo_round_trip() {
    let link = Link::open(server(Arc::default()));

    let resp = link
        .call(Command::request(ECHO, &b"hello courier"[..]))
        .await
        .unwrap();
    assert!(resp.is_response());
    assert_eq!(resp.code, codes::SUCCESS);
    assert_eq!(&resp.body[..], b"hello courier");
    assert!(link.client.correlation().is_empty());
}

#[tokio::test]
async fn concurrent_calls_are_matched_by_opaque() {
    let link = Link::open(server(Arc::default()));

    let calls = (0..32u8).map(|i| {
        let link = &link;
        async move {
            let resp = link
                .call(Command::request(ECHO, Bytes::from(vec![i])))
                .await
                .unwrap();
            (i, resp)
        }
    });

    for (i, resp) in futures::future::join_all(calls).await {
        assert_eq!(&resp.body[..], &[i]);
    }
}

#[tokio::test]
async fn handler_error_is_reported_to_caller() {
    let link = Link::open(server(Arc::default()));

    let resp = link
        .call(Command::request(BROKEN, &b"abc"[..]))
        .await
        .unwrap();
    assert_eq!(resp.code, codes::SYSTEM_ERROR);
    assert_eq!(resp.remark.as_deref(), Some("cannot handle 3 bytes"));
}

#[tokio::test]
async fn unsupported_code_is_reported_to_caller() {
    let link = Link::open(server(Arc::default()));

    let resp = link.call(Command::request(404, Bytes::new())).await.unwrap();
    assert_eq!(resp.code, codes::REQUEST_CODE_NOT_SUPPORTED);
}

#[tokio::test]
async fn unanswered_call_times_out() {
    let silent = Arc::new(Silent::default());
    let link = Link::open(server(silent.clone()));
    let _sweeper = link
        .client
        .correlation()
        .spawn_sweep_loop(Duration::from_millis(10));

    let err = link
        .call_with_timeout(Command::request(SILENT, Bytes::new()), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(err, CallError::Timeout(Duration::from_millis(50)));
    assert_eq!(silent.0.load(Ordering::SeqCst), 1);
    assert!(link.client.correlation().is_empty());
}

#[tokio::test]
async fn lost_connection_fails_pending_call() {
    let link = Link::open(server(Arc::default()));

    let (result, failed) = tokio::join!(
        link.call(Command::request(SILENT, Bytes::new())),
        async {
            eventually(|| !link.client.correlation().is_empty()).await;
            link.client.connection_closed(link.client_conn.id())
        }
    );

    assert_eq!(failed, 1);
    assert_eq!(
        result.unwrap_err(),
        CallError::ConnectionLost(link.client_conn.id())
    );
}

#[tokio::test]
async fn oneway_request_runs_without_reply() {
    let silent = Arc::new(Silent::default());
    let link = Link::open(server(silent.clone()));

    let mut fire = Command::request(ECHO, &b"ignored"[..]).with_opaque(900);
    fire.mark_oneway();
    link.client_conn.write(fire).unwrap();

    // A normal call afterwards still completes, and nothing is left over.
    let resp = link.call(Command::request(ECHO, Bytes::new())).await.unwrap();
    assert_eq!(resp.code, codes::SUCCESS);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(link.client.correlation().is_empty());
}
