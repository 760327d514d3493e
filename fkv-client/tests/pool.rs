mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use fkv_client::{ConnectionPool, PoolConfig, Request, TransportError, TransportResult};

use support::{hold_open, read_frame, FakeServer};

fn pool_config(connections: usize, highwatermark: usize) -> PoolConfig {
    PoolConfig {
        connections,
        highwatermark,
        ..PoolConfig::default()
    }
}

fn recorded(payload: &'static [u8]) -> (Request, mpsc::UnboundedReceiver<TransportResult<Bytes>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let request = Request::new(payload, -1, move |result| {
        let _ = tx.send(result);
    });
    (request, rx)
}

async fn next_outcome(outcomes: &mut mpsc::UnboundedReceiver<TransportResult<Bytes>>) -> TransportResult<Bytes> {
    tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
        .await
        .expect("handler invoked in time")
        .expect("handler result")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn serves_concurrent_requests_over_few_connections() {
    let server = FakeServer::echo();
    let pool = Arc::new(ConnectionPool::new(vec![server.addr], pool_config(4, 64)).expect("pool"));

    let mut tasks = Vec::new();
    for i in 0..100 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let payload = format!("message-{i}");
            let response = pool
                .send(payload.clone(), Some(Duration::from_secs(5)))
                .await
                .expect("response");
            assert_eq!(&response[..], payload.as_bytes());
        }));
    }
    for task in tasks {
        task.await.expect("task");
    }

    assert!(server.accepted() <= 4);
    let pool = Arc::try_unwrap(pool).expect("sole owner");
    assert_eq!(pool.outstanding(), 0);
    pool.close().await;
}

#[tokio::test]
async fn try_submit_applies_backpressure() {
    let server = FakeServer::spawn(|_, mut stream| {
        let _ = read_frame(&mut stream);
        hold_open(stream);
    });
    let pool = ConnectionPool::new(vec![server.addr], pool_config(1, 2)).expect("pool");

    let (first, mut first_outcomes) = recorded(b"in flight");
    let (second, mut second_outcomes) = recorded(b"queued");
    let (third, mut third_outcomes) = recorded(b"rejected");
    pool.try_submit(first);
    pool.try_submit(second);
    pool.try_submit(third);

    assert!(matches!(next_outcome(&mut third_outcomes).await, Err(TransportError::Backpressure)));
    assert_eq!(pool.outstanding(), 2);

    pool.close().await;
    assert!(matches!(next_outcome(&mut first_outcomes).await, Err(TransportError::Shutdown)));
    assert!(matches!(next_outcome(&mut second_outcomes).await, Err(TransportError::Shutdown)));
}

#[tokio::test]
async fn submit_waits_for_a_free_slot() {
    let server = FakeServer::echo();
    let pool = ConnectionPool::new(vec![server.addr], pool_config(1, 1)).expect("pool");

    let (first, mut first_outcomes) = recorded(b"first");
    let (second, mut second_outcomes) = recorded(b"second");
    pool.submit(first).await;
    tokio::time::timeout(Duration::from_secs(5), pool.submit(second))
        .await
        .expect("slot frees up");

    assert_eq!(&next_outcome(&mut first_outcomes).await.expect("first")[..], b"first");
    assert_eq!(&next_outcome(&mut second_outcomes).await.expect("second")[..], b"second");
    pool.close().await;
}

#[tokio::test]
async fn connect_resolves_host_name() {
    let server = FakeServer::echo();
    let pool = ConnectionPool::connect("127.0.0.1", server.addr.port(), pool_config(2, 8))
        .await
        .expect("pool");

    let response = pool.send("resolved", None).await.expect("response");
    assert_eq!(&response[..], b"resolved");
    pool.close().await;
}

#[tokio::test]
async fn panicking_handler_does_not_strand_its_connection() {
    let server = FakeServer::echo();
    let pool = ConnectionPool::new(vec![server.addr], pool_config(1, 4)).expect("pool");

    let (tx, mut outcomes) = mpsc::unbounded_channel();
    pool.submit(Request::new(&b"boom"[..], -1, move |result: TransportResult<Bytes>| {
        let _ = tx.send(result);
        panic!("handler failure");
    }))
    .await;
    assert_eq!(&next_outcome(&mut outcomes).await.expect("response")[..], b"boom");

    for round in 0..3 {
        let payload = format!("after-{round}");
        let response = tokio::time::timeout(Duration::from_secs(5), pool.send(payload.clone(), None))
            .await
            .expect("served in time")
            .expect("response");
        assert_eq!(&response[..], payload.as_bytes());
    }
    assert_eq!(server.accepted(), 2);
    assert_eq!(pool.outstanding(), 0);
    pool.close().await;
}
