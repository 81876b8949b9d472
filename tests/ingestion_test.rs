//! Ingestion over real TCP connections: concurrency and fault isolation.

use liquid_arm::channel::RecordingChannel;
use liquid_arm::client::send_tasks;
use liquid_arm::config::ServerConfig;
use liquid_arm::executor::ExecutionLoop;
use liquid_arm::queue::task_queue;
use liquid_arm::resolver::{PlateLayout, PlateRegistry};
use liquid_arm::server::spawn_server;
use liquid_arm::wire::{encode_record, WireLimits};
use liquid_arm::{Coordinate, Task};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn ephemeral_server(max_connections: usize) -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1:0".to_string(),
        max_connections,
        ..ServerConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connections_lose_nothing() {
    const CONNECTIONS: usize = 8;
    const TASKS_PER_CONNECTION: usize = 25;

    let (sender, mut receiver) = task_queue(None);
    let (addr, shutdown, server) =
        spawn_server(&ephemeral_server(4), WireLimits::default(), sender)
            .await
            .unwrap();
    let addr = addr.to_string();

    let mut clients = Vec::new();
    for c in 0..CONNECTIONS {
        let addr = addr.clone();
        clients.push(tokio::spawn(async move {
            let tasks: Vec<Task> = (0..TASKS_PER_CONNECTION)
                .map(|i| Task::move_to(format!("C{c}"), i.to_string()))
                .collect();
            send_tasks(&addr, &tasks).await.unwrap()
        }));
    }
    for client in clients {
        assert_eq!(client.await.unwrap(), TASKS_PER_CONNECTION);
    }

    // Clients beyond the pool size may still sit in the accept backlog, so
    // collect everything before stopping the listener.
    let mut per_connection: HashMap<String, Vec<usize>> = HashMap::new();
    let expected = CONNECTIONS * TASKS_PER_CONNECTION;
    let drained = tokio::time::timeout(TEST_TIMEOUT, async {
        for _ in 0..expected {
            if let Some(Task::MoveToWell(m)) = receiver.take_next().await {
                per_connection
                    .entry(m.plate().to_string())
                    .or_default()
                    .push(m.well().parse().unwrap());
            }
        }
    })
    .await;
    assert!(drained.is_ok(), "not every task arrived");

    shutdown.send(()).unwrap();
    server.await.unwrap();
    let rest = tokio::time::timeout(TEST_TIMEOUT, receiver.take_next()).await;
    assert_eq!(rest.unwrap(), None, "duplicate task delivered");

    assert_eq!(per_connection.len(), CONNECTIONS);
    let total: usize = per_connection.values().map(Vec::len).sum();
    assert_eq!(total, CONNECTIONS * TASKS_PER_CONNECTION);
    for wells in per_connection.values() {
        assert_eq!(*wells, (0..TASKS_PER_CONNECTION).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_malformed_connection_is_isolated() {
    let registry = Arc::new(PlateRegistry::from_layouts([PlateLayout {
        name: "PlateA".to_string(),
        origin_x: 0.0,
        origin_y: 0.0,
        rows: 8,
        columns: 12,
        pitch_x: 1.0,
        pitch_y: 1.0,
    }]));
    let recorder = RecordingChannel::new();
    let mut executor = ExecutionLoop::new(
        Coordinate::new(0.0, 0.0),
        registry,
        Box::new(recorder.clone()),
    );

    let (sender, mut receiver) = task_queue(None);
    let (addr, shutdown, server) =
        spawn_server(&ephemeral_server(8), WireLimits::default(), sender)
            .await
            .unwrap();
    let mut positions = executor.subscribe();
    let execution = tokio::spawn(async move {
        let summary = executor.run(&mut receiver).await;
        (summary, executor.position())
    });

    // Both connections are open before either sends anything.
    let mut bad = TcpStream::connect(addr).await.unwrap();
    let mut good = TcpStream::connect(addr).await.unwrap();

    let mut payload = encode_record(&Task::move_to("PlateA", "A5")).unwrap();
    payload.extend_from_slice(br#"{"type":"self_destruct"}"#);
    payload.extend_from_slice(&encode_record(&Task::move_to("PlateA", "H12")).unwrap());
    bad.write_all(&payload).await.unwrap();

    // The server drops the bad connection: EOF or a reset.
    let mut buf = [0u8; 16];
    let closed = tokio::time::timeout(TEST_TIMEOUT, bad.read(&mut buf))
        .await
        .expect("bad connection was not closed");
    assert!(matches!(closed, Ok(0) | Err(_)));

    // The good connection keeps working after its neighbour was closed.
    for well in ["A2", "A3"] {
        good.write_all(&encode_record(&Task::move_to("PlateA", well)).unwrap())
            .await
            .unwrap();
    }
    good.shutdown().await.unwrap();
    drop(good);

    tokio::time::timeout(TEST_TIMEOUT, positions.wait_for(|p| *p == Coordinate::new(2.0, 0.0)))
        .await
        .expect("good connection's tasks were not executed")
        .unwrap();

    shutdown.send(()).unwrap();
    server.await.unwrap();

    let (summary, position) = tokio::time::timeout(TEST_TIMEOUT, execution)
        .await
        .expect("execution loop did not finish")
        .unwrap();
    let summary = summary.unwrap();

    assert_eq!(summary.completed, 3);
    assert_eq!(
        recorder.lines(),
        vec![
            "move(-4.00,0.00)".to_string(),
            "move(3.00,0.00)".to_string(),
            "move(-1.00,0.00)".to_string(),
        ]
    );
    assert_eq!(position, Coordinate::new(2.0, 0.0));
}

#[tokio::test]
async fn test_connections_beyond_pool_wait_their_turn() {
    let (sender, mut receiver) = task_queue(None);
    let (addr, shutdown, server) =
        spawn_server(&ephemeral_server(1), WireLimits::default(), sender)
            .await
            .unwrap();

    // Holds the only slot without sending a full record.
    let mut first = TcpStream::connect(addr).await.unwrap();
    first.write_all(br#"{"type":"#).await.unwrap();

    let second = tokio::spawn(async move {
        send_tasks(&addr.to_string(), &[Task::Null]).await.unwrap();
    });
    second.await.unwrap();

    let early = tokio::time::timeout(Duration::from_millis(200), receiver.take_next()).await;
    assert!(early.is_err(), "second connection was served while the pool was full");

    first.write_all(br#""null"}"#).await.unwrap();
    first.shutdown().await.unwrap();

    let a = tokio::time::timeout(TEST_TIMEOUT, receiver.take_next()).await.unwrap();
    let b = tokio::time::timeout(TEST_TIMEOUT, receiver.take_next()).await.unwrap();
    assert_eq!(a, Some(Task::Null));
    assert_eq!(b, Some(Task::Null));

    shutdown.send(()).unwrap();
    server.await.unwrap();
}
