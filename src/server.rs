//! TCP ingestion server.
//!
//! Every accepted connection gets its own handling unit: a spawned task that
//! reads wire records, turns them into [`Task`]s and appends them to the
//! queue. A unit ends when its peer closes the stream, a record cannot be
//! decoded, or the socket fails. None of those outcomes reach the listener or
//! any other connection.
//!
//! At most `max_connections` units run at once. The accept loop waits for a
//! free slot before taking the next connection off the listen backlog.
//!
//! [`Task`]: crate::task::Task

use crate::config::ServerConfig;
use crate::error::{AppResult, ArmError, ConnectionError};
use crate::queue::TaskSender;
use crate::wire::{RecordReader, WireLimits};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// First pause after a failed accept; doubles per consecutive failure.
const ACCEPT_RETRY_BASE: Duration = Duration::from_millis(10);

/// Longest pause between accept retries.
const ACCEPT_RETRY_MAX: Duration = Duration::from_secs(1);

/// Pause before retrying after `consecutive_failures` failed accepts.
fn accept_backoff(consecutive_failures: u32) -> Duration {
    let shift = consecutive_failures.saturating_sub(1).min(16);
    ACCEPT_RETRY_BASE
        .saturating_mul(1 << shift)
        .min(ACCEPT_RETRY_MAX)
}

/// Lifecycle of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting in the accept loop
    Listening,
    /// Accepted, handling unit spawned
    Connected,
    /// Reading task records
    Reading,
    /// Stream ended or failed; the unit is done
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Listening => "listening",
            ConnectionState::Connected => "connected",
            ConnectionState::Reading => "reading",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a handling unit stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the stream after a complete record
    EndOfStream,
    /// A record could not be decoded
    Malformed,
    /// Socket I/O failed
    ConnectionFailed,
    /// The execution loop is gone
    QueueClosed,
}

/// Result of one connection's handling unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionReport {
    /// Tasks appended to the queue
    pub tasks_enqueued: u64,
    /// Why the unit stopped
    pub reason: CloseReason,
}

/// Listens for task producers and feeds the task queue.
pub struct IngestionServer {
    listener: TcpListener,
    sender: TaskSender,
    limits: WireLimits,
    max_connections: usize,
    next_id: AtomicU64,
}

impl IngestionServer {
    /// Binds the listening socket.
    pub async fn bind(
        config: &ServerConfig,
        limits: WireLimits,
        sender: TaskSender,
    ) -> Result<Self, ConnectionError> {
        let listener = TcpListener::bind(&config.bind)
            .await
            .map_err(|source| ConnectionError::Bind {
                addr: config.bind.clone(),
                source,
            })?;
        info!(addr = %config.bind, "Ingestion server listening");

        Ok(Self {
            listener,
            sender,
            limits,
            max_connections: config.max_connections.max(1),
            next_id: AtomicU64::new(1),
        })
    }

    /// Address actually bound; useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, ConnectionError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` fires (or its sender is dropped).
    ///
    /// Handling units already running are left to finish on their own.
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        let permits = Arc::new(Semaphore::new(self.max_connections));
        let mut accept_failures = 0u32;

        loop {
            debug!(state = %ConnectionState::Listening, "Waiting for a connection slot");
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => {
                        accept_failures = 0;
                        accepted
                    }
                    Err(e) => {
                        // EMFILE and friends persist; don't spin on them
                        accept_failures = accept_failures.saturating_add(1);
                        let delay = accept_backoff(accept_failures);
                        warn!(
                            error = %ConnectionError::Accept(e),
                            retry_in_ms = delay.as_millis() as u64,
                            "Accept failed"
                        );
                        tokio::select! {
                            _ = &mut shutdown => break,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                },
            };

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let sender = self.sender.clone();
            let limits = self.limits;
            let span = info_span!("connection", id, %peer);

            tokio::spawn(
                async move {
                    let _permit = permit;
                    debug!(state = %ConnectionState::Connected, "Accepted connection");
                    let report = handle_connection(stream, sender, limits).await;
                    info!(
                        tasks = report.tasks_enqueued,
                        reason = ?report.reason,
                        "Connection closed"
                    );
                }
                .instrument(span),
            );
        }

        info!("Ingestion server stopped accepting connections");
    }
}

/// Reads task records from `reader` and appends them to the queue until the
/// stream ends or fails.
///
/// Decode failures are logged at `warn` and close only this connection.
pub async fn handle_connection<R>(
    reader: R,
    sender: TaskSender,
    limits: WireLimits,
) -> ConnectionReport
where
    R: AsyncRead + Unpin,
{
    let mut records = RecordReader::new(reader, limits);
    let mut tasks_enqueued = 0;
    debug!(state = %ConnectionState::Reading, "Reading task records");

    let reason = loop {
        match records.next_task().await {
            Ok(Some(task)) => {
                debug!(task = %task, "Received task");
                if sender.append(task).await.is_err() {
                    error!("Task queue closed; dropping connection");
                    break CloseReason::QueueClosed;
                }
                tasks_enqueued += 1;
            }
            Ok(None) => break CloseReason::EndOfStream,
            Err(ArmError::Wire(e)) => {
                warn!(error = %e, "Rejecting malformed task record");
                break CloseReason::Malformed;
            }
            Err(e) => {
                warn!(error = %e, "Connection failed");
                break CloseReason::ConnectionFailed;
            }
        }
    };

    debug!(state = %ConnectionState::Closed, tasks = tasks_enqueued, "Handling unit finished");
    ConnectionReport {
        tasks_enqueued,
        reason,
    }
}

/// Binds and runs a server in the background, returning its address and the
/// shutdown trigger.
pub async fn spawn_server(
    config: &ServerConfig,
    limits: WireLimits,
    sender: TaskSender,
) -> AppResult<(SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>)> {
    let server = IngestionServer::bind(config, limits, sender).await?;
    let addr = server.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(server.run(shutdown_rx));
    Ok((addr, shutdown_tx, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::task_queue;
    use crate::task::Task;
    use tokio::io::AsyncWriteExt;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn test_handle_connection_reads_until_eof() {
        let stream = tokio_test::io::Builder::new()
            .read(br#"{"type":"move_to_well","plate":"P","well":"A1"}"#)
            .read(br#" {"type":"null"}{"type":"multi","tas"#)
            .read(br#"ks":[{"type":"null"}]}"#)
            .build();
        let (tx, mut rx) = task_queue(None);

        let report = handle_connection(stream, tx, WireLimits::default()).await;

        assert_eq!(report.reason, CloseReason::EndOfStream);
        assert_eq!(report.tasks_enqueued, 3);
        assert_eq!(rx.try_take(), Some(Task::move_to("P", "A1")));
        assert_eq!(rx.try_take(), Some(Task::Null));
        assert_eq!(rx.try_take(), Some(Task::multi([Task::Null])));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_handle_connection_stops_at_unknown_tag() {
        let stream = tokio_test::io::Builder::new()
            .read(br#"{"type":"null"}{"type":"teleport","x":1}{"type":"null"}"#)
            .build();
        let (tx, mut rx) = task_queue(None);

        let report = handle_connection(stream, tx, WireLimits::default()).await;

        assert_eq!(report.reason, CloseReason::Malformed);
        assert_eq!(report.tasks_enqueued, 1);
        assert_eq!(rx.try_take(), Some(Task::Null));
        assert!(rx.try_take().is_none());
        assert!(logs_contain("Rejecting malformed task record"));
    }

    #[tokio::test]
    async fn test_handle_connection_read_error() {
        let stream = tokio_test::io::Builder::new()
            .read(br#"{"type":"null"}"#)
            .read_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "peer reset",
            ))
            .build();
        let (tx, rx) = task_queue(None);

        let report = handle_connection(stream, tx, WireLimits::default()).await;

        assert_eq!(report.reason, CloseReason::ConnectionFailed);
        assert_eq!(report.tasks_enqueued, 1);
        assert_eq!(rx.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_connection_truncated_record() {
        let stream = tokio_test::io::Builder::new()
            .read(br#"{"type":"null"}{"type":"nu"#)
            .build();
        let (tx, _rx) = task_queue(None);

        let report = handle_connection(stream, tx, WireLimits::default()).await;
        assert_eq!(report.reason, CloseReason::Malformed);
        assert_eq!(report.tasks_enqueued, 1);
    }

    #[tokio::test]
    async fn test_handle_connection_queue_closed() {
        let stream = tokio_test::io::Builder::new()
            .read(br#"{"type":"null"}"#)
            .build();
        let (tx, rx) = task_queue(None);
        drop(rx);

        let report = handle_connection(stream, tx, WireLimits::default()).await;
        assert_eq!(report.reason, CloseReason::QueueClosed);
        assert_eq!(report.tasks_enqueued, 0);
    }

    fn ephemeral() -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_server_accepts_and_shuts_down() {
        let (tx, mut rx) = task_queue(None);
        let (addr, shutdown, handle) = spawn_server(&ephemeral(), WireLimits::default(), tx)
            .await
            .unwrap();

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client
            .write_all(br#"{"version":1,"type":"move_to_well","plate":"P","well":"B2"}"#)
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(rx.take_next().await, Some(Task::move_to("P", "B2")));

        shutdown.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let (tx, _rx) = task_queue(None);
        let config = ServerConfig {
            bind: "not-an-address".to_string(),
            ..ServerConfig::default()
        };
        let result = IngestionServer::bind(&config, WireLimits::default(), tx).await;
        assert!(matches!(result, Err(ConnectionError::Bind { .. })));
    }

    #[test]
    fn test_accept_backoff_grows_and_caps() {
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert_eq!(accept_backoff(2), Duration::from_millis(20));
        assert_eq!(accept_backoff(4), Duration::from_millis(80));
        assert_eq!(accept_backoff(8), ACCEPT_RETRY_MAX);
        assert_eq!(accept_backoff(u32::MAX), ACCEPT_RETRY_MAX);
        assert!(accept_backoff(0) > Duration::ZERO);
    }
}
