//! Submitting tasks to a running ingestion server.

use crate::error::{AppResult, ConnectionError, WireError};
use crate::task::Task;
use crate::wire::{decode_value, write_task, WireLimits};
use serde_json::Value;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Connects to `addr` and streams `tasks` as wire records, then closes the
/// write side. Returns how many records were sent.
pub async fn send_tasks(addr: &str, tasks: &[Task]) -> AppResult<usize> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ConnectionError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    info!(addr, count = tasks.len(), "Sending tasks");

    for task in tasks {
        write_task(&mut stream, task).await?;
        debug!(task = %task, "Sent task");
    }
    stream.flush().await.map_err(ConnectionError::Io)?;
    stream.shutdown().await.map_err(ConnectionError::Io)?;
    Ok(tasks.len())
}

/// Parses task records from JSON text: either one record or an array of them.
pub fn parse_tasks(text: &str, limits: &WireLimits) -> Result<Vec<Task>, WireError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Array(records) => records
            .into_iter()
            .map(|record| decode_value(record, limits))
            .collect(),
        record => Ok(vec![decode_value(record, limits)?]),
    }
}

/// Reads a task file for [`send_tasks`].
pub async fn load_task_file<P: AsRef<Path>>(path: P) -> AppResult<Vec<Task>> {
    let text = tokio::fs::read_to_string(path.as_ref()).await?;
    Ok(parse_tasks(&text, &WireLimits::default())?)
}
