//! Task queue between the ingestion handlers and the execution loop.
//!
//! Any number of [`TaskSender`] clones may append concurrently; exactly one
//! [`TaskReceiver`] drains the queue. Tasks from one sender keep their order.
//! Tasks from different senders interleave arbitrarily, but each is delivered
//! exactly once.
//!
//! The queue is unbounded unless a capacity is configured. With a capacity,
//! [`TaskSender::append`] waits for room instead of dropping or rejecting,
//! which pushes back on the producing connection.

use crate::task::Task;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// The execution loop is gone; nothing will ever dequeue this task.
#[derive(Debug, Error)]
#[error("Task queue is closed")]
pub struct QueueClosed(pub Task);

#[derive(Debug, Clone)]
enum Inner {
    Bounded(mpsc::Sender<Task>),
    Unbounded(mpsc::UnboundedSender<Task>),
}

/// Producer handle. Cheap to clone; one per connection.
#[derive(Debug, Clone)]
pub struct TaskSender {
    inner: Inner,
    appended: Arc<AtomicU64>,
}

/// The single consumer handle.
#[derive(Debug)]
pub enum TaskReceiver {
    /// Receiver for a queue with a capacity
    Bounded(mpsc::Receiver<Task>),
    /// Receiver for an unbounded queue
    Unbounded(mpsc::UnboundedReceiver<Task>),
}

/// Creates a queue. `None` means unbounded.
pub fn task_queue(capacity: Option<usize>) -> (TaskSender, TaskReceiver) {
    let appended = Arc::new(AtomicU64::new(0));
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (
                TaskSender {
                    inner: Inner::Bounded(tx),
                    appended,
                },
                TaskReceiver::Bounded(rx),
            )
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                TaskSender {
                    inner: Inner::Unbounded(tx),
                    appended,
                },
                TaskReceiver::Unbounded(rx),
            )
        }
    }
}

impl TaskSender {
    /// Appends a task, waiting for room if the queue is bounded and full.
    pub async fn append(&self, task: Task) -> Result<(), QueueClosed> {
        match &self.inner {
            Inner::Bounded(tx) => tx.send(task).await.map_err(|e| QueueClosed(e.0))?,
            Inner::Unbounded(tx) => tx.send(task).map_err(|e| QueueClosed(e.0))?,
        }
        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Total tasks appended through this sender and all its clones.
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    /// True once the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        match &self.inner {
            Inner::Bounded(tx) => tx.is_closed(),
            Inner::Unbounded(tx) => tx.is_closed(),
        }
    }
}

impl TaskReceiver {
    /// Waits for the next task. `None` once every sender is gone and the
    /// queue is empty.
    pub async fn take_next(&mut self) -> Option<Task> {
        match self {
            TaskReceiver::Bounded(rx) => rx.recv().await,
            TaskReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Takes a task only if one is ready.
    pub fn try_take(&mut self) -> Option<Task> {
        match self {
            TaskReceiver::Bounded(rx) => rx.try_recv().ok(),
            TaskReceiver::Unbounded(rx) => rx.try_recv().ok(),
        }
    }

    /// Number of tasks currently waiting.
    pub fn len(&self) -> usize {
        match self {
            TaskReceiver::Bounded(rx) => rx.len(),
            TaskReceiver::Unbounded(rx) => rx.len(),
        }
    }

    /// True when no task is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_per_producer() {
        let (tx, mut rx) = task_queue(None);
        for well in ["A1", "A2", "A3"] {
            tx.append(Task::move_to("P", well)).await.unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(task) = rx.take_next().await {
            seen.push(task);
        }
        assert_eq!(
            seen,
            vec![
                Task::move_to("P", "A1"),
                Task::move_to("P", "A2"),
                Task::move_to("P", "A3"),
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_producers_lose_nothing() {
        let (tx, mut rx) = task_queue(Some(4));
        let mut producers = Vec::new();
        for p in 0..8 {
            let tx = tx.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..50 {
                    tx.append(Task::move_to(format!("P{p}"), i.to_string()))
                        .await
                        .unwrap();
                }
            }));
        }
        drop(tx);

        let mut per_producer = vec![Vec::new(); 8];
        let mut total = 0;
        while let Some(task) = rx.take_next().await {
            if let Task::MoveToWell(m) = task {
                let p: usize = m.plate()[1..].parse().unwrap();
                per_producer[p].push(m.well().parse::<u32>().unwrap());
                total += 1;
            }
        }
        for p in producers {
            p.await.unwrap();
        }

        assert_eq!(total, 400);
        for wells in per_producer {
            assert_eq!(wells, (0..50).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_bounded_queue_blocks_producer() {
        let (tx, mut rx) = task_queue(Some(1));
        tx.append(Task::Null).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.append(Task::Null)).await;
        assert!(blocked.is_err(), "second append should wait for room");

        assert!(!rx.is_empty());
        assert_eq!(rx.try_take(), Some(Task::Null));
        assert!(rx.is_empty());
        tx.append(Task::Null).await.unwrap();
        assert_eq!(rx.len(), 1);
        assert_eq!(tx.appended(), 2);
    }

    #[tokio::test]
    async fn test_append_after_receiver_dropped() {
        let (tx, rx) = task_queue(None);
        drop(rx);
        assert!(tx.is_closed());
        let err = tx.append(Task::move_to("P", "A1")).await.unwrap_err();
        assert_eq!(err.0, Task::move_to("P", "A1"));
    }
}
