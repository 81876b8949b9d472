//! Execution loop: the single consumer of the task queue.
//!
//! The loop owns the [`ArmState`] and the hardware [`CommandChannel`]; nothing
//! else writes to either. Each dequeued task runs to completion before the
//! next is taken.
//!
//! Failure policy:
//! - a resolution failure aborts only the current task; the loop logs it and
//!   moves on
//! - a command channel failure ends the pass with an error, leaving every
//!   task still queued where it is

use crate::arm::{ArmState, Coordinate};
use crate::channel::CommandChannel;
use crate::error::{ArmError, TaskError};
use crate::queue::TaskReceiver;
use crate::resolver::LocationResolver;
use crate::task::{ExecutionContext, Task};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Every command was written
    Completed,
    /// Aborted; the reason is kept for display
    Failed(String),
}

/// One executed task.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    /// The task as dequeued
    pub task: Task,
    /// How it ended
    pub outcome: TaskOutcome,
}

/// Counters for one execution pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Tasks that finished
    pub completed: u64,
    /// Tasks aborted by a resolution failure
    pub failed: u64,
    /// Motion commands written
    pub commands_written: u64,
}

/// Shared, read-only view of executed tasks.
///
/// Tasks are recorded once, after they run, and never re-executed.
#[derive(Debug, Clone, Default)]
pub struct ExecutionHistory {
    records: Arc<RwLock<Vec<ExecutionRecord>>>,
}

impl ExecutionHistory {
    /// Copy of every record so far, oldest first.
    pub fn snapshot(&self) -> Vec<ExecutionRecord> {
        self.records.read().clone()
    }

    /// Number of recorded tasks.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True before anything has run.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn push(&self, record: ExecutionRecord) {
        self.records.write().push(record);
    }
}

/// Dequeues and executes tasks, one at a time.
pub struct ExecutionLoop {
    arm: ArmState,
    resolver: Arc<dyn LocationResolver>,
    channel: Box<dyn CommandChannel>,
    positions: watch::Sender<Coordinate>,
    history: ExecutionHistory,
}

impl ExecutionLoop {
    /// Creates a loop with the arm at `home`.
    pub fn new(
        home: Coordinate,
        resolver: Arc<dyn LocationResolver>,
        channel: Box<dyn CommandChannel>,
    ) -> Self {
        let arm = ArmState::new(home);
        let (positions, _) = watch::channel(arm.position());
        Self {
            arm,
            resolver,
            channel,
            positions,
            history: ExecutionHistory::default(),
        }
    }

    /// Receives a consistent arm position after every committed move.
    pub fn subscribe(&self) -> watch::Receiver<Coordinate> {
        self.positions.subscribe()
    }

    /// Handle to the audit history.
    pub fn history(&self) -> ExecutionHistory {
        self.history.clone()
    }

    /// Current arm position.
    pub fn position(&self) -> Coordinate {
        self.arm.position()
    }

    /// Executes one task and records its outcome.
    ///
    /// Returns the number of commands written. A failed task is recorded as
    /// [`TaskOutcome::Failed`] and its error returned; moves that an aborted
    /// composite already sent stay committed.
    pub async fn execute(&mut self, task: Task) -> Result<usize, TaskError> {
        let mut ctx = ExecutionContext::new(&mut self.arm, &*self.resolver, &mut *self.channel)
            .with_position_updates(&self.positions);
        let result = task.execute(&mut ctx).await;
        let written = ctx.commands_written();

        let outcome = match &result {
            Ok(()) => TaskOutcome::Completed,
            Err(e) => TaskOutcome::Failed(e.to_string()),
        };
        self.history.push(ExecutionRecord { task, outcome });
        result.map(|()| written)
    }

    /// Drains `queue` until every producer is gone.
    ///
    /// A command channel failure stops the pass immediately and is returned;
    /// tasks still in `queue` are untouched.
    pub async fn run(&mut self, queue: &mut TaskReceiver) -> Result<ExecutionSummary, ArmError> {
        info!(position = %self.arm.position(), "Execution loop started");
        let mut summary = ExecutionSummary::default();

        while let Some(task) = queue.take_next().await {
            debug!(task = %task, "Executing task");
            match self.execute(task).await {
                Ok(written) => {
                    summary.completed += 1;
                    summary.commands_written += written as u64;
                    if queue.is_empty() {
                        debug!(completed = summary.completed, "Queue drained; waiting for tasks");
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, pending = queue.len(), "Command channel failed; stopping execution");
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(error = %e, "Task aborted");
                    summary.failed += 1;
                }
            }
        }

        info!(
            completed = summary.completed,
            failed = summary.failed,
            commands = summary.commands_written,
            position = %self.arm.position(),
            "Execution loop finished"
        );
        Ok(summary)
    }
}
