//! Task model: the closed set of things the arm can be told to do.
//!
//! A [`Task`] is one of three variants:
//!
//! - [`MoveToWell`]: travel to a named well on a named plate. The well is
//!   resolved to a coordinate only when the task executes.
//! - `Null`: does nothing and emits nothing.
//! - [`MultiTask`]: an ordered list of child tasks, executed in order and
//!   aborted at the first failing child.
//!
//! Cross-cutting operations (wire encoding, tree labels, painting) are
//! written as [`TaskVisitor`] implementations. Adding an operation means
//! writing a visitor; adding a variant means the compiler points at every
//! visitor that has to learn about it.

pub mod visitors;

use crate::arm::{ArmState, Coordinate};
use crate::channel::{CommandChannel, MoveCommand};
use crate::error::{EditError, TaskError};
use crate::resolver::LocationResolver;
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::str::FromStr;
use tokio::sync::watch;
use tracing::debug;

/// One unit of work for the arm.
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    /// Move to a well
    MoveToWell(MoveToWell),
    /// Do nothing
    Null,
    /// Ordered group of tasks
    Multi(MultiTask),
}

/// Operation over every task variant.
///
/// Extra inputs live on the visitor itself; the result type is chosen per
/// visitor.
pub trait TaskVisitor {
    /// Result of visiting one task.
    type Output;

    /// Handles a move task.
    fn visit_move_to_well(&mut self, task: &MoveToWell) -> Self::Output;

    /// Handles the null task.
    fn visit_null(&mut self) -> Self::Output;

    /// Handles a composite. The visitor decides whether and how to recurse.
    fn visit_multi(&mut self, task: &MultiTask) -> Self::Output;
}

/// Everything a task needs while it runs.
///
/// Held only by the execution loop, which is the single writer of the arm
/// state.
pub struct ExecutionContext<'a> {
    arm: &'a mut ArmState,
    resolver: &'a dyn LocationResolver,
    channel: &'a mut dyn CommandChannel,
    positions: Option<&'a watch::Sender<Coordinate>>,
    commands_written: usize,
}

impl<'a> ExecutionContext<'a> {
    /// Creates a context over the given arm, resolver and command channel.
    pub fn new(
        arm: &'a mut ArmState,
        resolver: &'a dyn LocationResolver,
        channel: &'a mut dyn CommandChannel,
    ) -> Self {
        Self {
            arm,
            resolver,
            channel,
            positions: None,
            commands_written: 0,
        }
    }

    /// Publishes every committed position to `positions`.
    pub fn with_position_updates(mut self, positions: &'a watch::Sender<Coordinate>) -> Self {
        self.positions = Some(positions);
        self
    }

    /// Commands written through this context so far.
    pub fn commands_written(&self) -> usize {
        self.commands_written
    }

    /// Current arm position.
    pub fn position(&self) -> Coordinate {
        self.arm.position()
    }
}

impl Task {
    /// Shorthand for a move task.
    pub fn move_to(plate: impl Into<String>, well: impl Into<String>) -> Self {
        Task::MoveToWell(MoveToWell::new(plate, well))
    }

    /// Shorthand for a composite.
    pub fn multi(children: impl IntoIterator<Item = Task>) -> Self {
        Task::Multi(MultiTask::from_children(children))
    }

    /// Invokes the visitor case matching this task's variant.
    pub fn dispatch<V: TaskVisitor + ?Sized>(&self, visitor: &mut V) -> V::Output {
        match self {
            Task::MoveToWell(task) => visitor.visit_move_to_well(task),
            Task::Null => visitor.visit_null(),
            Task::Multi(task) => visitor.visit_multi(task),
        }
    }

    /// Runs the task against the arm.
    ///
    /// Composites stop at the first failing child; moves already sent by
    /// earlier children stay committed.
    pub fn execute<'t, 'c>(
        &'t self,
        ctx: &'t mut ExecutionContext<'c>,
    ) -> BoxFuture<'t, Result<(), TaskError>>
    where
        'c: 't,
    {
        async move {
            match self {
                Task::MoveToWell(task) => task.execute(ctx).await,
                Task::Null => Ok(()),
                Task::Multi(task) => {
                    for child in task.children() {
                        child.execute(ctx).await?;
                    }
                    Ok(())
                }
            }
        }
        .boxed()
    }

    /// Number of leaf tasks (moves and nulls) contained in this task.
    pub fn leaf_count(&self) -> usize {
        match self {
            Task::MoveToWell(_) | Task::Null => 1,
            Task::Multi(task) => task.children().iter().map(Task::leaf_count).sum(),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::MoveToWell(task) => task.fmt(f),
            Task::Null => f.write_str("Null task"),
            Task::Multi(task) => write!(f, "Multi task ({})", task.len()),
        }
    }
}

/// Move the arm to a well, resolved at execution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveToWell {
    plate: String,
    well: String,
}

impl MoveToWell {
    /// Creates a move to `well` on `plate`.
    pub fn new(plate: impl Into<String>, well: impl Into<String>) -> Self {
        Self {
            plate: plate.into(),
            well: well.into(),
        }
    }

    /// Target plate name.
    pub fn plate(&self) -> &str {
        &self.plate
    }

    /// Target well identifier.
    pub fn well(&self) -> &str {
        &self.well
    }

    /// Updates plate and well from editing text `"<plate>, <well>"`.
    ///
    /// On error the task is left as it was.
    pub fn set_from_text(&mut self, text: &str) -> Result<(), EditError> {
        *self = text.parse()?;
        Ok(())
    }

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), TaskError> {
        let destination = ctx.resolver.resolve(&self.plate, &self.well)?;
        let delta = ctx.arm.delta_to(destination);
        let command = MoveCommand::from_delta(delta);

        ctx.channel.write_command(&command).await?;

        ctx.arm.apply_delta(delta);
        ctx.commands_written += 1;
        if let Some(positions) = ctx.positions {
            positions.send_replace(ctx.arm.position());
        }
        debug!(
            plate = %self.plate,
            well = %self.well,
            dx = delta.x,
            dy = delta.y,
            position = %ctx.arm.position(),
            "Move committed"
        );
        Ok(())
    }
}

impl FromStr for MoveToWell {
    type Err = EditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        match parts.as_slice() {
            [plate, well] if !plate.is_empty() && !well.is_empty() => {
                Ok(MoveToWell::new(*plate, *well))
            }
            _ => Err(EditError::Format(s.to_string())),
        }
    }
}

impl fmt::Display for MoveToWell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Move to: plate = {}, well = {}", self.plate, self.well)
    }
}

/// Ordered composite of tasks. Owns its children exclusively.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultiTask {
    children: Vec<Task>,
}

impl MultiTask {
    /// Creates an empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a composite from children in the given order.
    pub fn from_children(children: impl IntoIterator<Item = Task>) -> Self {
        Self {
            children: children.into_iter().collect(),
        }
    }

    /// Children in execution order.
    pub fn children(&self) -> &[Task] {
        &self.children
    }

    /// Appends a child at the end.
    pub fn push(&mut self, task: Task) {
        self.children.push(task);
    }

    /// Inserts a child at `index`, clamped to the end.
    pub fn insert(&mut self, index: usize, task: Task) {
        let index = index.min(self.children.len());
        self.children.insert(index, task);
    }

    /// Removes and returns the child at `index`.
    pub fn remove(&mut self, index: usize) -> Option<Task> {
        (index < self.children.len()).then(|| self.children.remove(index))
    }

    /// Number of direct children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// True when there are no children.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}
