//! Core library for the liquid-handling arm controller.
//!
//! Tasks arrive over TCP (or are built locally), wait in a multi-producer
//! queue, and are executed one at a time by a single loop that owns the arm
//! state and writes motion commands to the hardware.
//!
//! ```text
//! client ─┐
//! client ─┼─> server (one handler per connection) ─> queue ─> executor ─> channel
//! client ─┘
//! ```

pub mod arm;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod queue;
pub mod resolver;
pub mod server;
pub mod task;
pub mod wire;

pub use arm::{ArmState, Coordinate};
pub use error::{AppResult, ArmError};
pub use task::{Task, TaskVisitor};
