//! Hardware command channel.
//!
//! Motion commands are short text lines, `move(<dx>,<dy>)`, written to a
//! byte stream that ends at the arm's controller (serial port, device node,
//! file or stdout). Each command is written in one buffered write and flushed
//! before the next one starts, so two commands never interleave.

use crate::arm::Coordinate;
use crate::config::HardwareConfig;
use crate::error::CommandChannelError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Default command terminator expected by the controller.
pub const DEFAULT_LINE_TERMINATOR: &str = "\r\n";

/// A relative move, already rounded to two decimals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveCommand {
    /// Relative X travel (cm)
    pub dx: f64,
    /// Relative Y travel (cm)
    pub dy: f64,
}

impl MoveCommand {
    /// Builds a command from a rounded delta.
    pub fn from_delta(delta: Coordinate) -> Self {
        Self {
            dx: delta.x,
            dy: delta.y,
        }
    }
}

impl fmt::Display for MoveCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "move({:.2},{:.2})",
            positive_zero(self.dx),
            positive_zero(self.dy)
        )
    }
}

fn positive_zero(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

/// Output path to the arm controller.
#[async_trait]
pub trait CommandChannel: Send {
    /// Writes one command as an indivisible unit.
    async fn write_command(&mut self, command: &MoveCommand) -> Result<(), CommandChannelError>;
}

#[async_trait]
impl<C: CommandChannel + ?Sized> CommandChannel for Box<C> {
    async fn write_command(&mut self, command: &MoveCommand) -> Result<(), CommandChannelError> {
        (**self).write_command(command).await
    }
}

/// Line-oriented channel over any async byte sink.
pub struct LineChannel<W> {
    writer: W,
    line_terminator: String,
}

impl<W> LineChannel<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Wraps `writer`, terminating each command with `"\r\n"`.
    pub fn new(writer: W) -> Self {
        Self::with_line_terminator(writer, DEFAULT_LINE_TERMINATOR)
    }

    /// Wraps `writer` with a custom command terminator.
    pub fn with_line_terminator(writer: W, line_terminator: impl Into<String>) -> Self {
        Self {
            writer,
            line_terminator: line_terminator.into(),
        }
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> CommandChannel for LineChannel<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_command(&mut self, command: &MoveCommand) -> Result<(), CommandChannelError> {
        let text = command.to_string();
        let line = format!("{}{}", text, self.line_terminator);

        let result = async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.flush().await
        }
        .await;

        result.map_err(|source| CommandChannelError::Write {
            command: text.clone(),
            source,
        })?;
        debug!(command = %text, "Sent motion command");
        Ok(())
    }
}

/// In-memory channel that records every command it is given.
///
/// Used for dry runs and tests. Clones share the same log.
#[derive(Clone, Default)]
pub struct RecordingChannel {
    lines: Arc<Mutex<Vec<String>>>,
    fail_next: Arc<AtomicBool>,
}

impl RecordingChannel {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next write fail with a broken-pipe error.
    pub fn inject_next_failure(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Commands written so far, without terminators.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Forgets recorded commands.
    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

#[async_trait]
impl CommandChannel for RecordingChannel {
    async fn write_command(&mut self, command: &MoveCommand) -> Result<(), CommandChannelError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CommandChannelError::Write {
                command: command.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "injected failure"),
            });
        }
        let text = command.to_string();
        debug!(command = %text, "Recorded motion command");
        self.lines.lock().push(text);
        Ok(())
    }
}

/// Opens the command output described by `config`.
///
/// `"stdout"` writes to standard output. Any other value is a path that is
/// opened for appending (created if missing), or opened as a serial port when
/// `config.serial` is set.
pub async fn open_output(
    config: &HardwareConfig,
) -> Result<Box<dyn CommandChannel>, CommandChannelError> {
    let terminator = config.line_terminator.clone();
    if config.output == "stdout" {
        info!("Writing motion commands to stdout");
        return Ok(Box::new(LineChannel::with_line_terminator(
            tokio::io::stdout(),
            terminator,
        )));
    }

    if config.serial {
        return open_serial(config);
    }

    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.output)
        .await
        .map_err(|source| CommandChannelError::Open {
            target: config.output.clone(),
            source,
        })?;
    info!(output = %config.output, "Writing motion commands to file");
    Ok(Box::new(LineChannel::with_line_terminator(file, terminator)))
}

#[cfg(feature = "serial")]
fn open_serial(config: &HardwareConfig) -> Result<Box<dyn CommandChannel>, CommandChannelError> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(&config.output, config.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| CommandChannelError::Open {
            target: config.output.clone(),
            source: e.into(),
        })?;
    info!(port = %config.output, baud = config.baud_rate, "Opened serial command port");
    Ok(Box::new(LineChannel::with_line_terminator(
        port,
        config.line_terminator.clone(),
    )))
}

#[cfg(not(feature = "serial"))]
fn open_serial(config: &HardwareConfig) -> Result<Box<dyn CommandChannel>, CommandChannelError> {
    Err(CommandChannelError::Open {
        target: config.output.clone(),
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "serial output requires the `serial` feature",
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_format() {
        let cmd = MoveCommand { dx: -2.35, dy: 0.0 };
        assert_eq!(cmd.to_string(), "move(-2.35,0.00)");

        let cmd = MoveCommand { dx: 3.1, dy: -0.0 };
        assert_eq!(cmd.to_string(), "move(3.10,0.00)");
    }

    #[tokio::test]
    async fn test_line_channel_writes_terminated_lines() {
        let mut channel = LineChannel::new(Vec::new());
        channel
            .write_command(&MoveCommand { dx: 1.0, dy: 2.5 })
            .await
            .unwrap();
        channel
            .write_command(&MoveCommand { dx: -0.01, dy: 0.0 })
            .await
            .unwrap();

        let written = String::from_utf8(channel.into_inner()).unwrap();
        assert_eq!(written, "move(1.00,2.50)\r\nmove(-0.01,0.00)\r\n");
    }

    #[tokio::test]
    async fn test_line_channel_custom_terminator() {
        let mut channel = LineChannel::with_line_terminator(Vec::new(), "\n");
        channel
            .write_command(&MoveCommand { dx: 0.5, dy: 0.5 })
            .await
            .unwrap();
        assert_eq!(channel.into_inner(), b"move(0.50,0.50)\n".to_vec());
    }

    #[tokio::test]
    async fn test_line_channel_reports_write_failure() {
        let writer = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "controller unplugged",
            ))
            .build();
        let mut channel = LineChannel::new(writer);

        let err = channel
            .write_command(&MoveCommand { dx: 1.0, dy: 1.0 })
            .await
            .unwrap_err();
        assert!(matches!(err, CommandChannelError::Write { .. }));
        assert!(err.to_string().contains("move(1.00,1.00)"));
    }

    #[tokio::test]
    async fn test_recording_channel_failure_injection() {
        let mut channel = RecordingChannel::new();
        let observer = channel.clone();

        channel.inject_next_failure();
        assert!(channel
            .write_command(&MoveCommand { dx: 1.0, dy: 0.0 })
            .await
            .is_err());
        channel
            .write_command(&MoveCommand { dx: 2.0, dy: 0.0 })
            .await
            .unwrap();

        assert_eq!(observer.lines(), vec!["move(2.00,0.00)".to_string()]);

        observer.clear();
        assert!(channel.lines().is_empty());
        channel
            .write_command(&MoveCommand { dx: 0.0, dy: 3.0 })
            .await
            .unwrap();
        assert_eq!(observer.lines(), vec!["move(0.00,3.00)".to_string()]);
    }

    #[tokio::test]
    async fn test_open_output_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commands.log");
        let config = HardwareConfig {
            output: path.to_string_lossy().into_owned(),
            line_terminator: "\n".to_string(),
            ..HardwareConfig::default()
        };

        let mut channel = open_output(&config).await.unwrap();
        channel
            .write_command(&MoveCommand { dx: 0.25, dy: -1.0 })
            .await
            .unwrap();
        drop(channel);

        let mut channel = open_output(&config).await.unwrap();
        channel
            .write_command(&MoveCommand { dx: 0.0, dy: 0.0 })
            .await
            .unwrap();
        drop(channel);

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "move(0.25,-1.00)\nmove(0.00,0.00)\n");
    }

    #[tokio::test]
    async fn test_open_output_missing_directory() {
        let config = HardwareConfig {
            output: "/nonexistent-dir/commands.log".to_string(),
            ..HardwareConfig::default()
        };
        let err = open_output(&config).await.err().unwrap();
        assert!(matches!(err, CommandChannelError::Open { .. }));
    }
}
