//! Network representation of tasks.
//!
//! A client streams JSON objects back to back (whitespace between them is
//! allowed, nothing else). Each object is one task record:
//!
//! ```text
//! {"version": 1, "type": "move_to_well", "plate": "PlateA", "well": "B3"}
//! {"type": "null"}
//! {"type": "multi", "tasks": [{"type": "move_to_well", "plate": "P", "well": "A1"}]}
//! ```
//!
//! `version` is optional and defaults to [`WIRE_VERSION`]; nested tasks carry
//! no version. Unknown tags and unknown fields are rejected, never guessed at.

use crate::error::{AppResult, ConnectionError, WireError};
use crate::task::{MoveToWell, MultiTask, Task, TaskVisitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Record schema version understood by this build.
pub const WIRE_VERSION: u32 = 1;

/// Default cap on a single record's size in bytes.
pub const DEFAULT_MAX_RECORD_BYTES: usize = 64 * 1024;

/// Default cap on composite nesting.
pub const DEFAULT_MAX_TASK_DEPTH: usize = 32;

const READ_CHUNK_BYTES: usize = 4096;

/// Tagged task as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum WireTask {
    /// Move to a well
    MoveToWell {
        /// Plate name
        plate: String,
        /// Well identifier
        well: String,
    },
    /// No-op. A struct variant so extra fields are rejected like any other.
    Null {},
    /// Ordered composite
    Multi {
        /// Children in order
        tasks: Vec<WireTask>,
    },
}

/// Limits applied while decoding untrusted input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireLimits {
    /// Largest accepted record, in bytes
    pub max_record_bytes: usize,
    /// Deepest accepted composite nesting
    pub max_task_depth: usize,
}

impl Default for WireLimits {
    fn default() -> Self {
        Self {
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            max_task_depth: DEFAULT_MAX_TASK_DEPTH,
        }
    }
}

impl WireTask {
    /// Validates and converts into a task. `depth` is the composite nesting
    /// level of `self` (0 at the top).
    fn into_task(self, depth: usize, limits: &WireLimits) -> Result<Task, WireError> {
        match self {
            WireTask::MoveToWell { plate, well } => {
                if plate.trim().is_empty() {
                    return Err(WireError::EmptyField("plate"));
                }
                if well.trim().is_empty() {
                    return Err(WireError::EmptyField("well"));
                }
                Ok(Task::move_to(plate, well))
            }
            WireTask::Null {} => Ok(Task::Null),
            WireTask::Multi { tasks } => {
                if depth >= limits.max_task_depth {
                    return Err(WireError::TooDeep {
                        max_depth: limits.max_task_depth,
                    });
                }
                let children = tasks
                    .into_iter()
                    .map(|t| t.into_task(depth + 1, limits))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Task::multi(children))
            }
        }
    }
}

/// Turns one parsed JSON value into a task.
pub fn decode_value(mut value: Value, limits: &WireLimits) -> Result<Task, WireError> {
    if let Some(version) = value.as_object_mut().and_then(|obj| obj.remove("version")) {
        let found: u32 = serde_json::from_value(version)?;
        if found != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion {
                found,
                expected: WIRE_VERSION,
            });
        }
    }
    let wire: WireTask = serde_json::from_value(value)?;
    wire.into_task(0, limits)
}

/// Incremental decoder for a stream of concatenated records.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    buffer: Vec<u8>,
    limits: WireLimits,
}

impl RecordDecoder {
    /// Creates a decoder enforcing `limits`.
    pub fn new(limits: WireLimits) -> Self {
        Self {
            buffer: Vec::new(),
            limits,
        }
    }

    /// Feeds more bytes from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Decodes the next complete record, if the buffer holds one.
    ///
    /// `Ok(None)` means more bytes are needed.
    pub fn decode_next(&mut self) -> Result<Option<Task>, WireError> {
        let (next, consumed) = {
            let mut stream =
                serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Value>();
            let next = stream.next();
            (next, stream.byte_offset())
        };
        match next {
            None => {
                // only whitespace so far
                self.buffer.clear();
                Ok(None)
            }
            Some(Ok(value)) => {
                if consumed > self.limits.max_record_bytes {
                    return Err(WireError::RecordTooLarge {
                        max_bytes: self.limits.max_record_bytes,
                    });
                }
                self.buffer.drain(..consumed);
                decode_value(value, &self.limits).map(Some)
            }
            Some(Err(err)) if err.is_eof() => {
                if self.buffer.len() > self.limits.max_record_bytes {
                    return Err(WireError::RecordTooLarge {
                        max_bytes: self.limits.max_record_bytes,
                    });
                }
                Ok(None)
            }
            Some(Err(err)) => Err(WireError::Malformed(err)),
        }
    }

    /// Checks that the stream did not stop inside a record.
    pub fn finish(&self) -> Result<(), WireError> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(WireError::Truncated)
        }
    }
}

/// Reads tasks from an async byte stream.
pub struct RecordReader<R> {
    reader: R,
    decoder: RecordDecoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    /// Wraps `reader`, enforcing `limits` on every record.
    pub fn new(reader: R, limits: WireLimits) -> Self {
        Self {
            reader,
            decoder: RecordDecoder::new(limits),
            chunk: vec![0; READ_CHUNK_BYTES],
        }
    }

    /// Next task, or `None` once the peer has closed the stream cleanly.
    ///
    /// Malformed input surfaces as [`crate::error::ArmError::Wire`], socket
    /// failures as [`crate::error::ArmError::Connection`].
    pub async fn next_task(&mut self) -> AppResult<Option<Task>> {
        loop {
            if let Some(task) = self.decoder.decode_next()? {
                return Ok(Some(task));
            }
            let n = self
                .reader
                .read(&mut self.chunk)
                .await
                .map_err(ConnectionError::Io)?;
            if n == 0 {
                self.decoder.finish()?;
                return Ok(None);
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }
}

/// Builds the wire form of a task.
#[derive(Debug, Default)]
pub struct WireEncoder;

impl TaskVisitor for WireEncoder {
    type Output = WireTask;

    fn visit_move_to_well(&mut self, task: &MoveToWell) -> WireTask {
        WireTask::MoveToWell {
            plate: task.plate().to_string(),
            well: task.well().to_string(),
        }
    }

    fn visit_null(&mut self) -> WireTask {
        WireTask::Null {}
    }

    fn visit_multi(&mut self, task: &MultiTask) -> WireTask {
        WireTask::Multi {
            tasks: task.children().iter().map(|c| c.dispatch(self)).collect(),
        }
    }
}

/// Serializes `task` as a versioned JSON record followed by a newline.
pub fn encode_record(task: &Task) -> Result<Vec<u8>, WireError> {
    let mut value = serde_json::to_value(task.dispatch(&mut WireEncoder))?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("version".to_string(), Value::from(WIRE_VERSION));
    }
    let mut bytes = serde_json::to_vec(&value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Writes one task record to `writer`.
pub async fn write_task<W: AsyncWrite + Unpin>(writer: &mut W, task: &Task) -> AppResult<()> {
    let bytes = encode_record(task)?;
    writer
        .write_all(&bytes)
        .await
        .map_err(ConnectionError::Io)?;
    Ok(())
}
