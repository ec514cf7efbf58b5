//! Wire protocol between the orchestrator and worker processes.
//!
//! Newline-delimited JSON over a per-worker localhost TCP connection.
//! Requests flow one way, streamed events the other; `error` and `done`
//! are terminal for one dispatch. Test stdout/stderr stay on the worker's
//! inherited standard streams, never on this channel.

use crate::error::{TactError, TactResult};
use crate::model::SnapshotStatus;
use crate::suite::SummaryNode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::PathBuf;

/// Set in a worker process's environment; holds the connect-back port.
pub const PORT_ENV: &str = "TACT_WORKER_PORT";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerRequest {
    Run(RunRequest),
    Shutdown,
}

/// One test dispatch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRequest {
    pub test_id: String,
    /// Root/project/file ancestor chain; describes omitted.
    pub summary: Vec<SummaryNode>,
    /// Resolved loadable path of the test file.
    pub source: PathBuf,
    pub timeout_ms: u64,
    pub expect_timeout_ms: u64,
    pub update_snapshots: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// The attempt has begun; `epoch_ms` is the authoritative start time.
    Started { epoch_ms: u64 },
    Snapshot { status: SnapshotStatus },
    Error { message: String, duration_ms: u64 },
    Done { duration_ms: u64 },
}

impl WorkerEvent {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerEvent::Error { .. } | WorkerEvent::Done { .. })
    }
}

/// Write one message as a JSON line and flush.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> TactResult<()> {
    let mut line = serde_json::to_vec(message)
        .map_err(|err| TactError::protocol(format!("failed to encode message: {err}")))?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .map_err(|err| TactError::io("failed to write message", err))?;
    writer
        .flush()
        .map_err(|err| TactError::io("failed to flush message", err))
}

/// Read one message. `Ok(None)` means the peer closed the stream.
pub fn read_message<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> TactResult<Option<T>> {
    let mut line = String::new();
    let count = reader
        .read_line(&mut line)
        .map_err(|err| TactError::io("failed to read message", err))?;
    if count == 0 {
        return Ok(None);
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return read_message(reader);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|err| {
            TactError::protocol_with_context(
                format!("invalid message: {err}"),
                serde_json::json!({ "received": trimmed.chars().take(200).collect::<String>() }),
            )
        })
}
