// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Launcher trait definitions.
//!
//! Defines the abstract interface for worker launchers.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use shardline_protocol::WorkerControl;
use thiserror::Error;
use tokio::io::AsyncBufRead;
use tokio::sync::{mpsc, oneshot};

/// Errors from launcher operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LaunchError {
    /// Worker executable was not found.
    #[error("Executable not found: {0}")]
    ProgramNotFound(String),

    /// The OS refused to spawn the process.
    #[error("Spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    /// A standard stream was not captured.
    #[error("Worker {0} pipe unavailable")]
    PipeUnavailable(&'static str),

    /// The worker's control channel is closed (process gone).
    #[error("Worker control channel closed")]
    ControlClosed,

    /// Control message could not be encoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for launcher operations.
pub type Result<T> = std::result::Result<T, LaunchError>;

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Shard id (1-based)
    pub shard_id: u32,
    /// Total shard count passed to the worker
    pub shard_count: u32,
    /// Launch generation of this shard, increases on every launch
    pub generation: u64,
    /// Debug port derived from the shard id
    pub debug_port: u16,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitReason {
    /// Process exited on its own with a code.
    Code(i32),
    /// Process was terminated by a signal it did not receive from us.
    Signal(i32),
    /// Process was torn down by the supervisor.
    Killed,
    /// Exit status could not be determined.
    Unknown,
}

impl ExitReason {
    /// Exit code, if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitReason::Code(code) => Some(*code),
            _ => None,
        }
    }

    /// Whether the supervisor itself ended the process.
    pub fn is_supervisor_kill(&self) -> bool {
        matches!(self, ExitReason::Killed)
    }

    /// Convert the result of `Child::wait`.
    pub fn from_wait(status: std::io::Result<std::process::ExitStatus>) -> Self {
        match status {
            Ok(status) => {
                if let Some(code) = status.code() {
                    return ExitReason::Code(code);
                }
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    if let Some(signal) = status.signal() {
                        return ExitReason::Signal(signal);
                    }
                }
                ExitReason::Unknown
            }
            Err(_) => ExitReason::Unknown,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Code(code) => write!(f, "exit code {}", code),
            ExitReason::Signal(signal) => write!(f, "signal {}", signal),
            ExitReason::Killed => write!(f, "killed by supervisor"),
            ExitReason::Unknown => write!(f, "unknown exit status"),
        }
    }
}

/// Exclusive handle to a live worker.
///
/// Owned by the shard record while the worker is alive. Not `Clone`:
/// there is exactly one way to kill a given worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shard_id: u32,
    generation: u64,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    control_tx: mpsc::UnboundedSender<String>,
    terminated: Option<oneshot::Receiver<()>>,
}

impl WorkerHandle {
    /// Create a handle. `kill_tx` is consumed by the first [`kill`](Self::kill);
    /// `control_tx` feeds lines to the worker's stdin. The launcher's monitor
    /// completes (or drops) the sender of `terminated` once the process has
    /// been reaped.
    pub fn new(
        shard_id: u32,
        generation: u64,
        pid: Option<u32>,
        kill_tx: oneshot::Sender<()>,
        control_tx: mpsc::UnboundedSender<String>,
        terminated: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            shard_id,
            generation,
            pid,
            kill_tx: Some(kill_tx),
            control_tx,
            terminated: Some(terminated),
        }
    }

    /// Shard this worker serves.
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    /// Launch generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// OS process id, when known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the worker's monitor to tear the process down.
    ///
    /// Returns `false` if a kill was already requested or the monitor is gone.
    pub fn kill(&mut self) -> bool {
        match self.kill_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Wait until the process has been reaped, at most `timeout`.
    ///
    /// Returns `false` on timeout. A second call returns `true` at once.
    pub async fn wait_terminated(&mut self, timeout: Duration) -> bool {
        let Some(terminated) = self.terminated.take() else {
            return true;
        };
        tokio::time::timeout(timeout, terminated).await.is_ok()
    }

    /// Write a control message to the worker's stdin.
    pub fn send_control(&self, message: &WorkerControl) -> Result<()> {
        let line = message.to_line()?;
        self.control_tx
            .send(line)
            .map_err(|_| LaunchError::ControlClosed)
    }
}

/// Boxed line-oriented reader over a worker's stdout.
pub type WorkerOutput = Pin<Box<dyn AsyncBufRead + Send>>;

/// Everything a launcher hands back for one spawned worker.
pub struct WorkerProcess {
    /// Kill/control handle, stored in the shard record.
    pub handle: WorkerHandle,
    /// Captured stdout, consumed by the lifecycle parser.
    pub stdout: WorkerOutput,
    /// Resolves exactly once when the process is gone.
    pub exit: oneshot::Receiver<ExitReason>,
}

impl fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Trait for worker launchers.
///
/// Launchers are PURE execution backends - they never touch shard state.
/// Status bookkeeping is done by the caller.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launcher type identifier (e.g., "process", "mock")
    fn launcher_type(&self) -> &'static str;

    /// Spawn one worker with stdout and stderr captured.
    async fn launch(&self, request: &LaunchRequest) -> Result<WorkerProcess>;
}
