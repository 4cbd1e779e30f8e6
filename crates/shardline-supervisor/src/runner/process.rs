// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Native process launcher.
//!
//! Spawns one OS process per shard with stdin, stdout and stderr piped:
//! - stdout is handed to the lifecycle parser
//! - stderr is relayed to the log
//! - stdin carries control lines
//!
//! A per-worker watch task owns the `Child` and reports its exit exactly once.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::runner::{
    ExitReason, LaunchError, LaunchRequest, Launcher, Result, WorkerHandle, WorkerProcess,
};

/// Debugger flag passed to the worker runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugMode {
    /// No debugger flag.
    #[default]
    Off,
    /// Listen on the shard's debug port (`--inspect=PORT`).
    Attach,
    /// Listen and pause before the first statement (`--inspect-brk=PORT`).
    BreakOnStart,
}

/// How a worker is invoked.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    /// Runtime executable
    pub program: String,
    /// Worker entrypoint script
    pub entrypoint: String,
    /// Authentication token (positional)
    pub token: String,
    /// Debugger flag
    pub debug: DebugMode,
    /// Pass `--no-rabbitmq`
    pub disable_broker: bool,
    /// SIGTERM to SIGKILL escalation delay
    pub kill_grace: Duration,
}

impl WorkerCommand {
    /// Argument vector for one shard.
    ///
    /// `[--inspect[-brk]=PORT] ENTRYPOINT [--no-rabbitmq] TOKEN SHARD_ID SHARD_COUNT`
    pub fn args(&self, request: &LaunchRequest) -> Vec<String> {
        let mut args = Vec::with_capacity(6);
        match self.debug {
            DebugMode::Off => {}
            DebugMode::Attach => args.push(format!("--inspect={}", request.debug_port)),
            DebugMode::BreakOnStart => args.push(format!("--inspect-brk={}", request.debug_port)),
        }
        args.push(self.entrypoint.clone());
        if self.disable_broker {
            args.push("--no-rabbitmq".to_string());
        }
        args.push(self.token.clone());
        args.push(request.shard_id.to_string());
        args.push(request.shard_count.to_string());
        args
    }
}

/// Launcher that runs workers as child processes.
pub struct ProcessLauncher {
    command: WorkerCommand,
}

impl ProcessLauncher {
    /// Create a launcher for the given invocation.
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }

    /// The invocation used for every worker.
    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    fn launcher_type(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<WorkerProcess> {
        let shard_id = request.shard_id;

        let mut cmd = Command::new(&self.command.program);
        cmd.args(self.command.args(request))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LaunchError::ProgramNotFound(self.command.program.clone())
            } else {
                LaunchError::Spawn(e)
            }
        })?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or(LaunchError::PipeUnavailable("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(LaunchError::PipeUnavailable("stderr"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or(LaunchError::PipeUnavailable("stdin"))?;

        tokio::spawn(relay_stderr(shard_id, stderr));

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_control(shard_id, stdin, control_rx));

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (terminated_tx, terminated_rx) = oneshot::channel();
        tokio::spawn(watch_child(
            shard_id,
            child,
            kill_rx,
            exit_tx,
            terminated_tx,
            self.command.kill_grace,
        ));

        info!(
            shard_id,
            pid = ?pid,
            generation = request.generation,
            "Worker spawned"
        );

        Ok(WorkerProcess {
            handle: WorkerHandle::new(
                shard_id,
                request.generation,
                pid,
                kill_tx,
                control_tx,
                terminated_rx,
            ),
            stdout: Box::pin(BufReader::new(stdout)),
            exit: exit_rx,
        })
    }
}

/// Own the child until it exits or a kill is requested.
///
/// `terminated_tx` fires only after the child has been reaped.
async fn watch_child(
    shard_id: u32,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<ExitReason>,
    terminated_tx: oneshot::Sender<()>,
    grace: Duration,
) {
    let reason = tokio::select! {
        status = child.wait() => ExitReason::from_wait(status),
        Ok(()) = &mut kill_rx => {
            terminate(shard_id, &mut child, grace).await;
            ExitReason::Killed
        }
    };

    debug!(shard_id, exit = %reason, "Worker process ended");
    let _ = exit_tx.send(reason);
    let _ = terminated_tx.send(());
}

/// SIGTERM, then SIGKILL once the grace period runs out.
async fn terminate(shard_id: u32, child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(shard_id, pid, error = %e, "SIGTERM failed");
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        warn!(
            shard_id,
            pid,
            grace_ms = grace.as_millis() as u64,
            "Worker ignored SIGTERM, sending SIGKILL"
        );
    }

    if let Err(e) = child.kill().await {
        warn!(shard_id, error = %e, "Failed to kill worker");
    }
}

async fn relay_stderr(shard_id: u32, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                warn!(shard_id, "{}", line.trim_end());
            }
            Err(e) => {
                debug!(shard_id, error = %e, "Worker stderr closed");
                break;
            }
        }
    }
}

async fn write_control(
    shard_id: u32,
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = rx.recv().await {
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!(shard_id, error = %e, "Failed to write control line to worker");
            break;
        }
    }
}
