// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator command surface.
//!
//! Text commands, one per message:
//!
//! | Command        | Effect                                   |
//! |----------------|------------------------------------------|
//! | `.startall`    | start every shard that is `down`         |
//! | `.start <id>`  | start one shard                          |
//! | `.kill <id>`   | kill one shard's worker                  |
//! | `.botstatus`   | status of every shard                    |
//! | `.help`        | list commands                            |
//!
//! Only callers on the allow-list may run commands. Every reply is plain
//! text; requests that change nothing get a descriptive reply instead of an
//! error.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::registry::{ShardSnapshot, ShardStatus};
use crate::scheduler::StartupMode;
use crate::supervisor::{StartOutcome, Supervisor};

const HELP: &str = "\
Commands:
  .startall     start every shard that is down
  .start <id>   start one shard
  .kill <id>    kill one shard
  .botstatus    show the status of every shard
  .help         show this help";

/// A parsed operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    /// `.startall`
    StartAll,
    /// `.start <id>`
    Start(u32),
    /// `.kill <id>`
    Kill(u32),
    /// `.botstatus`
    Status,
    /// `.help`
    Help,
}

/// Why a message is not a runnable command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The message is not addressed to the supervisor.
    #[error("not a command")]
    NotACommand,
    /// Unrecognised keyword.
    #[error("Unknown command: .{0} (try .help)")]
    UnknownCommand(String),
    /// The command needs a shard id.
    #[error("Usage: .{0} <id>")]
    MissingShardId(&'static str),
    /// The shard id is not a number.
    #[error("Invalid shard id: {0}")]
    InvalidShardId(String),
}

impl OperatorCommand {
    /// Parse one message. Keywords are case-insensitive.
    pub fn parse(input: &str) -> std::result::Result<Self, ParseError> {
        let body = input
            .trim()
            .strip_prefix('.')
            .ok_or(ParseError::NotACommand)?;
        let mut parts = body.split_whitespace();
        let keyword = parts
            .next()
            .ok_or(ParseError::NotACommand)?
            .to_ascii_lowercase();

        match keyword.as_str() {
            "startall" => Ok(OperatorCommand::StartAll),
            "start" => shard_arg(parts.next(), "start").map(OperatorCommand::Start),
            "kill" => shard_arg(parts.next(), "kill").map(OperatorCommand::Kill),
            "botstatus" => Ok(OperatorCommand::Status),
            "help" => Ok(OperatorCommand::Help),
            _ => Err(ParseError::UnknownCommand(keyword)),
        }
    }
}

fn shard_arg(arg: Option<&str>, command: &'static str) -> std::result::Result<u32, ParseError> {
    let raw = arg.ok_or(ParseError::MissingShardId(command))?;
    raw.parse()
        .map_err(|_| ParseError::InvalidShardId(raw.to_string()))
}

/// Authorization-gated command handler.
pub struct OperatorInterface {
    supervisor: Arc<Supervisor>,
    operators: HashSet<String>,
}

impl OperatorInterface {
    /// Create an interface for the given allow-list.
    pub fn new(supervisor: Arc<Supervisor>, operators: HashSet<String>) -> Self {
        Self {
            supervisor,
            operators,
        }
    }

    /// Whether a caller may run commands.
    pub fn is_authorized(&self, caller: &str) -> bool {
        self.operators.contains(caller)
    }

    /// Handle one message from `caller`.
    ///
    /// Returns `None` if the message is not a command, otherwise the reply.
    pub async fn handle(&self, caller: &str, input: &str) -> Option<String> {
        let command = match OperatorCommand::parse(input) {
            Err(ParseError::NotACommand) => return None,
            parsed => parsed,
        };

        if !self.is_authorized(caller) {
            warn!(caller, "Rejected command from unauthorized caller");
            self.supervisor.record_command(false);
            return Some(Error::UnauthorizedOperator(caller.to_string()).to_string());
        }

        let reply = match command {
            Ok(command) => {
                info!(caller, ?command, "Operator command");
                self.execute(command).await.map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };

        self.supervisor.record_command(reply.is_ok());
        Some(reply.unwrap_or_else(|e| e))
    }

    /// Run a command that already passed authorization.
    pub async fn execute(&self, command: OperatorCommand) -> Result<String> {
        match command {
            OperatorCommand::StartAll => {
                let started = self.supervisor.start_all_down().await;
                if started.is_empty() {
                    return Ok("No shards are down".to_string());
                }
                let verb = match self.supervisor.mode() {
                    StartupMode::SelfManaged => "Queued",
                    StartupMode::Coordinated => "Launched",
                };
                Ok(format!(
                    "{} {} shard(s): {}",
                    verb,
                    started.len(),
                    join_ids(&started)
                ))
            }
            OperatorCommand::Start(shard_id) => {
                match self.supervisor.request_start(shard_id).await {
                    Ok(StartOutcome::Queued) => Ok(format!("Shard {} queued", shard_id)),
                    Ok(StartOutcome::AlreadyQueued) => {
                        Ok(format!("Shard {} is already queued", shard_id))
                    }
                    Ok(StartOutcome::Launched) => Ok(format!("Shard {} launching", shard_id)),
                    Err(Error::AlreadyRunning(_)) => {
                        let status = self.supervisor.shard_status(shard_id).await?;
                        Ok(format!("Shard {} is already running ({})", shard_id, status))
                    }
                    Err(e) => Err(e),
                }
            }
            OperatorCommand::Kill(shard_id) => match self.supervisor.kill(shard_id).await {
                Ok(()) => Ok(format!("Shard {} killed", shard_id)),
                Err(Error::NotRunning(_)) => {
                    let status = self.supervisor.shard_status(shard_id).await?;
                    Ok(format!(
                        "Shard {} is not running ({}), nothing to kill",
                        shard_id, status
                    ))
                }
                Err(e) => Err(e),
            },
            OperatorCommand::Status => {
                let shards = self.supervisor.status().await;
                let queued = self.supervisor.queued().await;
                Ok(format_status(&shards, &queued))
            }
            OperatorCommand::Help => Ok(HELP.to_string()),
        }
    }
}

/// Render a status dump.
pub fn format_status(shards: &[ShardSnapshot], queued: &[u32]) -> String {
    let ok = shards.iter().filter(|s| s.status == ShardStatus::Ok).count();
    let mut out = format!("{}/{} shards ok", ok, shards.len());
    if !queued.is_empty() {
        let _ = write!(out, ", queue: {}", join_ids(queued));
    }

    for shard in shards {
        let _ = write!(out, "\nShard {}: {}", shard.id, shard.status);
        if let Some(pid) = shard.pid {
            let _ = write!(out, " (pid {})", pid);
        }
        if shard.status == ShardStatus::Crashed
            && let Some(exit) = shard.last_exit
        {
            let _ = write!(out, " [{}]", exit);
        }
    }
    out
}

fn join_ids(ids: &[u32]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
