// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for shardline-supervisor.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use crate::coordinator::CoordinatorConfig;
use crate::runner::{DebugMode, WorkerCommand};
use crate::scheduler::StartupMode;
use crate::supervisor::SupervisorSettings;

/// Supervisor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of shards; ids run from 1 to `shard_count` inclusive
    pub shard_count: u32,
    /// Debug port base; shard `n` gets `first_debug_port + n`
    pub first_debug_port: u16,
    /// Runtime executable used to start workers
    pub worker_program: String,
    /// Worker entrypoint passed as the first positional argument
    pub worker_entrypoint: String,
    /// Authentication token handed to every worker
    pub worker_token: String,
    /// Debugger flag passed to workers
    pub debug: DebugMode,
    /// Pass the flag that disables the worker's message broker integration
    pub disable_broker: bool,
    /// Relaunch crashed workers automatically
    pub auto_restart: bool,
    /// Self-managed queue tick
    pub tick_interval: Duration,
    /// Self-managed loading gate capacity
    pub max_loading: usize,
    /// Self-managed mode: queue every shard at boot
    pub queue_on_start: bool,
    /// Grace period between SIGTERM and SIGKILL on operator kill
    pub kill_grace: Duration,
    /// Operator identities allowed to issue commands
    pub operators: HashSet<String>,
    /// Identity used for commands typed on the local console; always
    /// allowed to operate, whether or not it is listed in `operators`
    pub console_operator: String,
    /// External coordinator settings; `Some` selects coordinated mode
    pub coordinator: Option<CoordinatorConfig>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let shard_count: u32 = required(&lookup, "SHARDLINE_SHARD_COUNT")?;
        if shard_count == 0 {
            return Err(ConfigError::Invalid {
                var: "SHARDLINE_SHARD_COUNT",
                reason: "must be at least 1".to_string(),
            });
        }

        let worker_token = lookup("SHARDLINE_WORKER_TOKEN")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingEnvVar("SHARDLINE_WORKER_TOKEN"))?;

        let first_debug_port: u16 = optional(&lookup, "SHARDLINE_FIRST_DEBUG_PORT", 9229)?;
        if u32::from(first_debug_port) + shard_count > u32::from(u16::MAX) {
            return Err(ConfigError::Invalid {
                var: "SHARDLINE_FIRST_DEBUG_PORT",
                reason: format!("port range overflows for {} shards", shard_count),
            });
        }

        let debug = if flag(&lookup, "SHARDLINE_DEBUG_BREAK", false) {
            DebugMode::BreakOnStart
        } else if flag(&lookup, "SHARDLINE_DEBUG", false) {
            DebugMode::Attach
        } else {
            DebugMode::Off
        };

        let operators = lookup("SHARDLINE_OPERATORS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let coordinator = match lookup("SHARDLINE_COORDINATOR_URL").filter(|v| !v.is_empty()) {
            Some(url) => {
                let key = lookup("SHARDLINE_COORDINATOR_KEY")
                    .filter(|v| !v.is_empty())
                    .ok_or(ConfigError::MissingEnvVar("SHARDLINE_COORDINATOR_KEY"))?;
                Some(CoordinatorConfig {
                    url,
                    key,
                    require_ticket: flag(&lookup, "SHARDLINE_REQUIRE_TICKET", true),
                    retry_interval: Duration::from_secs(optional(
                        &lookup,
                        "SHARDLINE_COORDINATOR_RETRY_SECS",
                        10,
                    )?),
                    stats_interval: Duration::from_secs(optional(
                        &lookup,
                        "SHARDLINE_STATS_INTERVAL_SECS",
                        5,
                    )?),
                })
            }
            None => None,
        };

        Ok(Self {
            shard_count,
            first_debug_port,
            worker_program: lookup("SHARDLINE_WORKER_PROGRAM").unwrap_or_else(|| "node".to_string()),
            worker_entrypoint: lookup("SHARDLINE_WORKER_ENTRYPOINT")
                .unwrap_or_else(|| "./bin/bot.js".to_string()),
            worker_token,
            debug,
            disable_broker: flag(&lookup, "SHARDLINE_DISABLE_BROKER", true),
            auto_restart: flag(&lookup, "SHARDLINE_AUTO_RESTART", false),
            tick_interval: Duration::from_secs(optional(
                &lookup,
                "SHARDLINE_TICK_INTERVAL_SECS",
                10,
            )?),
            max_loading: optional::<usize, _>(&lookup, "SHARDLINE_MAX_LOADING", 1)?.max(1),
            queue_on_start: flag(&lookup, "SHARDLINE_QUEUE_ON_START", false),
            kill_grace: Duration::from_millis(optional(&lookup, "SHARDLINE_KILL_GRACE_MS", 5000)?),
            operators,
            console_operator: lookup("SHARDLINE_CONSOLE_OPERATOR")
                .unwrap_or_else(|| "console".to_string()),
            coordinator,
        })
    }

    /// Startup mode, fixed for the life of the supervisor.
    pub fn mode(&self) -> StartupMode {
        if self.coordinator.is_some() {
            StartupMode::Coordinated
        } else {
            StartupMode::SelfManaged
        }
    }

    /// Settings for the supervisor core.
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            shard_count: self.shard_count,
            first_debug_port: self.first_debug_port,
            mode: self.mode(),
            auto_restart: self.auto_restart,
            max_loading: self.max_loading,
            kill_grace: self.kill_grace,
        }
    }

    /// How worker processes are invoked.
    pub fn worker_command(&self) -> WorkerCommand {
        WorkerCommand {
            program: self.worker_program.clone(),
            entrypoint: self.worker_entrypoint.clone(),
            token: self.worker_token.clone(),
            debug: self.debug,
            disable_broker: self.disable_broker,
            kill_grace: self.kill_grace,
        }
    }
}

/// Parse an env var into a bool with a sensible default.
fn flag<F: Fn(&str) -> Option<String>>(lookup: &F, var: &str, default: bool) -> bool {
    lookup(var)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn required<T, F>(lookup: &F, var: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(var).ok_or(ConfigError::MissingEnvVar(var))?;
    parse(var, &raw)
}

fn optional<T, F>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) if !raw.trim().is_empty() => parse(var, &raw),
        _ => Ok(default),
    }
}

fn parse<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        reason: e.to_string(),
    })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable holds an unusable value.
    #[error("Invalid value for {var}: {reason}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
