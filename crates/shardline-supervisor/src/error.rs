// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for shardline-supervisor.

use thiserror::Error;

/// Supervisor errors.
///
/// None of these terminate the supervisor. Request-level variants are
/// rendered as operator replies; `SpawnFailed` and `CoordinatorUnavailable`
/// are recovered locally.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The shard id is not part of the configured fleet.
    #[error("Unknown shard: {0}")]
    UnknownShard(u32),

    /// The shard already has a live worker (launching, loading or ok).
    #[error("Shard {0} is already running")]
    AlreadyRunning(u32),

    /// The shard has no live worker to act on.
    #[error("Shard {0} is not running")]
    NotRunning(u32),

    /// The worker process could not be spawned.
    #[error("Failed to spawn shard {shard_id}: {reason}")]
    SpawnFailed {
        /// Shard that failed to spawn.
        shard_id: u32,
        /// Launcher error message.
        reason: String,
    },

    /// The external coordinator could not be reached.
    #[error("Coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),

    /// The caller is not on the operator allow-list.
    #[error("Operator not allowed: {0}")]
    UnauthorizedOperator(String),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type using the supervisor Error.
pub type Result<T> = std::result::Result<T, Error>;
