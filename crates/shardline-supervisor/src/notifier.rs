// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator notifications.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::recovery::RecoveryAction;
use crate::runner::ExitReason;

/// Something operators should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Worker printed the loading marker.
    LoadingStarted {
        /// Shard id.
        shard_id: u32,
    },
    /// Worker printed the fully-loaded marker.
    FullyLoaded {
        /// Shard id.
        shard_id: u32,
    },
    /// Worker exited unexpectedly.
    Crashed {
        /// Shard id.
        shard_id: u32,
        /// How the worker ended.
        exit: ExitReason,
        /// What recovery does next.
        action: RecoveryAction,
    },
    /// Worker could not be spawned.
    SpawnFailed {
        /// Shard id.
        shard_id: u32,
        /// Launcher error message.
        reason: String,
    },
    /// Loaded worker exited with code 0.
    CleanShutdown {
        /// Shard id.
        shard_id: u32,
    },
}

impl Notice {
    /// Shard the notice is about.
    pub fn shard_id(&self) -> u32 {
        match self {
            Notice::LoadingStarted { shard_id }
            | Notice::FullyLoaded { shard_id }
            | Notice::Crashed { shard_id, .. }
            | Notice::SpawnFailed { shard_id, .. }
            | Notice::CleanShutdown { shard_id } => *shard_id,
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::LoadingStarted { shard_id } => {
                write!(f, "Shard {} started, begin loading", shard_id)
            }
            Notice::FullyLoaded { shard_id } => write!(f, "Shard {} fully started", shard_id),
            Notice::Crashed {
                shard_id,
                exit,
                action,
            } => {
                let follow_up = match action {
                    RecoveryAction::Requeue => "requeued",
                    RecoveryAction::Relaunch => "relaunching",
                    RecoveryAction::LeaveCrashed => "left down",
                };
                write!(f, "Shard {} crashed ({}), {}", shard_id, exit, follow_up)
            }
            Notice::SpawnFailed { shard_id, reason } => {
                write!(f, "Shard {} failed to spawn: {}", shard_id, reason)
            }
            Notice::CleanShutdown { shard_id } => write!(f, "Shard {} shut down", shard_id),
        }
    }
}

/// Sink for operator notifications.
///
/// Called with the registry lock held; implementations must not block.
pub trait Notifier: Send + Sync {
    /// Deliver one notice.
    fn notify(&self, notice: &Notice);
}

/// Writes notices to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: &Notice) {
        match notice {
            Notice::Crashed { .. } | Notice::SpawnFailed { .. } => {
                warn!(shard_id = notice.shard_id(), "{}", notice)
            }
            _ => info!(shard_id = notice.shard_id(), "{}", notice),
        }
    }
}

/// Keeps every notice in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    notices: Arc<Mutex<Vec<Notice>>>,
}

impl RecordingNotifier {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notices received so far, oldest first.
    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: &Notice) {
        self.notices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notice.clone());
    }
}
