// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Crash recovery policy.
//!
//! Decides what a worker exit means and what to do about it. Pure logic:
//! the supervisor applies the result to the registry and scheduler.

use crate::registry::ShardStatus;
use crate::runner::ExitReason;
use crate::scheduler::StartupMode;

/// What a worker exit means for its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// The supervisor asked for it; no recovery.
    SupervisorKill,
    /// Fully loaded worker exited with code 0; shard goes `down`.
    CleanShutdown,
    /// Unexpected exit; shard goes `crashed`.
    Crash,
    /// The shard was not running a worker; nothing to do.
    Untracked,
}

/// What to do after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Put the shard back in the start queue.
    Requeue,
    /// Launch it again right away.
    Relaunch,
    /// Leave it `crashed` for an operator.
    LeaveCrashed,
}

/// Crash recovery settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrashRecoveryPolicy {
    /// Restart crashed shards automatically.
    pub auto_restart: bool,
}

impl CrashRecoveryPolicy {
    /// Create a policy.
    pub fn new(auto_restart: bool) -> Self {
        Self { auto_restart }
    }

    /// Classify an exit given the shard's status and kill-intent flag at the
    /// time the exit was observed.
    pub fn classify(
        &self,
        status: ShardStatus,
        killed_by_supervisor: bool,
        exit: ExitReason,
    ) -> ExitDisposition {
        if killed_by_supervisor || exit.is_supervisor_kill() {
            return ExitDisposition::SupervisorKill;
        }
        if !status.is_running() {
            return ExitDisposition::Untracked;
        }
        if status == ShardStatus::Ok && exit.code() == Some(0) {
            return ExitDisposition::CleanShutdown;
        }
        ExitDisposition::Crash
    }

    /// Recovery for a crashed shard.
    pub fn on_crash(&self, mode: StartupMode) -> RecoveryAction {
        match (self.auto_restart, mode) {
            (false, _) => RecoveryAction::LeaveCrashed,
            (true, StartupMode::SelfManaged) => RecoveryAction::Requeue,
            (true, StartupMode::Coordinated) => RecoveryAction::Relaunch,
        }
    }
}
