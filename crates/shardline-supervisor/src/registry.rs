// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shard registry - the authoritative shard table.
//!
//! One [`ShardRecord`] per configured id, created `down` at startup and never
//! removed. Every status change goes through a transition method here; the
//! registry owns the worker handle while a worker is alive.
//!
//! ```text
//!            enqueue              dequeue / direct launch
//!   DOWN ───────────────▶ QUEUED ───────────────▶ LAUNCHING
//!    ▲  ▲                   ▲                       │   │
//!    │  │ kill / clean exit │ requeue        marker │   │ exit
//!    │  │                   │                       ▼   ▼
//!    │  └──────────────── CRASHED ◀──────────── LOADING ──▶ OK
//!    │                      ▲       exit                    │
//!    │                      └──────────── exit ─────────────┤
//!    └──────────────────────── kill / clean exit ───────────┘
//! ```
//!
//! The registry does no I/O and holds no lock; the supervisor serializes
//! access to it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::recovery::ExitDisposition;
use crate::runner::{ExitReason, WorkerHandle};

/// Lifecycle status of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardStatus {
    /// No worker and not waiting for one.
    Down,
    /// Waiting in the start queue.
    Queued,
    /// Worker spawned, no loading marker seen yet.
    Launching,
    /// Worker is loading its data.
    Loading,
    /// Worker is fully loaded.
    Ok,
    /// Worker exited unexpectedly.
    Crashed,
}

impl ShardStatus {
    /// Status string used in replies and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardStatus::Down => "down",
            ShardStatus::Queued => "queued",
            ShardStatus::Launching => "launching",
            ShardStatus::Loading => "loading",
            ShardStatus::Ok => "ok",
            ShardStatus::Crashed => "crashed",
        }
    }

    /// Statuses that own a live worker.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ShardStatus::Launching | ShardStatus::Loading | ShardStatus::Ok
        )
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a marker-driven transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The status changed.
    Applied,
    /// Not applicable in the current status, or from an old generation.
    Ignored,
}

/// One shard.
#[derive(Debug)]
pub struct ShardRecord {
    id: u32,
    debug_port: u16,
    status: ShardStatus,
    handle: Option<WorkerHandle>,
    generation: u64,
    killed_by_supervisor: bool,
    last_exit: Option<ExitReason>,
    status_since: DateTime<Utc>,
    crashes: u32,
}

impl ShardRecord {
    fn new(id: u32, debug_port: u16) -> Self {
        Self {
            id,
            debug_port,
            status: ShardStatus::Down,
            handle: None,
            generation: 0,
            killed_by_supervisor: false,
            last_exit: None,
            status_since: Utc::now(),
            crashes: 0,
        }
    }

    /// Shard id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Debug port handed to the worker.
    pub fn debug_port(&self) -> u16 {
        self.debug_port
    }

    /// Current status.
    pub fn status(&self) -> ShardStatus {
        self.status
    }

    /// Launch generation of the current (or last) worker.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the live worker's exit is expected because we killed it.
    pub fn killed_by_supervisor(&self) -> bool {
        self.killed_by_supervisor
    }

    /// Live worker handle.
    pub fn handle(&self) -> Option<&WorkerHandle> {
        self.handle.as_ref()
    }

    /// How the last worker ended.
    pub fn last_exit(&self) -> Option<ExitReason> {
        self.last_exit
    }

    fn set_status(&mut self, status: ShardStatus) {
        self.status = status;
        self.status_since = Utc::now();
    }

    fn snapshot(&self) -> ShardSnapshot {
        ShardSnapshot {
            id: self.id,
            status: self.status,
            debug_port: self.debug_port,
            pid: self.handle.as_ref().and_then(|h| h.pid()),
            generation: self.generation,
            status_since: self.status_since,
            last_exit: self.last_exit,
            crashes: self.crashes,
        }
    }
}

/// Read-only copy of a shard record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardSnapshot {
    /// Shard id
    pub id: u32,
    /// Current status
    pub status: ShardStatus,
    /// Debug port handed to the worker
    pub debug_port: u16,
    /// OS process id of the live worker
    pub pid: Option<u32>,
    /// Launch generation
    pub generation: u64,
    /// When the current status was entered
    pub status_since: DateTime<Utc>,
    /// How the last worker ended
    pub last_exit: Option<ExitReason>,
    /// Crashes since the supervisor started
    pub crashes: u32,
}

/// The shard table.
#[derive(Debug)]
pub struct ShardRegistry {
    records: BTreeMap<u32, ShardRecord>,
}

impl ShardRegistry {
    /// Create `shard_count` records (ids `1..=shard_count`), all `down`.
    ///
    /// Shard `n` gets debug port `first_debug_port + n`, saturating at `u16::MAX`.
    pub fn new(shard_count: u32, first_debug_port: u16) -> Self {
        let records = (1..=shard_count)
            .map(|id| {
                let port = u32::from(first_debug_port)
                    .saturating_add(id)
                    .min(u32::from(u16::MAX)) as u16;
                (id, ShardRecord::new(id, port))
            })
            .collect();
        Self { records }
    }

    /// Number of configured shards.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no shards are configured.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Configured ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.records.keys().copied()
    }

    /// Look up a record.
    pub fn get(&self, id: u32) -> Result<&ShardRecord> {
        self.records.get(&id).ok_or(Error::UnknownShard(id))
    }

    fn get_mut(&mut self, id: u32) -> Result<&mut ShardRecord> {
        self.records.get_mut(&id).ok_or(Error::UnknownShard(id))
    }

    /// Status of one shard.
    pub fn status(&self, id: u32) -> Result<ShardStatus> {
        Ok(self.get(id)?.status)
    }

    /// Number of shards in a status.
    pub fn count(&self, status: ShardStatus) -> usize {
        self.records.values().filter(|r| r.status == status).count()
    }

    /// Ids currently in a status.
    pub fn ids_with_status(&self, status: ShardStatus) -> Vec<u32> {
        self.records
            .values()
            .filter(|r| r.status == status)
            .map(|r| r.id)
            .collect()
    }

    /// Copy of every record, ordered by id.
    pub fn snapshot(&self) -> Vec<ShardSnapshot> {
        self.records.values().map(ShardRecord::snapshot).collect()
    }

    /// `down`/`crashed` → `queued`.
    ///
    /// Returns `Ok(false)` if the shard is already queued.
    pub fn mark_queued(&mut self, id: u32) -> Result<bool> {
        let record = self.get_mut(id)?;
        match record.status {
            ShardStatus::Down | ShardStatus::Crashed => {
                record.set_status(ShardStatus::Queued);
                Ok(true)
            }
            ShardStatus::Queued => Ok(false),
            _ => Err(Error::AlreadyRunning(id)),
        }
    }

    /// `down`/`queued`/`crashed` → `launching`; returns the new generation.
    ///
    /// The caller must follow up with [`attach_handle`](Self::attach_handle)
    /// or [`launch_failed`](Self::launch_failed).
    pub fn begin_launch(&mut self, id: u32) -> Result<u64> {
        let record = self.get_mut(id)?;
        if record.status.is_running() {
            return Err(Error::AlreadyRunning(id));
        }
        record.generation += 1;
        record.killed_by_supervisor = false;
        record.set_status(ShardStatus::Launching);
        Ok(record.generation)
    }

    /// Store the handle of a freshly spawned worker.
    ///
    /// A handle for a superseded generation is handed back to the caller.
    pub fn attach_handle(
        &mut self,
        id: u32,
        handle: WorkerHandle,
    ) -> std::result::Result<(), WorkerHandle> {
        match self.records.get_mut(&id) {
            Some(record)
                if record.generation == handle.generation()
                    && record.status == ShardStatus::Launching
                    && record.handle.is_none() =>
            {
                record.handle = Some(handle);
                Ok(())
            }
            _ => Err(handle),
        }
    }

    /// Spawn failed: `launching` → `down`.
    pub fn launch_failed(&mut self, id: u32, generation: u64) -> Transition {
        match self.records.get_mut(&id) {
            Some(record)
                if record.generation == generation && record.status == ShardStatus::Launching =>
            {
                record.handle = None;
                record.set_status(ShardStatus::Down);
                Transition::Applied
            }
            _ => Transition::Ignored,
        }
    }

    /// Loading marker: `launching` → `loading`.
    pub fn loading_started(&mut self, id: u32, generation: u64) -> Transition {
        self.marker_transition(id, generation, ShardStatus::Launching, ShardStatus::Loading)
    }

    /// Fully-loaded marker: `loading` → `ok`.
    pub fn fully_loaded(&mut self, id: u32, generation: u64) -> Transition {
        self.marker_transition(id, generation, ShardStatus::Loading, ShardStatus::Ok)
    }

    fn marker_transition(
        &mut self,
        id: u32,
        generation: u64,
        from: ShardStatus,
        to: ShardStatus,
    ) -> Transition {
        match self.records.get_mut(&id) {
            Some(record)
                if record.generation == generation
                    && record.status == from
                    && !record.killed_by_supervisor =>
            {
                record.set_status(to);
                Transition::Applied
            }
            _ => Transition::Ignored,
        }
    }

    /// Operator kill: tear down, clear the handle, set `down`.
    ///
    /// The kill-intent flag is raised before the kill request so the exit
    /// that follows is recognised as supervisor-initiated.
    pub fn kill(&mut self, id: u32) -> Result<()> {
        self.take_killed(id).map(drop)
    }

    /// Like [`kill`](Self::kill), but hands back the killed worker's handle
    /// so the caller can wait for the process to be reaped.
    fn take_killed(&mut self, id: u32) -> Result<WorkerHandle> {
        let record = self.get_mut(id)?;
        if !record.status.is_running() {
            return Err(Error::NotRunning(id));
        }
        let Some(mut handle) = record.handle.take() else {
            return Err(Error::NotRunning(id));
        };

        record.killed_by_supervisor = true;
        handle.kill();
        record.set_status(ShardStatus::Down);
        Ok(handle)
    }

    /// Apply the outcome of a worker exit.
    ///
    /// Exits from an older generation are ignored entirely.
    pub fn record_exit(
        &mut self,
        id: u32,
        generation: u64,
        exit: ExitReason,
        disposition: ExitDisposition,
    ) -> Transition {
        let Some(record) = self.records.get_mut(&id) else {
            return Transition::Ignored;
        };
        if record.generation != generation {
            return Transition::Ignored;
        }

        record.last_exit = Some(exit);
        match disposition {
            ExitDisposition::SupervisorKill => {
                record.killed_by_supervisor = false;
                record.handle = None;
                if record.status.is_running() {
                    record.set_status(ShardStatus::Down);
                }
                Transition::Applied
            }
            ExitDisposition::CleanShutdown => {
                record.handle = None;
                record.set_status(ShardStatus::Down);
                Transition::Applied
            }
            ExitDisposition::Crash => {
                record.handle = None;
                record.crashes += 1;
                record.set_status(ShardStatus::Crashed);
                Transition::Applied
            }
            ExitDisposition::Untracked => Transition::Ignored,
        }
    }

    /// Kill every live worker; returns the killed handles, ordered by shard id.
    pub fn kill_all(&mut self) -> Vec<WorkerHandle> {
        let ids: Vec<u32> = self
            .records
            .values()
            .filter(|r| r.handle.is_some())
            .map(|r| r.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.take_killed(id).ok())
            .collect()
    }
}
