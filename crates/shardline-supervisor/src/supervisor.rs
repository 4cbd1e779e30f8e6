// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor core.
//!
//! Owns the registry and the scheduler behind one lock and applies every
//! state change: operator requests, scheduler ticks, and lifecycle events
//! coming back from worker parser tasks. The event loop in
//! [`Supervisor::run`] is the only consumer of lifecycle events.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use shardline_protocol::WorkerControl;
use shardline_protocol::coordinator::{
    FleetState, Metrics, QueueStats, ShardStat, StatsPayload, StatusCounts,
};
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::lifecycle::{LifecycleEvent, LifecycleParser, ShardEvent};
use crate::notifier::{Notice, Notifier};
use crate::recovery::{CrashRecoveryPolicy, ExitDisposition, RecoveryAction};
use crate::registry::{ShardRegistry, ShardSnapshot, ShardStatus, Transition};
use crate::runner::{ExitReason, LaunchRequest, Launcher, WorkerProcess};
use crate::scheduler::{StartupMode, StartupScheduler};

/// Settings for the supervisor core.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Number of shards; ids run from 1 to `shard_count`
    pub shard_count: u32,
    /// Debug port base
    pub first_debug_port: u16,
    /// Startup mode
    pub mode: StartupMode,
    /// Restart crashed shards automatically
    pub auto_restart: bool,
    /// Self-managed loading gate capacity
    pub max_loading: usize,
    /// Grace period workers get between SIGTERM and SIGKILL
    pub kill_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            shard_count: 1,
            first_debug_port: 9229,
            mode: StartupMode::SelfManaged,
            auto_restart: false,
            max_loading: 1,
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Extra time allowed past the kill grace before shutdown stops waiting.
const REAP_MARGIN: Duration = Duration::from_secs(1);

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Added to the start queue.
    Queued,
    /// Was already waiting in the start queue.
    AlreadyQueued,
    /// Worker spawned directly.
    Launched,
}

#[derive(Debug, Default)]
struct Counters {
    spawns: AtomicU64,
    spawn_failures: AtomicU64,
    crashes: AtomicU64,
    restarts: AtomicU64,
    cmd_processed: AtomicU64,
    cmd_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Metrics {
        Metrics {
            spawns: self.spawns.load(Ordering::Relaxed),
            spawn_failures: self.spawn_failures.load(Ordering::Relaxed),
            crashes: self.crashes.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            cmd_processed: self.cmd_processed.load(Ordering::Relaxed),
            cmd_errors: self.cmd_errors.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    registry: ShardRegistry,
    scheduler: StartupScheduler,
}

/// The shard supervisor.
pub struct Supervisor {
    settings: SupervisorSettings,
    inner: Mutex<Inner>,
    launcher: Arc<dyn Launcher>,
    notifier: Arc<dyn Notifier>,
    policy: CrashRecoveryPolicy,
    parser: LifecycleParser,
    events_tx: mpsc::UnboundedSender<ShardEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ShardEvent>>>,
    counters: Counters,
    started_at: DateTime<Utc>,
    fleet_loaded: watch::Sender<bool>,
}

impl Supervisor {
    /// Create a supervisor with every shard `down`.
    pub fn new(
        settings: SupervisorSettings,
        launcher: Arc<dyn Launcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (fleet_loaded, _) = watch::channel(false);

        Self {
            inner: Mutex::new(Inner {
                registry: ShardRegistry::new(settings.shard_count, settings.first_debug_port),
                scheduler: StartupScheduler::new(settings.mode, settings.max_loading),
            }),
            launcher,
            notifier,
            policy: CrashRecoveryPolicy::new(settings.auto_restart),
            parser: LifecycleParser::default(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            counters: Counters::default(),
            started_at: Utc::now(),
            fleet_loaded,
            settings,
        }
    }

    /// Startup mode.
    pub fn mode(&self) -> StartupMode {
        self.settings.mode
    }

    /// Number of configured shards.
    pub fn shard_count(&self) -> u32 {
        self.settings.shard_count
    }

    /// Fires `true` once every shard has reached `ok`.
    pub fn subscribe_fleet_loaded(&self) -> watch::Receiver<bool> {
        self.fleet_loaded.subscribe()
    }

    /// Start one shard: enqueue it (self-managed) or launch it (coordinated).
    pub async fn request_start(&self, shard_id: u32) -> Result<StartOutcome> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        match self.settings.mode {
            StartupMode::SelfManaged => {
                if inner.registry.mark_queued(shard_id)? {
                    inner.scheduler.enqueue(shard_id);
                    info!(shard_id, "Shard queued");
                    Ok(StartOutcome::Queued)
                } else {
                    Ok(StartOutcome::AlreadyQueued)
                }
            }
            StartupMode::Coordinated => {
                self.launch_locked(inner, shard_id).await?;
                Ok(StartOutcome::Launched)
            }
        }
    }

    /// Start every shard currently `down`; returns the ids that were started.
    ///
    /// Spawn failures are logged and do not stop the remaining shards.
    pub async fn start_all_down(&self) -> Vec<u32> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let mut started = Vec::new();
        for shard_id in inner.registry.ids_with_status(ShardStatus::Down) {
            let result = match self.settings.mode {
                StartupMode::SelfManaged => inner.registry.mark_queued(shard_id).map(|_| {
                    inner.scheduler.enqueue(shard_id);
                }),
                StartupMode::Coordinated => self.launch_locked(inner, shard_id).await,
            };
            match result {
                Ok(()) => started.push(shard_id),
                Err(e) => warn!(shard_id, error = %e, "Failed to start shard"),
            }
        }

        info!(count = started.len(), mode = ?self.settings.mode, "Started all down shards");
        started
    }

    /// Operator kill: tear the worker down and set the shard `down`.
    pub async fn kill(&self, shard_id: u32) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        inner.registry.kill(shard_id)?;
        inner.scheduler.release(shard_id);
        info!(shard_id, "Shard killed by operator");
        Ok(())
    }

    /// Self-managed scheduling step: launch queued shards while the gate has room.
    pub async fn tick(&self) {
        if self.settings.mode != StartupMode::SelfManaged {
            return;
        }

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        while let Some(shard_id) = inner.scheduler.next_ready(&inner.registry) {
            debug!(shard_id, "Dequeued shard for launch");
            if let Err(e) = self.launch_locked(inner, shard_id).await {
                warn!(shard_id, error = %e, "Queued launch failed");
            }
        }
    }

    /// Apply one lifecycle event.
    pub async fn handle_event(&self, event: ShardEvent) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let ShardEvent {
            shard_id,
            generation,
            event,
        } = event;

        match event {
            LifecycleEvent::LoadingStarted => {
                if inner.registry.loading_started(shard_id, generation) == Transition::Applied {
                    info!(shard_id, generation, "Shard loading");
                    self.notifier.notify(&Notice::LoadingStarted { shard_id });
                }
            }
            LifecycleEvent::FullyLoaded => {
                if inner.registry.fully_loaded(shard_id, generation) == Transition::Applied {
                    inner.scheduler.release(shard_id);
                    info!(shard_id, generation, "Shard fully loaded");
                    self.notifier.notify(&Notice::FullyLoaded { shard_id });
                    self.check_fleet_loaded(&inner.registry);
                }
            }
            LifecycleEvent::Exited(reason) => {
                self.handle_exit(inner, shard_id, generation, reason).await;
            }
        }
    }

    async fn handle_exit(
        &self,
        inner: &mut Inner,
        shard_id: u32,
        generation: u64,
        reason: ExitReason,
    ) {
        let Ok(record) = inner.registry.get(shard_id) else {
            return;
        };
        if record.generation() != generation {
            debug!(shard_id, generation, "Ignoring exit of superseded worker");
            return;
        }

        let disposition =
            self.policy
                .classify(record.status(), record.killed_by_supervisor(), reason);
        inner
            .registry
            .record_exit(shard_id, generation, reason, disposition);
        inner.scheduler.release(shard_id);

        match disposition {
            ExitDisposition::SupervisorKill => {
                debug!(shard_id, generation, exit = %reason, "Killed worker exited");
            }
            ExitDisposition::Untracked => {
                debug!(shard_id, generation, exit = %reason, "Exit of idle shard ignored");
            }
            ExitDisposition::CleanShutdown => {
                info!(shard_id, generation, "Shard shut down cleanly");
                self.notifier.notify(&Notice::CleanShutdown { shard_id });
            }
            ExitDisposition::Crash => {
                Counters::bump(&self.counters.crashes);
                let action = self.policy.on_crash(self.settings.mode);
                warn!(shard_id, generation, exit = %reason, ?action, "Shard crashed");
                self.notifier.notify(&Notice::Crashed {
                    shard_id,
                    exit: reason,
                    action,
                });
                self.recover(inner, shard_id, action).await;
            }
        }
    }

    async fn recover(&self, inner: &mut Inner, shard_id: u32, action: RecoveryAction) {
        match action {
            RecoveryAction::Requeue => match inner.registry.mark_queued(shard_id) {
                Ok(true) => {
                    inner.scheduler.enqueue(shard_id);
                    Counters::bump(&self.counters.restarts);
                    info!(shard_id, "Crashed shard requeued");
                }
                Ok(false) => {}
                Err(e) => warn!(shard_id, error = %e, "Failed to requeue crashed shard"),
            },
            RecoveryAction::Relaunch => match self.launch_locked(inner, shard_id).await {
                Ok(()) => Counters::bump(&self.counters.restarts),
                Err(e) => warn!(shard_id, error = %e, "Failed to relaunch crashed shard"),
            },
            RecoveryAction::LeaveCrashed => {}
        }
    }

    /// Spawn a worker for a shard. Must be called with the lock held.
    async fn launch_locked(&self, inner: &mut Inner, shard_id: u32) -> Result<()> {
        let generation = inner.registry.begin_launch(shard_id)?;
        let request = LaunchRequest {
            shard_id,
            shard_count: self.settings.shard_count,
            generation,
            debug_port: inner.registry.get(shard_id)?.debug_port(),
        };

        match self.launcher.launch(&request).await {
            Ok(WorkerProcess {
                handle,
                stdout,
                exit,
            }) => {
                if let Err(mut stale) = inner.registry.attach_handle(shard_id, handle) {
                    stale.kill();
                    return Err(Error::SpawnFailed {
                        shard_id,
                        reason: "shard state changed during launch".to_string(),
                    });
                }
                self.parser
                    .spawn(shard_id, generation, stdout, exit, self.events_tx.clone());
                Counters::bump(&self.counters.spawns);
                info!(
                    shard_id,
                    generation,
                    launcher = self.launcher.launcher_type(),
                    "Shard launching"
                );
                Ok(())
            }
            Err(e) => {
                inner.registry.launch_failed(shard_id, generation);
                inner.scheduler.release(shard_id);
                Counters::bump(&self.counters.spawn_failures);
                error!(shard_id, generation, error = %e, "Failed to spawn worker");

                let reason = e.to_string();
                self.notifier.notify(&Notice::SpawnFailed {
                    shard_id,
                    reason: reason.clone(),
                });
                Err(Error::SpawnFailed { shard_id, reason })
            }
        }
    }

    fn check_fleet_loaded(&self, registry: &ShardRegistry) {
        if registry.count(ShardStatus::Ok) == registry.len() {
            let changed = self.fleet_loaded.send_if_modified(|loaded| {
                let was = *loaded;
                *loaded = true;
                !was
            });
            if changed {
                info!(shards = registry.len(), "All shards fully loaded");
            }
        }
    }

    /// Status of one shard.
    pub async fn shard_status(&self, shard_id: u32) -> Result<ShardStatus> {
        self.inner.lock().await.registry.status(shard_id)
    }

    /// Snapshot of every shard, ordered by id.
    pub async fn status(&self) -> Vec<ShardSnapshot> {
        self.inner.lock().await.registry.snapshot()
    }

    /// Shard ids waiting in the start queue, head first.
    pub async fn queued(&self) -> Vec<u32> {
        self.inner.lock().await.scheduler.queued()
    }

    /// Ask the worker that owns a guild to evict it; returns the shard id.
    pub async fn evict_guild(&self, guild_id: u64, reason: &str) -> Result<u32> {
        let shard_id = shard_for_guild(guild_id, self.settings.shard_count);
        let inner = self.inner.lock().await;

        let handle = inner
            .registry
            .get(shard_id)?
            .handle()
            .ok_or(Error::NotRunning(shard_id))?;
        handle
            .send_control(&WorkerControl::EvictGuild {
                guild_id: guild_id.to_string(),
                reason: reason.to_string(),
            })
            .map_err(|_| Error::NotRunning(shard_id))?;

        info!(shard_id, guild_id, "Guild eviction sent to worker");
        Ok(shard_id)
    }

    /// Count one operator command.
    pub fn record_command(&self, succeeded: bool) {
        Counters::bump(&self.counters.cmd_processed);
        if !succeeded {
            Counters::bump(&self.counters.cmd_errors);
        }
    }

    /// Counters since start.
    pub fn metrics(&self) -> Metrics {
        self.counters.snapshot()
    }

    /// Build a `postStats` payload.
    pub async fn stats_payload(&self, state: FleetState, error: Option<String>) -> StatsPayload {
        let inner = self.inner.lock().await;
        let shards = inner.registry.snapshot();

        let mut counts = StatusCounts::default();
        for shard in &shards {
            let slot = match shard.status {
                ShardStatus::Down => &mut counts.down,
                ShardStatus::Queued => &mut counts.queued,
                ShardStatus::Launching => &mut counts.launching,
                ShardStatus::Loading => &mut counts.loading,
                ShardStatus::Ok => &mut counts.ok,
                ShardStatus::Crashed => &mut counts.crashed,
            };
            *slot += 1;
        }

        StatsPayload {
            id: "status".to_string(),
            state,
            started_at: Some(self.started_at),
            shards: shards
                .iter()
                .map(|s| ShardStat {
                    id: s.id,
                    status: s.status.as_str().to_string(),
                    pid: s.pid,
                })
                .collect(),
            counts,
            queue: QueueStats {
                queued: inner.scheduler.queue_len() as u32,
                loading: inner.scheduler.loading_count() as u32,
                capacity: inner.scheduler.capacity() as u32,
            },
            metrics: self.counters.snapshot(),
            error,
        }
    }

    /// Kill every live worker and wait for the processes to be reaped.
    ///
    /// Each worker gets the configured kill grace plus a short margin.
    pub async fn shutdown_workers(&self) {
        let killed = self.inner.lock().await.registry.kill_all();
        if killed.is_empty() {
            return;
        }

        let shards: Vec<u32> = killed.iter().map(|h| h.shard_id()).collect();
        info!(shards = ?shards, "Stopping live workers");

        let timeout = self.settings.kill_grace + REAP_MARGIN;
        let waits = killed.into_iter().map(|mut handle| async move {
            let stopped = handle.wait_terminated(timeout).await;
            (handle.shard_id(), stopped)
        });
        for (shard_id, stopped) in join_all(waits).await {
            if !stopped {
                warn!(shard_id, "Worker did not stop in time");
            }
        }
        info!(shards = ?shards, "Live workers stopped");
    }

    /// Run the event loop until `shutdown` is notified.
    ///
    /// Applies lifecycle events as they arrive and ticks the self-managed
    /// scheduler every `tick_interval`.
    pub async fn run(&self, tick_interval: Duration, shutdown: Arc<Notify>) {
        let Some(mut events) = self.events_rx.lock().await.take() else {
            warn!("Supervisor event loop already running");
            return;
        };

        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            shard_count = self.settings.shard_count,
            mode = ?self.settings.mode,
            auto_restart = self.settings.auto_restart,
            tick_interval_ms = tick_interval.as_millis() as u64,
            "Supervisor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("Supervisor shutting down");
                    break;
                }
                Some(event) = events.recv() => {
                    self.handle_event(event).await;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        *self.events_rx.lock().await = Some(events);
    }
}

/// Shard that owns a guild: `((guild_id >> 22) % shard_count) + 1`.
pub fn shard_for_guild(guild_id: u64, shard_count: u32) -> u32 {
    let count = u64::from(shard_count.max(1));
    ((guild_id >> 22) % count) as u32 + 1
}
