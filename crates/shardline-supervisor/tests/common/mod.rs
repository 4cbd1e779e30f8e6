// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for shardline-supervisor integration tests.
//!
//! Provides [`TestFleet`]: a supervisor running its event loop against a
//! [`MockLauncher`], plus helpers to wait for shard states.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use shardline_protocol::markers;
use shardline_supervisor::ShardStatus;
use shardline_supervisor::notifier::RecordingNotifier;
use shardline_supervisor::runner::MockLauncher;
use shardline_supervisor::scheduler::StartupMode;
use shardline_supervisor::supervisor::{Supervisor, SupervisorSettings};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// How long a wait helper polls before failing the test.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// A supervisor with a running event loop and a scriptable launcher.
pub struct TestFleet {
    pub supervisor: Arc<Supervisor>,
    pub launcher: MockLauncher,
    pub notifier: RecordingNotifier,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl TestFleet {
    /// Start a fleet of `shard_count` shards.
    pub fn start(
        shard_count: u32,
        mode: StartupMode,
        auto_restart: bool,
        tick_interval: Duration,
    ) -> Self {
        let launcher = MockLauncher::new();
        let notifier = RecordingNotifier::new();
        let supervisor = Arc::new(Supervisor::new(
            SupervisorSettings {
                shard_count,
                mode,
                auto_restart,
                ..Default::default()
            },
            Arc::new(launcher.clone()),
            Arc::new(notifier.clone()),
        ));

        let shutdown = Arc::new(Notify::new());
        let handle = {
            let supervisor = supervisor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { supervisor.run(tick_interval, shutdown).await })
        };

        Self {
            supervisor,
            launcher,
            notifier,
            shutdown,
            handle,
        }
    }

    /// Self-managed fleet ticking every 20ms.
    pub fn self_managed(shard_count: u32, auto_restart: bool) -> Self {
        Self::start(
            shard_count,
            StartupMode::SelfManaged,
            auto_restart,
            Duration::from_millis(20),
        )
    }

    /// Coordinated fleet; the tick is irrelevant there.
    pub fn coordinated(shard_count: u32, auto_restart: bool) -> Self {
        Self::start(
            shard_count,
            StartupMode::Coordinated,
            auto_restart,
            Duration::from_secs(3600),
        )
    }

    /// Current status of a shard.
    pub async fn status(&self, shard_id: u32) -> ShardStatus {
        self.supervisor.shard_status(shard_id).await.unwrap()
    }

    /// Number of shards in a status.
    pub async fn count(&self, status: ShardStatus) -> usize {
        self.supervisor
            .status()
            .await
            .iter()
            .filter(|s| s.status == status)
            .count()
    }

    /// Poll until a shard reaches `status`.
    pub async fn wait_for_status(&self, shard_id: u32, status: ShardStatus) {
        let start = tokio::time::Instant::now();
        loop {
            let current = self.status(shard_id).await;
            if current == status {
                return;
            }
            if start.elapsed() > WAIT_TIMEOUT {
                panic!(
                    "shard {} stuck in {} waiting for {}",
                    shard_id, current, status
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Print the loading marker from a shard's worker.
    pub async fn emit_loading(&self, shard_id: u32) {
        let line = format!("[{}] 1500 {}", shard_id, markers::LOADING_STARTED);
        assert!(self.launcher.emit_line(shard_id, &line).await);
    }

    /// Print the fully-loaded marker from a shard's worker.
    pub async fn emit_loaded(&self, shard_id: u32) {
        assert!(
            self.launcher
                .emit_line(shard_id, markers::FULLY_LOADED)
                .await
        );
    }

    /// Walk a launching shard to `ok`.
    pub async fn drive_to_ok(&self, shard_id: u32) {
        self.wait_for_status(shard_id, ShardStatus::Launching).await;
        self.emit_loading(shard_id).await;
        self.wait_for_status(shard_id, ShardStatus::Loading).await;
        self.emit_loaded(shard_id).await;
        self.wait_for_status(shard_id, ShardStatus::Ok).await;
    }

    /// Stop the event loop.
    pub async fn stop(self) {
        self.supervisor.shutdown_workers().await;
        self.shutdown.notify_one();
        let _ = tokio::time::timeout(WAIT_TIMEOUT, self.handle).await;
    }
}

/// Poll an async condition until it holds.
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while !condition().await {
        if start.elapsed() > WAIT_TIMEOUT {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
