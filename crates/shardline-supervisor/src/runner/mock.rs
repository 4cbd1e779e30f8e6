// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock launcher for testing.
//!
//! Simulates worker processes in memory. Tests drive each fake worker by
//! writing stdout lines and choosing when and how it exits.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{Mutex, mpsc, oneshot};

use super::traits::*;

/// Fake worker state.
struct MockWorker {
    generation: u64,
    stdout: Option<DuplexStream>,
    exit_tx: Option<oneshot::Sender<ExitReason>>,
}

/// Mock launcher for testing.
#[derive(Clone, Default)]
pub struct MockLauncher {
    workers: Arc<Mutex<HashMap<u32, MockWorker>>>,
    spawns: Arc<Mutex<HashMap<u32, u32>>>,
    failures_remaining: Arc<AtomicU32>,
    control: Arc<Mutex<Vec<(u32, String)>>>,
}

impl MockLauncher {
    /// Create a new mock launcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` launches fail as if the executable were missing.
    pub fn fail_next_launches(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Write one stdout line for a live worker.
    pub async fn emit_line(&self, shard_id: u32, line: &str) -> bool {
        let mut workers = self.workers.lock().await;
        let Some(stdout) = workers.get_mut(&shard_id).and_then(|w| w.stdout.as_mut()) else {
            return false;
        };
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        stdout.write_all(&data).await.is_ok()
    }

    /// Close a worker's stdout without ending the process.
    pub async fn close_stdout(&self, shard_id: u32) -> bool {
        let mut workers = self.workers.lock().await;
        workers
            .get_mut(&shard_id)
            .and_then(|w| w.stdout.take())
            .is_some()
    }

    /// End a live worker with the given reason.
    pub async fn exit(&self, shard_id: u32, reason: ExitReason) -> bool {
        let mut workers = self.workers.lock().await;
        match workers.get_mut(&shard_id).and_then(|w| w.exit_tx.take()) {
            Some(tx) => tx.send(reason).is_ok(),
            None => false,
        }
    }

    /// Whether a fake worker is alive for the shard.
    pub async fn is_alive(&self, shard_id: u32) -> bool {
        self.workers.lock().await.contains_key(&shard_id)
    }

    /// Number of successful launches for one shard.
    pub async fn spawn_count(&self, shard_id: u32) -> u32 {
        self.spawns
            .lock()
            .await
            .get(&shard_id)
            .copied()
            .unwrap_or(0)
    }

    /// Number of successful launches across all shards.
    pub async fn total_spawns(&self) -> u32 {
        self.spawns.lock().await.values().sum()
    }

    /// Control lines written to a shard's workers, oldest first.
    pub async fn control_lines(&self, shard_id: u32) -> Vec<String> {
        self.control
            .lock()
            .await
            .iter()
            .filter(|(id, _)| *id == shard_id)
            .map(|(_, line)| line.clone())
            .collect()
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    fn launcher_type(&self) -> &'static str {
        "mock"
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<WorkerProcess> {
        let failures = self.failures_remaining.load(Ordering::SeqCst);
        if failures > 0 {
            self.failures_remaining.store(failures - 1, Ordering::SeqCst);
            return Err(LaunchError::ProgramNotFound("mock-worker".to_string()));
        }

        let shard_id = request.shard_id;
        let generation = request.generation;

        let (writer, reader) = tokio::io::duplex(64 * 1024);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (crash_tx, crash_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (terminated_tx, terminated_rx) = oneshot::channel();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<String>();

        self.workers.lock().await.insert(
            shard_id,
            MockWorker {
                generation,
                stdout: Some(writer),
                exit_tx: Some(crash_tx),
            },
        );
        *self.spawns.lock().await.entry(shard_id).or_insert(0) += 1;

        // Process lifetime: ends on a scripted exit or a kill request.
        let workers = self.workers.clone();
        tokio::spawn(async move {
            let reason = tokio::select! {
                Ok(reason) = crash_rx => reason,
                Ok(()) = kill_rx => ExitReason::Killed,
                else => ExitReason::Unknown,
            };

            {
                let mut workers = workers.lock().await;
                if workers.get(&shard_id).map(|w| w.generation) == Some(generation) {
                    workers.remove(&shard_id);
                }
            }

            let _ = exit_tx.send(reason);
            let _ = terminated_tx.send(());
        });

        let control = self.control.clone();
        tokio::spawn(async move {
            while let Some(line) = control_rx.recv().await {
                control
                    .lock()
                    .await
                    .push((shard_id, line.trim_end().to_string()));
            }
        });

        Ok(WorkerProcess {
            handle: WorkerHandle::new(
                shard_id,
                generation,
                None,
                kill_tx,
                control_tx,
                terminated_rx,
            ),
            stdout: Box::pin(BufReader::new(reader)),
            exit: exit_rx,
        })
    }
}
