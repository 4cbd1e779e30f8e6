// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker output parser.
//!
//! Turns a worker's stdout into lifecycle events. Every line is relayed to
//! the log; lines containing a lifecycle marker additionally produce an
//! event. The marker strings live in [`shardline_protocol::markers`] and are
//! only matched here.
//!
//! One parser task runs per live worker:
//!
//! ```text
//!   stdout ──▶ line ──▶ log
//!                 └──▶ marker? ──▶ ShardEvent ──▶ supervisor loop
//!   exit   ───────────────────────▶ ShardEvent::Exited (exactly once)
//! ```
//!
//! End of stdout alone does not produce an event; only the exit
//! notification does.

use shardline_protocol::markers;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::runner::{ExitReason, WorkerOutput};

/// Lifecycle event for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The worker started loading in parallel.
    LoadingStarted,
    /// The worker finished loading.
    FullyLoaded,
    /// The worker process is gone.
    Exited(ExitReason),
}

/// A lifecycle event tagged with the worker it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardEvent {
    /// Shard id.
    pub shard_id: u32,
    /// Launch generation of the worker that produced the event.
    pub generation: u64,
    /// What happened.
    pub event: LifecycleEvent,
}

/// Marker matcher.
#[derive(Debug, Clone)]
pub struct LifecycleParser {
    loading_marker: String,
    loaded_marker: String,
}

impl Default for LifecycleParser {
    fn default() -> Self {
        Self::new(markers::LOADING_STARTED, markers::FULLY_LOADED)
    }
}

impl LifecycleParser {
    /// Create a parser for custom marker strings.
    pub fn new(loading_marker: impl Into<String>, loaded_marker: impl Into<String>) -> Self {
        Self {
            loading_marker: loading_marker.into(),
            loaded_marker: loaded_marker.into(),
        }
    }

    /// Event carried by a single output line, if any.
    pub fn classify(&self, line: &str) -> Option<LifecycleEvent> {
        if line.contains(&self.loaded_marker) {
            Some(LifecycleEvent::FullyLoaded)
        } else if line.contains(&self.loading_marker) {
            Some(LifecycleEvent::LoadingStarted)
        } else {
            None
        }
    }

    /// Spawn the parser task for one worker.
    pub fn spawn(
        &self,
        shard_id: u32,
        generation: u64,
        stdout: WorkerOutput,
        exit: oneshot::Receiver<ExitReason>,
        events: mpsc::UnboundedSender<ShardEvent>,
    ) -> JoinHandle<()> {
        let parser = self.clone();
        tokio::spawn(async move {
            parser
                .run(shard_id, generation, stdout, exit, events)
                .await
        })
    }

    /// Read lines until the worker exits, then report the exit.
    ///
    /// Buffered output is always drained ahead of the exit notification, so
    /// markers printed right before exiting still count. Every marker line is
    /// forwarded; the registry decides whether it applies.
    pub async fn run(
        &self,
        shard_id: u32,
        generation: u64,
        mut stdout: WorkerOutput,
        mut exit: oneshot::Receiver<ExitReason>,
        events: mpsc::UnboundedSender<ShardEvent>,
    ) {
        let emit = |event: LifecycleEvent| {
            let _ = events.send(ShardEvent {
                shard_id,
                generation,
                event,
            });
        };

        let mut buf = Vec::new();
        let mut stdout_open = true;

        let reason = loop {
            tokio::select! {
                biased;

                read = stdout.read_until(b'\n', &mut buf), if stdout_open => {
                    match read {
                        Ok(0) => {
                            debug!(shard_id, generation, "Worker stdout closed");
                            stdout_open = false;
                        }
                        Ok(_) => {
                            let text = String::from_utf8_lossy(&buf);
                            let line = text.trim_end();
                            info!(shard_id, "{}", line);

                            if let Some(event) = self.classify(line) {
                                emit(event);
                            }
                            buf.clear();
                        }
                        Err(e) => {
                            warn!(shard_id, generation, error = %e, "Failed to read worker stdout");
                            stdout_open = false;
                        }
                    }
                }
                result = &mut exit => {
                    break result.unwrap_or(ExitReason::Unknown);
                }
            }
        };

        debug!(shard_id, generation, exit = %reason, "Worker exit observed");
        emit(LifecycleEvent::Exited(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader};

    fn worker() -> (
        tokio::io::DuplexStream,
        WorkerOutput,
        oneshot::Sender<ExitReason>,
        oneshot::Receiver<ExitReason>,
    ) {
        let (writer, reader) = tokio::io::duplex(4096);
        let (exit_tx, exit_rx) = oneshot::channel();
        (writer, Box::pin(BufReader::new(reader)), exit_tx, exit_rx)
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<ShardEvent>) -> Vec<LifecycleEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event.event);
        }
        out
    }

    #[test]
    fn test_classify_markers() {
        let parser = LifecycleParser::default();
        assert_eq!(
            parser.classify("[shard 1] 1200 guilds in parallel during startup"),
            Some(LifecycleEvent::LoadingStarted)
        );
        assert_eq!(
            parser.classify("Loaded all pending guilds! took 30s"),
            Some(LifecycleEvent::FullyLoaded)
        );
        assert_eq!(parser.classify("connected to gateway"), None);
        assert_eq!(parser.classify(""), None);
    }

    #[test]
    fn test_custom_markers() {
        let parser = LifecycleParser::new("BOOT", "READY");
        assert_eq!(parser.classify("BOOT 1/2"), Some(LifecycleEvent::LoadingStarted));
        assert_eq!(parser.classify("all READY"), Some(LifecycleEvent::FullyLoaded));
    }

    #[tokio::test]
    async fn test_every_marker_line_is_forwarded() {
        let parser = LifecycleParser::default();
        let (mut writer, stdout, exit_tx, exit_rx) = worker();
        let (tx, rx) = mpsc::unbounded_channel();

        let task = parser.spawn(3, 7, stdout, exit_rx, tx);

        writer
            .write_all(
                b"booting\n4 guilds in parallel during startup\nnoise\n\
                  4 guilds in parallel during startup\nLoaded all pending guilds!\n\
                  Loaded all pending guilds!\n",
            )
            .await
            .unwrap();
        drop(writer);
        exit_tx.send(ExitReason::Code(2)).unwrap();
        task.await.unwrap();

        assert_eq!(
            collect(rx).await,
            vec![
                LifecycleEvent::LoadingStarted,
                LifecycleEvent::LoadingStarted,
                LifecycleEvent::FullyLoaded,
                LifecycleEvent::FullyLoaded,
                LifecycleEvent::Exited(ExitReason::Code(2)),
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_close_without_exit_emits_nothing() {
        let parser = LifecycleParser::default();
        let (mut writer, stdout, exit_tx, exit_rx) = worker();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = parser.spawn(1, 1, stdout, exit_rx, tx);
        writer.write_all(b"only a log line\n").await.unwrap();
        drop(writer);

        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert!(!task.is_finished());

        exit_tx.send(ExitReason::Signal(9)).unwrap();
        task.await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, LifecycleEvent::Exited(ExitReason::Signal(9)));
        assert_eq!((event.shard_id, event.generation), (1, 1));
    }

    #[tokio::test]
    async fn test_dropped_exit_sender_reports_unknown() {
        let parser = LifecycleParser::default();
        let (writer, stdout, exit_tx, exit_rx) = worker();
        let (tx, rx) = mpsc::unbounded_channel();

        drop(writer);
        drop(exit_tx);
        parser.run(2, 1, stdout, exit_rx, tx).await;

        assert_eq!(
            collect(rx).await,
            vec![LifecycleEvent::Exited(ExitReason::Unknown)]
        );
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_tolerated() {
        let parser = LifecycleParser::default();
        let (mut writer, stdout, exit_tx, exit_rx) = worker();
        let (tx, rx) = mpsc::unbounded_channel();

        writer
            .write_all(b"\xff\xfe junk\nLoaded all pending guilds!\n")
            .await
            .unwrap();
        drop(writer);
        exit_tx.send(ExitReason::Code(0)).unwrap();
        parser.run(1, 1, stdout, exit_rx, tx).await;

        assert_eq!(
            collect(rx).await,
            vec![
                LifecycleEvent::FullyLoaded,
                LifecycleEvent::Exited(ExitReason::Code(0)),
            ]
        );
    }
}
