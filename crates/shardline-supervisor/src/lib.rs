// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shardline Supervisor - Shard Process Supervision
//!
//! This crate runs a fleet of worker processes, one per shard of a
//! partitioned workload. It launches workers, follows their lifecycle by
//! reading marker lines from stdout, throttles startup, recovers crashed
//! workers and exposes the fleet to operators.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   .start / .kill / .botstatus    ┌──────────────────────────┐
//! │  Operators   │ ───────────────────────────────▶ │    OperatorInterface     │
//! └──────────────┘                                  └────────────┬─────────────┘
//!                                                                │
//! ┌──────────────┐   ticket / bans    ┌──────────────────────────▼─────────────┐
//! │ Coordinator  │ ◀────────────────▶ │               Supervisor               │
//! │ (optional)   │   postStats        │  ┌───────────────┐ ┌────────────────┐  │
//! └──────────────┘                    │  │ ShardRegistry │ │StartupScheduler│  │
//!                                     │  └───────────────┘ └────────────────┘  │
//!                                     │  ┌───────────────────────────────────┐ │
//!                                     │  │        CrashRecoveryPolicy        │ │
//!                                     │  └───────────────────────────────────┘ │
//!                                     └──────┬──────────────────────▲──────────┘
//!                                    launch  │                      │ ShardEvent
//!                                            ▼                      │
//!                                     ┌──────────────┐      ┌───────┴─────────┐
//!                                     │   Launcher   │─────▶│ LifecycleParser │
//!                                     └──────┬───────┘stdout└─────────────────┘
//!                                            │ spawn
//!                                            ▼
//!                                     ┌──────────────────────────────────────┐
//!                                     │   Worker processes (one per shard)   │
//!                                     └──────────────────────────────────────┘
//! ```
//!
//! # Shard Status State Machine
//!
//! ```text
//!   DOWN ──enqueue──▶ QUEUED ──dequeue──▶ LAUNCHING ──marker──▶ LOADING ──marker──▶ OK
//!    ▲                  ▲                     │                    │                │
//!    │                  │ requeue             └──────── exit ──────┴────── exit ────┤
//!    │                  │                              ▼                            │
//!    │               CRASHED ◀─────────────────────────┘                            │
//!    └───────────────────────────── operator kill / clean exit ─────────────────────┘
//! ```
//!
//! # Startup Modes
//!
//! | Mode | Selected by | Behaviour |
//! |------|-------------|-----------|
//! | Self-managed | no coordinator URL | FIFO queue, at most `max_loading` shards loading at once |
//! | Coordinated | `SHARDLINE_COORDINATOR_URL` | every shard launches once a ticket is granted |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `SHARDLINE_SHARD_COUNT` | Yes | - | Number of shards |
//! | `SHARDLINE_WORKER_TOKEN` | Yes | - | Token passed to every worker |
//! | `SHARDLINE_WORKER_PROGRAM` | No | `node` | Runtime executable |
//! | `SHARDLINE_WORKER_ENTRYPOINT` | No | `./bin/bot.js` | Worker entrypoint |
//! | `SHARDLINE_FIRST_DEBUG_PORT` | No | `9229` | Debug port base |
//! | `SHARDLINE_DEBUG` / `SHARDLINE_DEBUG_BREAK` | No | `false` | Debugger flag |
//! | `SHARDLINE_DISABLE_BROKER` | No | `true` | Pass `--no-rabbitmq` |
//! | `SHARDLINE_AUTO_RESTART` | No | `false` | Restart crashed shards |
//! | `SHARDLINE_TICK_INTERVAL_SECS` | No | `10` | Queue tick |
//! | `SHARDLINE_MAX_LOADING` | No | `1` | Loading gate capacity |
//! | `SHARDLINE_QUEUE_ON_START` | No | `false` | Queue every shard at boot |
//! | `SHARDLINE_KILL_GRACE_MS` | No | `5000` | SIGTERM to SIGKILL delay |
//! | `SHARDLINE_OPERATORS` | No | - | Comma-separated operator ids |
//! | `SHARDLINE_CONSOLE_OPERATOR` | No | `console` | Identity of stdin commands |
//! | `SHARDLINE_COORDINATOR_URL` | No | - | Coordinator websocket |
//! | `SHARDLINE_COORDINATOR_KEY` | With URL | - | Coordinator key |
//! | `SHARDLINE_REQUIRE_TICKET` | No | `true` | Wait for a ticket grant |
//! | `SHARDLINE_COORDINATOR_RETRY_SECS` | No | `10` | Reconnect delay |
//! | `SHARDLINE_STATS_INTERVAL_SECS` | No | `5` | Stats interval |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types
//! - [`registry`]: Shard table and state machine
//! - [`runner`]: Worker launch backends
//! - [`lifecycle`]: Marker parsing of worker output
//! - [`scheduler`]: Start queue and loading gate
//! - [`recovery`]: Crash recovery policy
//! - [`supervisor`]: Supervisor core and event loop
//! - [`coordinator`]: External coordinator client
//! - [`operator`]: Operator commands
//! - [`notifier`]: Operator notifications
//! - [`runtime`]: Embeddable runtime

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for supervisor operations.
pub mod error;

/// Shard table and state machine.
pub mod registry;

/// Worker launch backends (process, mock).
pub mod runner;

/// Worker stdout parsing into lifecycle events.
pub mod lifecycle;

/// Start queue and loading gate.
pub mod scheduler;

/// Crash recovery policy.
pub mod recovery;

/// Supervisor core and event loop.
pub mod supervisor;

/// External coordinator client.
pub mod coordinator;

/// Operator command surface.
pub mod operator;

/// Operator notifications.
pub mod notifier;

/// Embeddable runtime.
pub mod runtime;

pub use config::Config;
pub use error::Error;
pub use registry::ShardStatus;
pub use supervisor::Supervisor;
