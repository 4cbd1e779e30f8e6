// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shardline Protocol - contracts between the supervisor and its peers
//!
//! The supervisor talks to two kinds of peers, and every byte that crosses
//! either boundary is defined here so both sides can depend on one crate.
//!
//! ```text
//!   ┌────────────────────┐   welcome / postStats / requestStartTicket   ┌──────────────┐
//!   │                    │ ───────────────────────────────────────────▶ │              │
//!   │ shardline-         │                                              │ coordinator  │
//!   │ supervisor         │ ◀─────────────────────────────────────────── │              │
//!   │                    │   connected / sendTicket / classicServerBan  └──────────────┘
//!   └────────┬───────────┘
//!            │ argv + stdin control lines        ▲ stdout lifecycle markers
//!            ▼                                   │
//!   ┌────────────────────────────────────────────┴─┐
//!   │            worker process (one per shard)    │
//!   └──────────────────────────────────────────────┘
//! ```
//!
//! - [`markers`]: substrings a worker prints at known lifecycle points
//! - [`control`]: JSON lines the supervisor writes to a worker's stdin
//! - [`coordinator`]: event envelope and payloads for the coordinator socket

pub mod control;
pub mod coordinator;
pub mod markers;

pub use control::WorkerControl;
pub use coordinator::{ClientEvent, Envelope, ProtocolError, ServerEvent};
