// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control lines written by the supervisor to a worker's stdin.
//!
//! Each message is one JSON object terminated by `\n`.

use serde::{Deserialize, Serialize};

/// A control instruction for a running worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerControl {
    /// The worker must notify the guild owner and leave the guild.
    #[serde(rename_all = "camelCase")]
    EvictGuild {
        /// Guild snowflake.
        guild_id: String,
        /// Reason forwarded from the coordinator.
        reason: String,
    },
}

impl WorkerControl {
    /// Encode as a single newline-terminated line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one line (trailing whitespace is ignored).
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}
