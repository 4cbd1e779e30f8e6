// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle markers printed by workers on stdout.
//!
//! Markers are matched as substrings of a single output line. They are a
//! contract with the worker binary and must change on both sides together.

/// Printed once the worker has connected and starts loading its guilds in parallel.
pub const LOADING_STARTED: &str = "guilds in parallel during startup";

/// Printed once the worker has finished loading every pending guild.
pub const FULLY_LOADED: &str = "Loaded all pending guilds!";
