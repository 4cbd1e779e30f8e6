// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coordinator wire format.
//!
//! Every websocket text frame carries one [`Envelope`]:
//!
//! ```json
//! { "event": "postStats", "data": { ... } }
//! ```
//!
//! The event name selects the payload type. Events without a payload omit
//! `data` (or send `null`). Unknown inbound events are reported as
//! [`ProtocolError::UnknownEvent`] so the caller can log and skip them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Outbound event names.
pub mod events {
    /// Supervisor identity announcement, sent right after connecting.
    pub const WELCOME: &str = "welcome";
    /// Ask the coordinator for permission to start shards.
    pub const REQUEST_START_TICKET: &str = "requestStartTicket";
    /// Every shard finished loading after a ticket grant.
    pub const TICKET_FINISH_LOAD: &str = "ticketFinishLoad";
    /// Periodic status report.
    pub const POST_STATS: &str = "postStats";

    /// Coordinator accepted the welcome.
    pub const CONNECTED: &str = "connected";
    /// Coordinator rejected something we sent.
    pub const CLIENT_ERROR: &str = "clientError";
    /// Startup ticket granted.
    pub const SEND_TICKET: &str = "sendTicket";
    /// Startup ticket denied for now.
    pub const TICKET_DENIED: &str = "ticketDenied";
    /// A guild was banned and must be evicted by the shard that owns it.
    pub const CLASSIC_SERVER_BAN: &str = "classicServerBan";
}

/// Errors raised while encoding or decoding coordinator frames.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown event: {0}")]
    UnknownEvent(String),
}

/// A single coordinator frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Envelope {
    /// Build an envelope with a typed payload.
    pub fn new<T: Serialize>(event: &str, data: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            event: event.to_string(),
            data: serde_json::to_value(data)?,
        })
    }

    /// Build an envelope without payload.
    pub fn bare(event: &str) -> Self {
        Self {
            event: event.to_string(),
            data: Value::Null,
        }
    }

    /// Encode to the JSON text carried by one websocket frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a websocket text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Identity announced by the supervisor in `welcome`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    /// First shard id managed by this supervisor (inclusive).
    pub shard_first: u32,
    /// Last shard id managed by this supervisor (inclusive).
    pub shard_last: u32,
    /// Total shard count of the deployment.
    pub shard_count: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
}

/// Guild ban notice pushed by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildBan {
    /// Guild snowflake.
    pub id: String,
    pub reason: String,
}

/// Overall supervisor state as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FleetState {
    /// No startup ticket yet.
    Waiting,
    /// Ticket granted, fleet still loading.
    Starting,
    /// Every shard has reached `ok` at least once.
    Running,
}

/// Status of one shard in a stats report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStat {
    pub id: u32,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Shard counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub down: u32,
    pub queued: u32,
    pub launching: u32,
    pub loading: u32,
    pub ok: u32,
    pub crashed: u32,
}

/// Startup queue sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Entries waiting in the start queue.
    pub queued: u32,
    /// Shards currently holding a loading slot.
    pub loading: u32,
    /// Loading slots available.
    pub capacity: u32,
}

/// Request and error counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub spawns: u64,
    pub spawn_failures: u64,
    pub crashes: u64,
    pub restarts: u64,
    pub cmd_processed: u64,
    pub cmd_errors: u64,
}

/// Payload of `postStats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsPayload {
    /// Always `"status"`.
    pub id: String,
    pub state: FleetState,
    pub started_at: Option<DateTime<Utc>>,
    pub shards: Vec<ShardStat>,
    pub counts: StatusCounts,
    pub queue: QueueStats,
    pub metrics: Metrics,
    #[serde(default)]
    pub error: Option<String>,
}

/// Events sent by the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Welcome(Welcome),
    RequestStartTicket,
    TicketFinishLoad,
    PostStats(Box<StatsPayload>),
}

impl ClientEvent {
    /// Wrap into an envelope.
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        match self {
            ClientEvent::Welcome(welcome) => Envelope::new(events::WELCOME, welcome),
            ClientEvent::RequestStartTicket => Ok(Envelope::bare(events::REQUEST_START_TICKET)),
            ClientEvent::TicketFinishLoad => Ok(Envelope::bare(events::TICKET_FINISH_LOAD)),
            ClientEvent::PostStats(stats) => Envelope::new(events::POST_STATS, stats),
        }
    }

    /// Encode straight to frame text.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_envelope()?.encode()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ClientErrorPayload {
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Default, Deserialize)]
struct TicketDeniedPayload {
    #[serde(default)]
    reason: Option<String>,
}

/// Events received from the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Connected,
    ClientError { msg: String },
    /// The ticket body is opaque to the supervisor.
    SendTicket(Value),
    TicketDenied { reason: Option<String> },
    ClassicServerBan(GuildBan),
}

impl ServerEvent {
    /// Interpret an envelope.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        match envelope.event.as_str() {
            events::CONNECTED => Ok(ServerEvent::Connected),
            events::CLIENT_ERROR => {
                let payload: ClientErrorPayload = if envelope.data.is_null() {
                    ClientErrorPayload::default()
                } else {
                    envelope.payload()?
                };
                Ok(ServerEvent::ClientError { msg: payload.msg })
            }
            events::SEND_TICKET => Ok(ServerEvent::SendTicket(envelope.data.clone())),
            events::TICKET_DENIED => {
                let payload: TicketDeniedPayload = if envelope.data.is_null() {
                    TicketDeniedPayload::default()
                } else {
                    envelope.payload()?
                };
                Ok(ServerEvent::TicketDenied {
                    reason: payload.reason,
                })
            }
            events::CLASSIC_SERVER_BAN => Ok(ServerEvent::ClassicServerBan(envelope.payload()?)),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    /// Decode frame text.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Self::from_envelope(&Envelope::decode(text)?)
    }

    /// Encode (used by coordinators and tests).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let envelope = match self {
            ServerEvent::Connected => Envelope::bare(events::CONNECTED),
            ServerEvent::ClientError { msg } => {
                Envelope::new(events::CLIENT_ERROR, &serde_json::json!({ "msg": msg }))?
            }
            ServerEvent::SendTicket(ticket) => Envelope {
                event: events::SEND_TICKET.to_string(),
                data: ticket.clone(),
            },
            ServerEvent::TicketDenied { reason } => {
                Envelope::new(events::TICKET_DENIED, &serde_json::json!({ "reason": reason }))?
            }
            ServerEvent::ClassicServerBan(ban) => Envelope::new(events::CLASSIC_SERVER_BAN, ban)?,
        };
        envelope.encode()
    }
}

/// Decode a supervisor frame (coordinator side).
pub fn decode_client_event(text: &str) -> Result<ClientEvent, ProtocolError> {
    let envelope = Envelope::decode(text)?;
    match envelope.event.as_str() {
        events::WELCOME => Ok(ClientEvent::Welcome(envelope.payload()?)),
        events::REQUEST_START_TICKET => Ok(ClientEvent::RequestStartTicket),
        events::TICKET_FINISH_LOAD => Ok(ClientEvent::TicketFinishLoad),
        events::POST_STATS => Ok(ClientEvent::PostStats(Box::new(envelope.payload()?))),
        other => Err(ProtocolError::UnknownEvent(other.to_string())),
    }
}
