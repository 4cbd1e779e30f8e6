// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External coordinator client.
//!
//! Keeps a websocket session to the coordinator alive for the life of the
//! supervisor. Each session:
//!
//! 1. sends `welcome` with our shard range and key
//! 2. on `connected`, asks for a start ticket (unless one is already held)
//! 3. posts stats every `stats_interval`
//! 4. re-requests the ticket `retry_interval` after a denial
//! 5. sends `ticketFinishLoad` once the whole fleet is loaded
//!
//! Ban notices are forwarded to the caller. A lost connection is logged and
//! retried after `retry_interval`; it never affects running shards.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use shardline_protocol::coordinator::{
    ClientEvent, FleetState, GuildBan, ServerEvent, StatsPayload, Welcome,
};
use shardline_protocol::ProtocolError;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use crate::supervisor::Supervisor;

/// Coordinator connection settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Websocket URL
    pub url: String,
    /// Authentication key sent in `welcome`
    pub key: String,
    /// Wait for a ticket grant before starting shards
    pub require_ticket: bool,
    /// Reconnect and ticket re-request delay
    pub retry_interval: Duration,
    /// `postStats` interval
    pub stats_interval: Duration,
}

/// Coordinator client errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoordinatorError {
    /// Websocket transport failed.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A frame could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<CoordinatorError> for crate::error::Error {
    fn from(err: CoordinatorError) -> Self {
        crate::error::Error::CoordinatorUnavailable(err.to_string())
    }
}

/// Startup ticket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    /// No ticket yet.
    Waiting,
    /// Shards may start.
    Granted,
}

/// Source of `postStats` payloads.
#[async_trait]
pub trait StatsSource: Send + Sync {
    /// Build the current payload.
    async fn stats(&self, state: FleetState) -> StatsPayload;
}

#[async_trait]
impl StatsSource for Supervisor {
    async fn stats(&self, state: FleetState) -> StatsPayload {
        self.stats_payload(state, None).await
    }
}

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Client for the external coordinator.
pub struct CoordinatorClient {
    config: CoordinatorConfig,
    welcome: Welcome,
    stats: Arc<dyn StatsSource>,
    ticket: watch::Sender<TicketState>,
    fleet_loaded: watch::Receiver<bool>,
    bans: mpsc::UnboundedSender<GuildBan>,
    finish_load_sent: AtomicBool,
    shutdown: Arc<Notify>,
}

impl CoordinatorClient {
    /// Create a client for a supervisor managing shards `1..=shard_count`.
    ///
    /// Returns the client and the receiving end of the ban notice channel.
    pub fn new(
        config: CoordinatorConfig,
        shard_count: u32,
        stats: Arc<dyn StatsSource>,
        fleet_loaded: watch::Receiver<bool>,
    ) -> (Self, mpsc::UnboundedReceiver<GuildBan>) {
        let (ticket, _) = watch::channel(TicketState::Waiting);
        let (bans, bans_rx) = mpsc::unbounded_channel();
        let welcome = Welcome {
            shard_first: 1,
            shard_last: shard_count,
            shard_count,
            kind: "controller".to_string(),
            key: config.key.clone(),
        };

        let client = Self {
            config,
            welcome,
            stats,
            ticket,
            fleet_loaded,
            bans,
            finish_load_sent: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        };
        (client, bans_rx)
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Watch the ticket state.
    pub fn ticket(&self) -> watch::Receiver<TicketState> {
        self.ticket.subscribe()
    }

    /// Overall state reported in `postStats`.
    pub fn fleet_state(&self) -> FleetState {
        if *self.ticket.borrow() == TicketState::Waiting {
            FleetState::Waiting
        } else if *self.fleet_loaded.borrow() {
            FleetState::Running
        } else {
            FleetState::Starting
        }
    }

    /// Run sessions until shutdown, reconnecting after every failure.
    pub async fn run(&self) {
        info!(
            url = %self.config.url,
            require_ticket = self.config.require_ticket,
            "Coordinator client started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Coordinator client shutting down");
                    return;
                }
                result = self.session() => {
                    match result {
                        Ok(()) => info!("Coordinator connection closed"),
                        Err(e) => {
                            let err = crate::error::Error::from(e);
                            warn!(error = %err, "Coordinator session failed");
                        }
                    }
                }
            }

            debug!(
                retry_secs = self.config.retry_interval.as_secs_f64(),
                "Reconnecting to coordinator"
            );
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Coordinator client shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.config.retry_interval) => {}
            }
        }
    }

    async fn session(&self) -> Result<(), CoordinatorError> {
        let (stream, _) = connect_async(self.config.url.as_str()).await?;
        let (mut write, mut read) = stream.split();

        send(&mut write, ClientEvent::Welcome(self.welcome.clone())).await?;
        info!(
            shard_first = self.welcome.shard_first,
            shard_last = self.welcome.shard_last,
            "Connected to coordinator"
        );

        if !self.config.require_ticket {
            self.grant();
        }

        let mut fleet_loaded = self.fleet_loaded.clone();
        let loaded = *fleet_loaded.borrow_and_update();
        self.maybe_finish_load(&mut write, loaded).await?;

        let mut stats_ticker = tokio::time::interval(self.config.stats_interval);
        stats_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticket_retry: Option<Instant> = None;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(at) = self.handle_frame(&text, &mut write).await? {
                                ticket_retry = Some(at);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        _ => {}
                    }
                }
                _ = stats_ticker.tick() => {
                    let payload = self.stats.stats(self.fleet_state()).await;
                    send(&mut write, ClientEvent::PostStats(Box::new(payload))).await?;
                }
                _ = tokio::time::sleep_until(ticket_retry.unwrap_or_else(Instant::now)), if ticket_retry.is_some() => {
                    ticket_retry = None;
                    if *self.ticket.borrow() == TicketState::Waiting {
                        info!("Requesting start ticket again");
                        send(&mut write, ClientEvent::RequestStartTicket).await?;
                    }
                }
                Ok(()) = fleet_loaded.changed() => {
                    let loaded = *fleet_loaded.borrow_and_update();
                    self.maybe_finish_load(&mut write, loaded).await?;
                }
            }
        }
    }

    /// Apply one inbound frame; returns when to re-request a denied ticket.
    async fn handle_frame(
        &self,
        text: &str,
        write: &mut WsWriter,
    ) -> Result<Option<Instant>, CoordinatorError> {
        let event = match ServerEvent::decode(text) {
            Ok(event) => event,
            Err(ProtocolError::UnknownEvent(name)) => {
                debug!(event = %name, "Ignoring unknown coordinator event");
                return Ok(None);
            }
            Err(e) => {
                warn!(error = %e, "Malformed coordinator frame");
                return Ok(None);
            }
        };

        match event {
            ServerEvent::Connected => {
                info!("Coordinator accepted welcome");
                if *self.ticket.borrow() == TicketState::Waiting {
                    send(write, ClientEvent::RequestStartTicket).await?;
                    info!("Requested start ticket");
                }
            }
            ServerEvent::ClientError { msg } => {
                error!(message = %msg, "Coordinator reported a client error");
            }
            ServerEvent::SendTicket(_) => {
                self.grant();
                let loaded = *self.fleet_loaded.borrow();
                self.maybe_finish_load(write, loaded).await?;
            }
            ServerEvent::TicketDenied { reason } => {
                warn!(
                    reason = reason.as_deref().unwrap_or("none"),
                    retry_secs = self.config.retry_interval.as_secs_f64(),
                    "Start ticket denied"
                );
                return Ok(Some(Instant::now() + self.config.retry_interval));
            }
            ServerEvent::ClassicServerBan(ban) => {
                info!(guild_id = %ban.id, "Guild ban notice received");
                let _ = self.bans.send(ban);
            }
        }
        Ok(None)
    }

    fn grant(&self) {
        let changed = self.ticket.send_if_modified(|state| {
            let was = *state;
            *state = TicketState::Granted;
            was != TicketState::Granted
        });
        if changed {
            info!("Start ticket granted");
        }
    }

    async fn maybe_finish_load(
        &self,
        write: &mut WsWriter,
        loaded: bool,
    ) -> Result<(), CoordinatorError> {
        if !loaded
            || *self.ticket.borrow() != TicketState::Granted
            || self.finish_load_sent.load(Ordering::SeqCst)
        {
            return Ok(());
        }
        send(write, ClientEvent::TicketFinishLoad).await?;
        self.finish_load_sent.store(true, Ordering::SeqCst);
        info!("Reported fleet fully loaded to coordinator");
        Ok(())
    }
}

async fn send(write: &mut WsWriter, event: ClientEvent) -> Result<(), CoordinatorError> {
    let text = event.encode()?;
    write.send(Message::Text(text)).await?;
    Ok(())
}

/// Forward ban notices to the owning workers until the channel closes.
pub async fn forward_bans(supervisor: Arc<Supervisor>, mut bans: mpsc::UnboundedReceiver<GuildBan>) {
    while let Some(ban) = bans.recv().await {
        let guild_id = match ban.id.parse::<u64>() {
            Ok(id) => id,
            Err(e) => {
                warn!(guild_id = %ban.id, error = %e, "Ban notice with invalid guild id");
                continue;
            }
        };
        if let Err(e) = supervisor.evict_guild(guild_id, &ban.reason).await {
            warn!(guild_id, error = %e, "Guild eviction dropped");
        }
    }
}
