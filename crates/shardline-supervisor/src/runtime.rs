// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for shardline-supervisor.
//!
//! [`SupervisorRuntime`] wires the supervisor core to its background tasks
//! so it can run inside any tokio application:
//!
//! ```rust,ignore
//! use shardline_supervisor::config::Config;
//! use shardline_supervisor::runtime::SupervisorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = SupervisorRuntime::builder()
//!         .config(Config::from_env()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let reply = runtime.operator().handle("console", ".botstatus").await;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! Without a launcher the runtime spawns real worker processes; tests pass a
//! [`MockLauncher`](crate::runner::MockLauncher) instead.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::coordinator::{CoordinatorClient, TicketState, forward_bans};
use crate::notifier::{LogNotifier, Notifier};
use crate::operator::OperatorInterface;
use crate::runner::{Launcher, ProcessLauncher};
use crate::scheduler::StartupMode;
use crate::supervisor::Supervisor;

/// Builder for [`SupervisorRuntime`].
#[derive(Default)]
pub struct SupervisorRuntimeBuilder {
    config: Option<Config>,
    launcher: Option<Arc<dyn Launcher>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl SupervisorRuntimeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the worker launcher.
    ///
    /// Default: [`ProcessLauncher`] built from the configuration.
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Set the operator notifier.
    ///
    /// Default: [`LogNotifier`]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<SupervisorRuntimeConfig> {
        let config = self.config.context("config is required")?;
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(ProcessLauncher::new(config.worker_command())));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

        Ok(SupervisorRuntimeConfig {
            config,
            launcher,
            notifier,
        })
    }
}

/// Configuration for a [`SupervisorRuntime`].
pub struct SupervisorRuntimeConfig {
    config: Config,
    launcher: Arc<dyn Launcher>,
    notifier: Arc<dyn Notifier>,
}

impl SupervisorRuntimeConfig {
    /// Start the supervisor loop and, in coordinated mode, the coordinator client.
    pub async fn start(self) -> Result<SupervisorRuntime> {
        let config = self.config;
        let supervisor = Arc::new(Supervisor::new(
            config.supervisor_settings(),
            self.launcher.clone(),
            self.notifier,
        ));

        let loop_shutdown = Arc::new(Notify::new());
        let loop_handle = {
            let supervisor = supervisor.clone();
            let shutdown = loop_shutdown.clone();
            let tick = config.tick_interval;
            tokio::spawn(async move { supervisor.run(tick, shutdown).await })
        };

        let mut coordinator = None;
        let mut ticket = None;
        let mut background = Vec::new();

        match (config.mode(), config.coordinator.clone()) {
            (StartupMode::Coordinated, Some(coordinator_config)) => {
                let (client, bans) = CoordinatorClient::new(
                    coordinator_config,
                    config.shard_count,
                    supervisor.clone(),
                    supervisor.subscribe_fleet_loaded(),
                );
                let shutdown = client.shutdown_handle();
                let ticket_rx = client.ticket();
                let handle = tokio::spawn(async move { client.run().await });
                coordinator = Some((handle, shutdown));

                background.push(tokio::spawn(forward_bans(supervisor.clone(), bans)));
                background.push(tokio::spawn(start_after_ticket(
                    supervisor.clone(),
                    ticket_rx.clone(),
                )));
                ticket = Some(ticket_rx);
            }
            _ => {
                if config.queue_on_start {
                    supervisor.start_all_down().await;
                }
            }
        }

        info!(
            shard_count = config.shard_count,
            mode = ?config.mode(),
            launcher = self.launcher.launcher_type(),
            "SupervisorRuntime started"
        );

        // The local console is always allowed to operate the fleet
        let mut operators = config.operators.clone();
        operators.insert(config.console_operator.clone());
        let operator = OperatorInterface::new(supervisor.clone(), operators);

        Ok(SupervisorRuntime {
            supervisor,
            operator,
            loop_handle,
            loop_shutdown,
            coordinator,
            ticket,
            background,
            console_operator: config.console_operator,
        })
    }
}

/// Launch the fleet once the coordinator grants a ticket.
async fn start_after_ticket(supervisor: Arc<Supervisor>, mut ticket: watch::Receiver<TicketState>) {
    info!("Waiting for start ticket");
    if ticket
        .wait_for(|state| *state == TicketState::Granted)
        .await
        .is_err()
    {
        warn!("Coordinator client stopped before a ticket was granted");
        return;
    }
    supervisor.start_all_down().await;
}

/// A running supervisor with its background tasks.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct SupervisorRuntime {
    supervisor: Arc<Supervisor>,
    operator: OperatorInterface,
    loop_handle: JoinHandle<()>,
    loop_shutdown: Arc<Notify>,
    coordinator: Option<(JoinHandle<()>, Arc<Notify>)>,
    ticket: Option<watch::Receiver<TicketState>>,
    background: Vec<JoinHandle<()>>,
    console_operator: String,
}

impl SupervisorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> SupervisorRuntimeBuilder {
        SupervisorRuntimeBuilder::new()
    }

    /// The supervisor core.
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// The operator command surface.
    pub fn operator(&self) -> &OperatorInterface {
        &self.operator
    }

    /// Identity used for commands typed on the local console.
    pub fn console_operator(&self) -> &str {
        &self.console_operator
    }

    /// Ticket state, in coordinated mode.
    pub fn ticket(&self) -> Option<watch::Receiver<TicketState>> {
        self.ticket.clone()
    }

    /// Stop background tasks and kill every live worker.
    pub async fn shutdown(self) -> Result<()> {
        info!("SupervisorRuntime shutting down...");

        for task in &self.background {
            task.abort();
        }

        if let Some((handle, shutdown)) = self.coordinator {
            shutdown.notify_one();
            if let Err(e) = handle.await {
                error!("Coordinator client task panicked: {}", e);
            }
        }

        self.supervisor.shutdown_workers().await;

        self.loop_shutdown.notify_one();
        match tokio::time::timeout(Duration::from_secs(5), self.loop_handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Supervisor loop task panicked: {}", e),
            Err(_) => warn!("Supervisor loop did not stop in time"),
        }

        info!("SupervisorRuntime shutdown complete");
        Ok(())
    }
}
