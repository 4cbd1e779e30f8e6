// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shardline Supervisor - shard process supervisor
//!
//! Launches one worker process per shard, follows each worker through its
//! lifecycle markers, restarts crashed workers and accepts operator
//! commands on stdin.

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use shardline_supervisor::config::Config;
use shardline_supervisor::runtime::SupervisorRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shardline_supervisor=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        shard_count = config.shard_count,
        mode = ?config.mode(),
        worker = %config.worker_entrypoint,
        auto_restart = config.auto_restart,
        "Starting Shardline Supervisor"
    );

    let runtime = SupervisorRuntime::builder()
        .config(config)
        .build()?
        .start()
        .await?;

    let mut console = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Shutdown signal received");
                break;
            }
            line = console.next_line(), if console_open => {
                match line {
                    Ok(Some(line)) => {
                        let caller = runtime.console_operator();
                        if let Some(reply) = runtime.operator().handle(caller, &line).await {
                            println!("{}", reply);
                        }
                    }
                    Ok(None) => {
                        info!("Console closed");
                        console_open = false;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read console");
                        console_open = false;
                    }
                }
            }
        }
    }

    runtime.shutdown().await?;

    info!("Shardline Supervisor shut down");

    Ok(())
}
