// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coordinator client tests against a local websocket server.

mod common;

use std::time::Duration;

use common::{TestFleet, wait_until};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use shardline_protocol::coordinator::{
    ClientEvent, FleetState, GuildBan, ServerEvent, decode_client_event,
};
use shardline_supervisor::coordinator::{
    CoordinatorClient, CoordinatorConfig, TicketState, forward_bans,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

type ServerSocket = WebSocketStream<TcpStream>;

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = tokio::time::timeout(Duration::from_secs(3), listener.accept())
        .await
        .expect("client did not connect")
        .unwrap();
    accept_async(stream).await.unwrap()
}

/// Next client event, optionally skipping stats reports.
async fn next_event(ws: &mut ServerSocket, skip_stats: bool) -> ClientEvent {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("no frame from client");
        match msg {
            Some(Ok(Message::Text(text))) => {
                let event = decode_client_event(&text).unwrap();
                if skip_stats && matches!(event, ClientEvent::PostStats(_)) {
                    continue;
                }
                return event;
            }
            Some(Ok(_)) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn push(ws: &mut ServerSocket, event: ServerEvent) {
    ws.send(Message::Text(event.encode().unwrap())).await.unwrap();
}

fn coordinator_config(url: String, require_ticket: bool, stats_interval: Duration) -> CoordinatorConfig {
    CoordinatorConfig {
        url,
        key: "secret".to_string(),
        require_ticket,
        retry_interval: Duration::from_millis(50),
        stats_interval,
    }
}

async fn wait_granted(ticket: &mut watch::Receiver<TicketState>) {
    tokio::time::timeout(
        Duration::from_secs(3),
        ticket.wait_for(|state| *state == TicketState::Granted),
    )
    .await
    .expect("ticket not granted")
    .unwrap();
}

#[tokio::test]
async fn test_ticket_handshake_with_denial_and_finish_load() {
    let (listener, url) = listen().await;
    let fleet = TestFleet::coordinated(2, false);

    let (client, bans) = CoordinatorClient::new(
        coordinator_config(url, true, Duration::from_secs(3600)),
        2,
        fleet.supervisor.clone(),
        fleet.supervisor.subscribe_fleet_loaded(),
    );
    let mut ticket = client.ticket();
    let shutdown = client.shutdown_handle();
    let client_task = tokio::spawn(async move { client.run().await });
    tokio::spawn(forward_bans(fleet.supervisor.clone(), bans));

    let mut ws = accept(&listener).await;
    match next_event(&mut ws, true).await {
        ClientEvent::Welcome(welcome) => {
            assert_eq!((welcome.shard_first, welcome.shard_last), (1, 2));
            assert_eq!(welcome.shard_count, 2);
            assert_eq!(welcome.kind, "controller");
            assert_eq!(welcome.key, "secret");
        }
        other => panic!("expected welcome, got {:?}", other),
    }

    push(&mut ws, ServerEvent::Connected).await;
    assert_eq!(next_event(&mut ws, true).await, ClientEvent::RequestStartTicket);

    push(
        &mut ws,
        ServerEvent::TicketDenied {
            reason: Some("busy".to_string()),
        },
    )
    .await;
    assert_eq!(next_event(&mut ws, true).await, ClientEvent::RequestStartTicket);
    assert_eq!(*ticket.borrow(), TicketState::Waiting);

    push(&mut ws, ServerEvent::SendTicket(json!({ "id": 7 }))).await;
    wait_granted(&mut ticket).await;

    fleet.supervisor.start_all_down().await;
    fleet.drive_to_ok(1).await;
    fleet.drive_to_ok(2).await;
    assert_eq!(next_event(&mut ws, true).await, ClientEvent::TicketFinishLoad);

    // Guild 1 << 22 lives on shard 2
    push(
        &mut ws,
        ServerEvent::ClassicServerBan(GuildBan {
            id: (1u64 << 22).to_string(),
            reason: "abuse".to_string(),
        }),
    )
    .await;
    let launcher = fleet.launcher.clone();
    wait_until("eviction control line", || {
        let launcher = launcher.clone();
        async move { !launcher.control_lines(2).await.is_empty() }
    })
    .await;
    let lines = fleet.launcher.control_lines(2).await;
    assert_eq!(
        lines[0],
        r#"{"type":"evictGuild","guildId":"4194304","reason":"abuse"}"#
    );
    assert!(fleet.launcher.control_lines(1).await.is_empty());

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(3), client_task)
        .await
        .unwrap()
        .unwrap();
    fleet.stop().await;
}

#[tokio::test]
async fn test_no_ticket_required_grants_immediately() {
    let (listener, url) = listen().await;
    let fleet = TestFleet::coordinated(1, false);

    let (client, _bans) = CoordinatorClient::new(
        coordinator_config(url, false, Duration::from_secs(3600)),
        1,
        fleet.supervisor.clone(),
        fleet.supervisor.subscribe_fleet_loaded(),
    );
    let mut ticket = client.ticket();
    let shutdown = client.shutdown_handle();
    let client_task = tokio::spawn(async move { client.run().await });

    let mut ws = accept(&listener).await;
    assert!(matches!(
        next_event(&mut ws, true).await,
        ClientEvent::Welcome(_)
    ));
    wait_granted(&mut ticket).await;

    shutdown.notify_one();
    client_task.await.unwrap();
    fleet.stop().await;
}

#[tokio::test]
async fn test_reconnects_after_connection_loss() {
    let (listener, url) = listen().await;
    let fleet = TestFleet::coordinated(1, false);

    let (client, _bans) = CoordinatorClient::new(
        coordinator_config(url, true, Duration::from_secs(3600)),
        1,
        fleet.supervisor.clone(),
        fleet.supervisor.subscribe_fleet_loaded(),
    );
    let shutdown = client.shutdown_handle();
    let client_task = tokio::spawn(async move { client.run().await });

    let mut first = accept(&listener).await;
    assert!(matches!(
        next_event(&mut first, true).await,
        ClientEvent::Welcome(_)
    ));
    drop(first);

    let mut second = accept(&listener).await;
    assert!(matches!(
        next_event(&mut second, true).await,
        ClientEvent::Welcome(_)
    ));

    shutdown.notify_one();
    client_task.await.unwrap();
    fleet.stop().await;
}

#[tokio::test]
async fn test_posts_stats_periodically() {
    let (listener, url) = listen().await;
    let fleet = TestFleet::coordinated(3, false);

    let (client, _bans) = CoordinatorClient::new(
        coordinator_config(url, true, Duration::from_millis(50)),
        3,
        fleet.supervisor.clone(),
        fleet.supervisor.subscribe_fleet_loaded(),
    );
    let shutdown = client.shutdown_handle();
    let client_task = tokio::spawn(async move { client.run().await });

    let mut ws = accept(&listener).await;
    assert!(matches!(
        next_event(&mut ws, false).await,
        ClientEvent::Welcome(_)
    ));

    let mut reports = 0;
    while reports < 2 {
        if let ClientEvent::PostStats(stats) = next_event(&mut ws, false).await {
            assert_eq!(stats.id, "status");
            assert_eq!(stats.state, FleetState::Waiting);
            assert_eq!(stats.shards.len(), 3);
            assert_eq!(stats.counts.down, 3);
            assert!(stats.started_at.is_some());
            reports += 1;
        }
    }

    shutdown.notify_one();
    client_task.await.unwrap();
    fleet.stop().await;
}
