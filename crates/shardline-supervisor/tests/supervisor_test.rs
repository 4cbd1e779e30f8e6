// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor scenarios driven through the event loop with a mock launcher.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{TestFleet, wait_until};
use shardline_supervisor::ShardStatus;
use shardline_supervisor::error::Error;
use shardline_supervisor::notifier::Notice;
use shardline_supervisor::operator::OperatorInterface;
use shardline_supervisor::recovery::RecoveryAction;
use shardline_supervisor::runner::ExitReason;
use shardline_supervisor::supervisor::StartOutcome;

#[tokio::test]
async fn test_self_managed_launches_one_shard_at_a_time() {
    let fleet = TestFleet::self_managed(3, false);

    let started = fleet.supervisor.start_all_down().await;
    assert_eq!(started, vec![1, 2, 3]);

    fleet.wait_for_status(1, ShardStatus::Launching).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fleet.count(ShardStatus::Launching).await, 1);
    assert_eq!(fleet.status(2).await, ShardStatus::Queued);
    assert_eq!(fleet.status(3).await, ShardStatus::Queued);

    // Loading still holds the gate
    fleet.emit_loading(1).await;
    fleet.wait_for_status(1, ShardStatus::Loading).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fleet.status(2).await, ShardStatus::Queued);

    fleet.emit_loaded(1).await;
    fleet.wait_for_status(1, ShardStatus::Ok).await;
    fleet.wait_for_status(2, ShardStatus::Launching).await;
    assert_eq!(fleet.status(3).await, ShardStatus::Queued);
    assert_eq!(fleet.count(ShardStatus::Launching).await, 1);

    // A crash also releases the gate
    assert!(fleet.launcher.exit(2, ExitReason::Code(1)).await);
    fleet.wait_for_status(2, ShardStatus::Crashed).await;
    fleet.wait_for_status(3, ShardStatus::Launching).await;
    assert_eq!(fleet.launcher.spawn_count(2).await, 1);

    fleet.stop().await;
}

#[tokio::test]
async fn test_start_running_shard_is_rejected_without_spawn() {
    let fleet = TestFleet::coordinated(2, false);

    assert_eq!(
        fleet.supervisor.request_start(1).await.unwrap(),
        StartOutcome::Launched
    );
    assert!(matches!(
        fleet.supervisor.request_start(1).await,
        Err(Error::AlreadyRunning(1))
    ));

    fleet.emit_loading(1).await;
    fleet.wait_for_status(1, ShardStatus::Loading).await;
    assert!(matches!(
        fleet.supervisor.request_start(1).await,
        Err(Error::AlreadyRunning(1))
    ));

    assert_eq!(fleet.launcher.spawn_count(1).await, 1);
    assert_eq!(fleet.launcher.total_spawns().await, 1);

    fleet.stop().await;
}

#[tokio::test]
async fn test_kill_ok_shard_does_not_trigger_recovery() {
    let fleet = TestFleet::coordinated(1, true);

    fleet.supervisor.request_start(1).await.unwrap();
    fleet.drive_to_ok(1).await;

    fleet.supervisor.kill(1).await.unwrap();
    assert_eq!(fleet.status(1).await, ShardStatus::Down);
    assert!(fleet.supervisor.status().await[0].pid.is_none());

    let launcher = fleet.launcher.clone();
    wait_until("killed worker to exit", || {
        let launcher = launcher.clone();
        async move { !launcher.is_alive(1).await }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fleet.status(1).await, ShardStatus::Down);
    assert_eq!(fleet.launcher.spawn_count(1).await, 1);
    assert_eq!(fleet.supervisor.metrics().crashes, 0);
    assert!(
        !fleet
            .notifier
            .notices()
            .iter()
            .any(|n| matches!(n, Notice::Crashed { .. }))
    );

    fleet.stop().await;
}

#[tokio::test]
async fn test_kill_then_restart_ignores_old_exit() {
    let fleet = TestFleet::coordinated(1, false);

    fleet.supervisor.request_start(1).await.unwrap();
    fleet.supervisor.kill(1).await.unwrap();
    fleet.supervisor.request_start(1).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fleet.status(1).await, ShardStatus::Launching);
    assert_eq!(fleet.launcher.spawn_count(1).await, 2);
    assert_eq!(fleet.supervisor.metrics().crashes, 0);

    fleet.stop().await;
}

#[tokio::test]
async fn test_crash_while_loading_requeues_with_auto_restart() {
    let fleet = TestFleet::self_managed(1, true);

    fleet.supervisor.request_start(1).await.unwrap();
    fleet.wait_for_status(1, ShardStatus::Launching).await;
    fleet.emit_loading(1).await;
    fleet.wait_for_status(1, ShardStatus::Loading).await;

    assert!(fleet.launcher.exit(1, ExitReason::Code(1)).await);

    let launcher = fleet.launcher.clone();
    wait_until("crashed shard to relaunch", || {
        let launcher = launcher.clone();
        async move { launcher.spawn_count(1).await == 2 }
    })
    .await;
    fleet.wait_for_status(1, ShardStatus::Launching).await;

    let metrics = fleet.supervisor.metrics();
    assert_eq!(metrics.crashes, 1);
    assert_eq!(metrics.restarts, 1);
    assert!(fleet.notifier.notices().contains(&Notice::Crashed {
        shard_id: 1,
        exit: ExitReason::Code(1),
        action: RecoveryAction::Requeue,
    }));

    fleet.stop().await;
}

#[tokio::test]
async fn test_marker_round_trip_and_stream_close() {
    let fleet = TestFleet::self_managed(1, false);

    assert_eq!(fleet.status(1).await, ShardStatus::Down);
    fleet.supervisor.request_start(1).await.unwrap();
    fleet.wait_for_status(1, ShardStatus::Launching).await;

    fleet.emit_loading(1).await;
    for line in ["connected to gateway", "cache warm", "{\"level\":\"info\"}"] {
        assert!(fleet.launcher.emit_line(1, line).await);
    }
    fleet.wait_for_status(1, ShardStatus::Loading).await;
    fleet.emit_loaded(1).await;
    fleet.wait_for_status(1, ShardStatus::Ok).await;

    // Stream close alone is not an exit
    assert!(fleet.launcher.close_stdout(1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fleet.status(1).await, ShardStatus::Ok);
    assert!(fleet.launcher.is_alive(1).await);

    assert_eq!(
        fleet.notifier.notices(),
        vec![
            Notice::LoadingStarted { shard_id: 1 },
            Notice::FullyLoaded { shard_id: 1 },
        ]
    );

    fleet.stop().await;
}

#[tokio::test]
async fn test_crash_of_one_shard_leaves_others_untouched() {
    let fleet = TestFleet::coordinated(3, false);

    fleet.supervisor.start_all_down().await;
    fleet.drive_to_ok(1).await;
    fleet.drive_to_ok(3).await;
    fleet.wait_for_status(2, ShardStatus::Launching).await;
    fleet.emit_loading(2).await;
    fleet.wait_for_status(2, ShardStatus::Loading).await;

    assert!(fleet.launcher.exit(2, ExitReason::Code(1)).await);
    fleet.wait_for_status(2, ShardStatus::Crashed).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fleet.status(1).await, ShardStatus::Ok);
    assert_eq!(fleet.status(2).await, ShardStatus::Crashed);
    assert_eq!(fleet.status(3).await, ShardStatus::Ok);
    assert_eq!(fleet.launcher.spawn_count(2).await, 1);

    let operator = OperatorInterface::new(
        fleet.supervisor.clone(),
        HashSet::from(["admin".to_string()]),
    );
    let dump = operator.handle("admin", ".botstatus").await.unwrap();
    assert!(dump.contains("Shard 1: ok"));
    assert!(dump.contains("Shard 2: crashed [exit code 1]"));
    assert!(dump.contains("Shard 3: ok"));

    fleet.stop().await;
}

#[tokio::test]
async fn test_clean_exit_after_loaded_goes_down() {
    let fleet = TestFleet::coordinated(1, true);

    fleet.supervisor.request_start(1).await.unwrap();
    fleet.drive_to_ok(1).await;

    assert!(fleet.launcher.exit(1, ExitReason::Code(0)).await);
    fleet.wait_for_status(1, ShardStatus::Down).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fleet.launcher.spawn_count(1).await, 1);
    assert_eq!(fleet.supervisor.metrics().crashes, 0);

    fleet.stop().await;
}

#[tokio::test]
async fn test_spawn_failure_recovers_to_down() {
    let fleet = TestFleet::self_managed(2, false);
    fleet.launcher.fail_next_launches(1);

    fleet.supervisor.start_all_down().await;
    fleet.wait_for_status(2, ShardStatus::Launching).await;

    assert_eq!(fleet.status(1).await, ShardStatus::Down);
    assert_eq!(fleet.supervisor.metrics().spawn_failures, 1);
    assert!(matches!(
        fleet.notifier.notices().first(),
        Some(Notice::SpawnFailed { shard_id: 1, .. })
    ));

    fleet.stop().await;
}

#[tokio::test]
async fn test_fleet_loaded_signal() {
    let fleet = TestFleet::coordinated(2, false);
    let mut loaded = fleet.supervisor.subscribe_fleet_loaded();

    fleet.supervisor.start_all_down().await;
    fleet.drive_to_ok(1).await;
    assert!(!*loaded.borrow());

    fleet.drive_to_ok(2).await;
    tokio::time::timeout(Duration::from_secs(1), loaded.wait_for(|v| *v))
        .await
        .unwrap()
        .unwrap();

    fleet.stop().await;
}

#[tokio::test]
async fn test_early_loaded_marker_does_not_swallow_real_one() {
    let fleet = TestFleet::self_managed(2, false);

    fleet.supervisor.start_all_down().await;
    fleet.wait_for_status(1, ShardStatus::Launching).await;

    // Out of order: ignored while launching
    fleet.emit_loaded(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fleet.status(1).await, ShardStatus::Launching);

    fleet.emit_loading(1).await;
    fleet.wait_for_status(1, ShardStatus::Loading).await;
    fleet.emit_loaded(1).await;
    fleet.wait_for_status(1, ShardStatus::Ok).await;

    // Gate released, so the next queued shard starts
    fleet.wait_for_status(2, ShardStatus::Launching).await;

    fleet.stop().await;
}
