//! Integration tests for the handshake health monitor
//!
//! Runs the monitor on paused time against a driver whose handshake age is
//! scripted, and counts the restarts it asks the controller for.

mod common;

use autotun_core::config::{OrchestrationPolicy, Settings};
use autotun_core::tunnel::{HandshakeStatus, HealthMonitor, Notice};
use autotun_core::types::TunnelId;
use common::{controller_with, tunnel, wait_for_call, Call, ControllerHarness, Handshake};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn spawn_monitor(h: &ControllerHarness) -> (Arc<HealthMonitor>, CancellationToken) {
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&h.controller),
        h.fakes.driver.clone(),
        h.fakes.probe.clone(),
        OrchestrationPolicy::default(),
    ));
    let cancel = CancellationToken::new();
    let task_monitor = Arc::clone(&monitor);
    let token = cancel.clone();
    tokio::spawn(async move { task_monitor.run(token).await });
    (monitor, cancel)
}

#[tokio::test(start_paused = true)]
async fn test_stale_handshake_restarts_once_per_cooldown() {
    // Given: an Up tunnel whose handshake never refreshes
    let h = controller_with(Settings::default(), vec![tunnel(1, "office")]);
    let mut notices = h.controller.subscribe_notices();
    h.fakes.driver.set_handshake(1, Handshake::Aged(600));
    h.controller.start(tunnel(1, "office")).await.unwrap();

    // When: the monitor runs for just under one cooldown after the first restart
    let (_monitor, cancel) = spawn_monitor(&h);
    tokio::time::sleep(Duration::from_secs(305)).await;

    // Then: exactly one PING restart happened and the rest were suppressed
    assert_eq!(h.fakes.journal.count(&Call::Down("office".into())), 1);
    assert_eq!(h.fakes.journal.count(&Call::Up("office".into())), 2);

    let mut suppressed = 0;
    while let Ok(notice) = notices.try_recv() {
        if matches!(notice, Notice::RestartSuppressed { .. }) {
            suppressed += 1;
        }
    }
    assert_eq!(suppressed, 1);

    // And: once the cooldown elapses the next restart goes through
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.fakes.journal.count(&Call::Down("office".into())), 2);
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_handshake_never_restarts() {
    let h = controller_with(Settings::default(), vec![tunnel(1, "office")]);
    h.fakes.driver.set_handshake(1, Handshake::Unreadable);
    h.controller.start(tunnel(1, "office")).await.unwrap();

    let (monitor, cancel) = spawn_monitor(&h);
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(h.fakes.journal.count(&Call::Down("office".into())), 0);
    assert_eq!(
        monitor.subscribe().borrow().get(&TunnelId(1)),
        Some(&HandshakeStatus::Unknown)
    );
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_single_stale_poll_is_tolerated() {
    // Given: a handshake that is stale once, then fresh again
    let h = controller_with(Settings::default(), vec![tunnel(1, "office")]);
    h.fakes.driver.set_handshake(1, Handshake::Aged(250));
    h.controller.start(tunnel(1, "office")).await.unwrap();
    let (monitor, cancel) = spawn_monitor(&h);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        monitor.subscribe().borrow().get(&TunnelId(1)),
        Some(&HandshakeStatus::Stale)
    );
    h.fakes.driver.set_handshake(1, Handshake::Fresh);
    tokio::time::sleep(Duration::from_secs(60)).await;

    // Then: no restart and the status is healthy again
    assert_eq!(h.fakes.journal.count(&Call::Down("office".into())), 0);
    assert_eq!(
        monitor.subscribe().borrow().get(&TunnelId(1)),
        Some(&HandshakeStatus::Healthy)
    );
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_ping_failures_trigger_restart() {
    // Given: a healthy handshake but a probe failing three times in a row
    let mut conf = tunnel(1, "office");
    conf.is_ping_enabled = true;
    conf.ping_target = Some("https://intranet.example.com/health".to_string());
    conf.ping_interval_secs = 20;
    let h = controller_with(Settings::default(), vec![conf.clone()]);
    h.fakes.probe.push(&[false, false, false]);
    h.controller.start(conf).await.unwrap();

    // When: the monitor runs
    let (_monitor, cancel) = spawn_monitor(&h);
    wait_for_call(&h.fakes.journal, &Call::Down("office".into()), 1).await;

    // Then: the tunnel was restarted after the third failure
    assert_eq!(h.fakes.probe.checks(), 3);
    wait_for_call(&h.fakes.journal, &Call::Up("office".into()), 2).await;
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_stopped_tunnel_is_no_longer_polled() {
    let h = controller_with(Settings::default(), vec![tunnel(1, "office")]);
    h.fakes.driver.set_handshake(1, Handshake::Aged(600));
    h.controller.start(tunnel(1, "office")).await.unwrap();
    h.controller
        .stop(TunnelId(1), autotun_core::tunnel::StopReason::User)
        .await
        .unwrap();

    let (monitor, cancel) = spawn_monitor(&h);
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(monitor.subscribe().borrow().is_empty());
    assert_eq!(h.fakes.journal.count(&Call::Up("office".into())), 1);
    cancel.cancel();
}
