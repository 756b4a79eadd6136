//! Integration tests for the tunnel lifecycle controller
//!
//! Exercises idempotent starts, mutual exclusion, kill-switch ordering,
//! cancellation of in-flight starts, timeouts and failure classification
//! against recording fakes.

mod common;

use autotun_core::config::Settings;
use autotun_core::error::TunnelError;
use autotun_core::tunnel::{
    AutoTunnelEvent, Decision, KillSwitchEvent, LifecycleEvent, Notice, PendingRetry, StopReason,
    TunnelStatus,
};
use autotun_core::types::TunnelId;
use common::{controller_with, tunnel, wait_for_status, Call};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};

fn kill_switch_settings() -> Settings {
    Settings {
        is_kill_switch_enabled: true,
        ..Settings::default()
    }
}

fn drain(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn status_events(events: &[LifecycleEvent], id: u32) -> Vec<TunnelStatus> {
    events
        .iter()
        .filter_map(|event| match event {
            LifecycleEvent::Status {
                tunnel_id, status, ..
            } if *tunnel_id == TunnelId(id) => Some(*status),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_start_twice_is_idempotent() {
    // Given: a kill-switch enabled controller with one tunnel Up
    let h = controller_with(kill_switch_settings(), vec![tunnel(1, "office")]);
    let mut events = h.controller.subscribe_events();
    h.controller.start(tunnel(1, "office")).await.unwrap();

    // When: the same tunnel is started again
    h.controller.start(tunnel(1, "office")).await.unwrap();

    // Then: one Starting transition, one bring-up, one kill-switch engage
    let events = drain(&mut events);
    let starting = status_events(&events, 1)
        .into_iter()
        .filter(|s| *s == TunnelStatus::Starting)
        .count();
    assert_eq!(starting, 1);
    assert_eq!(h.fakes.journal.count(&Call::Up("office".into())), 1);
    let engages = h
        .fakes
        .journal
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::Engage(_)))
        .count();
    assert_eq!(engages, 1);
    assert!(h.tunnels.find_by_id(TunnelId(1)).unwrap().is_active);
}

#[tokio::test]
async fn test_switching_tunnels_never_runs_both() {
    // Given: tunnel 1 is Up in single-tunnel mode
    let h = controller_with(
        Settings::default(),
        vec![tunnel(1, "office"), tunnel(2, "travel")],
    );
    let mut events = h.controller.subscribe_events();
    h.controller.start(tunnel(1, "office")).await.unwrap();

    // When: tunnel 2 is started
    h.controller.start(tunnel(2, "travel")).await.unwrap();

    // Then: tunnel 1 went down with CONFIG_CHANGED before tunnel 2 came up
    let events = drain(&mut events);
    let mut up = BTreeSet::new();
    for event in &events {
        if let LifecycleEvent::Status {
            tunnel_id, status, ..
        } = event
        {
            if status.is_up() {
                up.insert(*tunnel_id);
            } else {
                up.remove(tunnel_id);
            }
            assert!(up.len() <= 1, "two exclusive tunnels reported Up");
        }
    }
    assert_eq!(
        status_events(&events, 1),
        vec![
            TunnelStatus::Starting,
            TunnelStatus::Up,
            TunnelStatus::Stopping(StopReason::ConfigChanged),
            TunnelStatus::Down,
        ]
    );
    assert_eq!(
        h.fakes.journal.calls(),
        vec![
            Call::Up("office".into()),
            Call::Down("office".into()),
            Call::Up("travel".into()),
        ]
    );

    let snapshot = h.controller.status_snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.get(&TunnelId(2)), Some(&TunnelStatus::Up));
    assert!(!h.tunnels.find_by_id(TunnelId(1)).unwrap().is_active);
}

#[tokio::test]
async fn test_multi_tunnel_runs_side_by_side() {
    let settings = Settings {
        is_multi_tunnel_enabled: true,
        ..Settings::default()
    };
    let h = controller_with(settings, vec![tunnel(1, "office"), tunnel(2, "travel")]);

    h.controller.start(tunnel(1, "office")).await.unwrap();
    h.controller.start(tunnel(2, "travel")).await.unwrap();

    assert_eq!(h.controller.status_snapshot().len(), 2);
    assert_eq!(h.fakes.journal.count(&Call::Down("office".into())), 0);
}

#[tokio::test]
async fn test_kill_switch_brackets_the_tunnel() {
    // Given: kill switch enabled
    let h = controller_with(kill_switch_settings(), vec![tunnel(1, "office")]);
    let mut events = h.controller.subscribe_events();

    // When: the tunnel is started then stopped by the user
    h.controller.start(tunnel(1, "office")).await.unwrap();
    h.controller.stop(TunnelId(1), StopReason::User).await.unwrap();

    // Then: engage precedes Starting and release follows Down
    let events = drain(&mut events);
    let position = |wanted: &dyn Fn(&LifecycleEvent) -> bool| {
        events.iter().position(|e| wanted(e)).unwrap()
    };
    let engaged = position(&|e| {
        matches!(
            e,
            LifecycleEvent::KillSwitch {
                event: KillSwitchEvent::Start(_),
                ..
            }
        )
    });
    let starting = position(&|e| {
        matches!(
            e,
            LifecycleEvent::Status {
                status: TunnelStatus::Starting,
                ..
            }
        )
    });
    let down = position(&|e| {
        matches!(
            e,
            LifecycleEvent::Status {
                status: TunnelStatus::Down,
                ..
            }
        )
    });
    let released = position(&|e| {
        matches!(
            e,
            LifecycleEvent::KillSwitch {
                event: KillSwitchEvent::Stop,
                ..
            }
        )
    });
    assert!(engaged < starting);
    assert!(down < released);
    assert!(events[engaged].at() <= events[starting].at());
    assert!(events[down].at() <= events[released].at());

    let journal = &h.fakes.journal;
    assert!(journal.position(&Call::Down("office".into())) < journal.position(&Call::Release));
    assert!(!h.controller.is_kill_switch_engaged().await);
}

#[tokio::test]
async fn test_kill_switch_without_vpn_stays_engaged_after_stop() {
    let settings = Settings {
        is_kill_switch_enabled: true,
        is_kill_switch_without_vpn_enabled: true,
        ..Settings::default()
    };
    let h = controller_with(settings, vec![tunnel(1, "office")]);

    h.controller.start(tunnel(1, "office")).await.unwrap();
    h.controller.stop(TunnelId(1), StopReason::User).await.unwrap();

    assert!(h.controller.is_kill_switch_engaged().await);
    assert_eq!(h.fakes.journal.count(&Call::Release), 0);
}

#[tokio::test]
async fn test_concurrent_stops_collapse() {
    let h = controller_with(Settings::default(), vec![tunnel(1, "office")]);
    h.controller.start(tunnel(1, "office")).await.unwrap();
    let mut events = h.controller.subscribe_events();

    let (a, b) = tokio::join!(
        h.controller.stop(TunnelId(1), StopReason::User),
        h.controller.stop(TunnelId(1), StopReason::User),
    );

    assert_ok!(a);
    assert_ok!(b);
    assert_eq!(h.fakes.journal.count(&Call::Down("office".into())), 1);
    assert_eq!(
        status_events(&drain(&mut events), 1),
        vec![TunnelStatus::Stopping(StopReason::User), TunnelStatus::Down]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_in_flight_start() {
    // Given: a bring-up that takes ten seconds
    let h = controller_with(kill_switch_settings(), vec![tunnel(1, "office")]);
    h.fakes.driver.set_up_delay(Duration::from_secs(10));
    let mut events = h.controller.subscribe_events();
    let mut status = h.controller.subscribe_status();

    let controller = Arc::clone(&h.controller);
    let start = tokio::spawn(async move { controller.start(tunnel(1, "office")).await });
    wait_for_status(&mut status, |map| {
        map.get(&TunnelId(1)) == Some(&TunnelStatus::Starting)
    })
    .await;

    // When: the user stops it while Starting
    h.controller.stop(TunnelId(1), StopReason::User).await.unwrap();

    // Then: the start is cancelled and the tunnel ends Down
    let result = start.await.unwrap();
    assert!(matches!(result, Err(TunnelError::Cancelled { .. })));
    assert_eq!(
        status_events(&drain(&mut events), 1),
        vec![
            TunnelStatus::Starting,
            TunnelStatus::Stopping(StopReason::User),
            TunnelStatus::Down,
        ]
    );
    assert_eq!(h.fakes.journal.count(&Call::Up("office".into())), 0);
    assert!(!h.controller.has_active_tunnel());
    assert!(!h.controller.is_kill_switch_engaged().await);
    assert!(h.controller.take_pending_retry().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_start_timeout_reverts_and_rolls_back_kill_switch() {
    // Given: a bring-up slower than the 30 second start timeout
    let h = controller_with(kill_switch_settings(), vec![tunnel(1, "office")]);
    h.fakes.driver.set_up_delay(Duration::from_secs(120));

    // When: the tunnel is started
    let result = h.controller.start(tunnel(1, "office")).await;

    // Then: the timeout is a transient failure queued for one retry
    assert!(matches!(result, Err(TunnelError::Timeout { seconds: 30, .. })));
    assert!(h.controller.status_snapshot().is_empty());
    assert!(!h.controller.is_kill_switch_engaged().await);
    assert_eq!(h.fakes.journal.count(&Call::Release), 1);
    assert!(matches!(
        h.controller.take_pending_retry().await,
        Some(PendingRetry::Start(conf)) if conf.name == "office"
    ));
}

#[tokio::test]
async fn test_configuration_error_is_surfaced_not_retried() {
    let h = controller_with(Settings::default(), vec![tunnel(1, "office")]);
    let mut notices = h.controller.subscribe_notices();
    h.fakes.driver.fail_next_up(TunnelError::InvalidConfig {
        tunnel: "office".to_string(),
        reason: "Line unrecognized: `Adress = 10.0.0.2/32'".to_string(),
    });

    let result = h.controller.start(tunnel(1, "office")).await;

    assert!(matches!(result, Err(TunnelError::InvalidConfig { .. })));
    assert!(h.controller.take_pending_retry().await.is_none());
    assert!(matches!(
        notices.try_recv(),
        Ok(Notice::ConfigurationError { tunnel, .. }) if tunnel == "office"
    ));
}

#[tokio::test]
async fn test_retry_failure_raises_repeated_failure_notice() {
    let h = controller_with(Settings::default(), vec![tunnel(1, "office")]);
    let mut notices = h.controller.subscribe_notices();
    for _ in 0..2 {
        h.fakes.driver.fail_next_up(TunnelError::PermissionDenied {
            tunnel: "office".to_string(),
            reason: "Operation not permitted".to_string(),
        });
    }

    assert_err!(h.controller.start(tunnel(1, "office")).await);
    let retry = h.controller.take_pending_retry().await.unwrap();
    assert_err!(h.controller.retry(retry).await);

    assert!(matches!(
        notices.try_recv(),
        Ok(Notice::RepeatedFailure { tunnel, .. }) if tunnel == "office"
    ));
    // The retry was the last automatic attempt
    assert!(h.controller.take_pending_retry().await.is_none());
}

#[tokio::test]
async fn test_failed_kill_switch_is_reported() {
    let h = controller_with(kill_switch_settings(), vec![tunnel(1, "office")]);
    let mut notices = h.controller.subscribe_notices();
    h.fakes.kill_switch.set_fail_engage(true);

    h.controller.start(tunnel(1, "office")).await.unwrap();

    assert!(matches!(
        notices.try_recv(),
        Ok(Notice::KillSwitchFailure { .. })
    ));
    assert!(!h.controller.is_kill_switch_engaged().await);
}

#[tokio::test]
async fn test_restart_keeps_kill_switch_and_active_flag() {
    let h = controller_with(kill_switch_settings(), vec![tunnel(1, "office")]);
    h.controller.start(tunnel(1, "office")).await.unwrap();
    let mut events = h.controller.subscribe_events();

    h.controller.restart(TunnelId(1)).await.unwrap();

    assert_eq!(
        status_events(&drain(&mut events), 1),
        vec![
            TunnelStatus::Stopping(StopReason::Ping),
            TunnelStatus::Down,
            TunnelStatus::Starting,
            TunnelStatus::Up,
        ]
    );
    assert_eq!(h.fakes.journal.count(&Call::Release), 0);
    assert!(h.controller.is_kill_switch_engaged().await);
    assert!(h.tunnels.find_by_id(TunnelId(1)).unwrap().is_active);
}

#[tokio::test]
async fn test_shutdown_keeps_active_flags() {
    let h = controller_with(kill_switch_settings(), vec![tunnel(1, "office")]);
    h.controller.start(tunnel(1, "office")).await.unwrap();

    h.controller.shutdown().await;

    assert_eq!(h.fakes.journal.count(&Call::Down("office".into())), 1);
    assert!(h.controller.status_snapshot().is_empty());
    assert!(!h.controller.is_kill_switch_engaged().await);
    assert!(h.tunnels.find_by_id(TunnelId(1)).unwrap().is_active);

    // Nothing starts once shutdown began
    h.controller.start(tunnel(1, "office")).await.unwrap();
    assert_eq!(h.fakes.journal.count(&Call::Up("office".into())), 1);
}

#[tokio::test]
async fn test_stop_discards_queued_start_retry() {
    // Given: a start that failed transiently and is queued for retry
    let h = controller_with(Settings::default(), vec![tunnel(1, "office")]);
    h.fakes.driver.fail_next_up(TunnelError::StartFailed {
        tunnel: "office".to_string(),
        reason: "wg-quick exited with status 1".to_string(),
    });
    assert_err!(h.controller.start(tunnel(1, "office")).await);

    // When: the user stops the tunnel that never came up
    assert_ok!(h.controller.stop(TunnelId(1), StopReason::User).await);

    // Then: nothing is left to retry
    assert!(h.controller.take_pending_retry().await.is_none());
    assert!(h.fakes.journal.calls().is_empty());
}

#[tokio::test]
async fn test_switching_discards_retry_of_other_tunnel() {
    let h = controller_with(
        Settings::default(),
        vec![tunnel(1, "office"), tunnel(2, "travel")],
    );
    h.fakes.driver.fail_next_up(TunnelError::StartFailed {
        tunnel: "office".to_string(),
        reason: "wg-quick exited with status 1".to_string(),
    });
    assert_err!(h.controller.start(tunnel(1, "office")).await);

    h.controller.start(tunnel(2, "travel")).await.unwrap();

    assert!(h.controller.take_pending_retry().await.is_none());
}

#[tokio::test]
async fn test_stop_retry_spares_restarted_tunnel() {
    // Given: a failed teardown whose retry was already taken by a check
    let h = controller_with(Settings::default(), vec![tunnel(1, "office")]);
    h.controller.start(tunnel(1, "office")).await.unwrap();
    h.fakes.driver.fail_next_down(TunnelError::StopFailed {
        tunnel: "office".to_string(),
        reason: "Device or resource busy".to_string(),
    });
    assert_err!(h.controller.stop(TunnelId(1), StopReason::User).await);
    let retry = h.controller.take_pending_retry().await.unwrap();
    assert!(matches!(retry, PendingRetry::Stop(..)));

    // When: the tunnel is started again before the retry runs
    h.controller.start(tunnel(1, "office")).await.unwrap();
    assert_ok!(h.controller.retry(retry).await);

    // Then: the live tunnel is left alone
    assert_eq!(h.fakes.journal.count(&Call::Down("office".into())), 0);
    assert_eq!(
        h.controller.status_snapshot().get(&TunnelId(1)),
        Some(&TunnelStatus::Up)
    );
}

#[tokio::test]
async fn test_start_discards_queued_stop_retry() {
    let h = controller_with(Settings::default(), vec![tunnel(1, "office")]);
    h.controller.start(tunnel(1, "office")).await.unwrap();
    h.fakes.driver.fail_next_down(TunnelError::StopFailed {
        tunnel: "office".to_string(),
        reason: "Device or resource busy".to_string(),
    });
    assert_err!(h.controller.stop(TunnelId(1), StopReason::User).await);

    h.controller.start(tunnel(1, "office")).await.unwrap();

    assert!(h.controller.take_pending_retry().await.is_none());
}

#[tokio::test]
async fn test_stop_decision_releases_kill_switch_after_teardown() {
    // Given: a tunnel Up behind the kill switch
    let h = controller_with(kill_switch_settings(), vec![tunnel(1, "office")]);
    h.controller.start(tunnel(1, "office")).await.unwrap();

    // When: the arbiter decides to stop everything and drop the kill switch
    h.controller
        .apply(Decision {
            tunnel: AutoTunnelEvent::Stop,
            kill_switch: KillSwitchEvent::Stop,
        })
        .await
        .unwrap();

    // Then: teardown happens first and the kill switch is released once
    let journal = &h.fakes.journal;
    assert!(journal.position(&Call::Down("office".into())) < journal.position(&Call::Release));
    assert_eq!(journal.count(&Call::Release), 1);
    assert!(h.controller.status_snapshot().is_empty());
    assert!(!h.controller.is_kill_switch_engaged().await);
}
