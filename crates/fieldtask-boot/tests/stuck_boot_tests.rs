//! Stuck detection as seen through the boot phase

use fieldtask_boot::{BootPhase, StuckReason};
use fieldtask_model::{Principal, UserProfile};
use fieldtask_test_utils::{
    fast_config, stopped_failure, BootHarness, ConnectStep, MockIdentityProvider,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn returning_user() -> BootHarness {
    let harness = BootHarness::new(MockIdentityProvider::signed_in("rae"), fast_config());
    harness
        .store
        .seed_profile(&Principal::new("rae"), UserProfile::new("Rae"));
    harness
}

fn stuck_reason(phase: &BootPhase) -> Option<StuckReason> {
    match phase {
        BootPhase::Stuck { reason, .. } => Some(*reason),
        _ => None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_hung_connection_is_stuck_at_deadline() {
    let harness = returning_user();
    harness.connector.push(ConnectStep::Hang);
    harness.spawn();

    tokio::time::sleep(Duration::from_millis(14_900)).await;
    assert_eq!(harness.sequencer.phase(), BootPhase::Connecting);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let phase = harness.sequencer.phase();
    assert_eq!(stuck_reason(&phase), Some(StuckReason::ConnectionInitializing));
    if let BootPhase::Stuck { message, .. } = &phase {
        assert!(message.contains("15 seconds"), "{message}");
    }
    assert!(phase.is_recoverable());
    assert_eq!(harness.context.stage(), "stuck");

    let phase = harness.sequencer.retry().await.expect("retry runs");
    assert_eq!(phase, BootPhase::ReadyDashboard);
    assert!(!harness.sequencer.watchdog().status().is_stuck);
}

#[tokio::test(start_paused = true)]
async fn test_slow_profile_is_stuck_then_recovers() {
    let harness = returning_user();
    harness.store.delay_profile(Some(Duration::from_secs(20)));
    harness.spawn();

    tokio::time::sleep(Duration::from_millis(15_100)).await;
    assert_eq!(
        stuck_reason(&harness.sequencer.phase()),
        Some(StuckReason::ProfileLoading)
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(harness.sequencer.phase(), BootPhase::ReadyDashboard);
    assert!(!harness.sequencer.watchdog().status().is_stuck);
    assert!(!harness.sequencer.watchdog().is_armed());
}

#[tokio::test(start_paused = true)]
async fn test_progress_before_deadline_never_fires() {
    let harness = returning_user();
    harness.store.delay_profile(Some(Duration::from_secs(5)));
    harness.spawn();

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(harness.sequencer.phase(), BootPhase::ReadyDashboard);
    assert!(!harness.sequencer.watchdog().is_armed());
}

#[tokio::test(start_paused = true)]
async fn test_hard_error_outranks_stuck() {
    let harness = returning_user();
    harness.connector.set_delay(Duration::from_secs(20));
    harness
        .connector
        .push(ConnectStep::Fail(stopped_failure()));
    harness.spawn();

    tokio::time::sleep(Duration::from_millis(15_100)).await;
    assert_eq!(harness.sequencer.phase().label(), "stuck");

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(harness.sequencer.phase().label(), "boot-error");
    assert!(!harness.sequencer.watchdog().status().is_stuck);
}

#[tokio::test(start_paused = true)]
async fn test_boot_error_does_not_arm_watchdog() {
    let harness = returning_user();
    harness.connector.push(ConnectStep::Fail(stopped_failure()));
    harness.spawn();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.sequencer.phase().label(), "boot-error");
    assert!(!harness.sequencer.watchdog().is_armed());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.sequencer.phase().label(), "boot-error");
    assert!(!harness.sequencer.watchdog().status().is_stuck);
}

#[tokio::test(start_paused = true)]
async fn test_retry_from_slow_profile_rebuilds_connection() {
    let harness = returning_user();
    harness.store.delay_profile(Some(Duration::from_secs(60)));
    harness.spawn();

    tokio::time::sleep(Duration::from_millis(15_100)).await;
    assert_eq!(
        stuck_reason(&harness.sequencer.phase()),
        Some(StuckReason::ProfileLoading)
    );
    let before = harness
        .sequencer
        .supervisor()
        .connection()
        .expect("connection ready while profile loads");
    assert_eq!(harness.connector.calls(), 1);

    harness.store.delay_profile(None);
    let phase = harness.sequencer.retry().await.expect("retry runs");
    assert_eq!(phase, BootPhase::ReadyDashboard);
    assert_eq!(harness.connector.calls(), 2);

    let after = harness.sequencer.supervisor().connection().expect("rebuilt");
    assert!(!Arc::ptr_eq(&before, &after));
    assert!(after.generation() > before.generation());
}

#[tokio::test(start_paused = true)]
async fn test_hung_retry_becomes_stuck_and_can_be_retried() {
    let harness = returning_user();
    harness.connector.push(ConnectStep::Fail(stopped_failure()));
    harness.connector.push(ConnectStep::Hang);
    harness.spawn();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.sequencer.phase().label(), "boot-error");

    let hung = {
        let sequencer = Arc::clone(&harness.sequencer);
        tokio::spawn(async move { sequencer.retry().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.sequencer.phase(), BootPhase::Connecting);

    tokio::time::sleep(Duration::from_secs(29)).await;
    let phase = harness.sequencer.phase();
    assert_eq!(stuck_reason(&phase), Some(StuckReason::ConnectionInitializing));
    assert!(phase.is_recoverable());

    let phase = harness.sequencer.retry().await.expect("stuck retry is not refused");
    assert_eq!(phase, BootPhase::ReadyDashboard);
    assert_eq!(harness.connector.calls(), 3);
    assert!(hung.await.expect("task completes").is_ok());
    assert_eq!(harness.sequencer.phase(), BootPhase::ReadyDashboard);
}

#[tokio::test(start_paused = true)]
async fn test_logout_from_stuck_disarms() {
    let harness = returning_user();
    harness.connector.push(ConnectStep::Hang);
    harness.spawn();

    tokio::time::sleep(Duration::from_millis(15_100)).await;
    assert_eq!(harness.sequencer.phase().label(), "stuck");

    harness.sequencer.logout().await;
    assert_eq!(harness.sequencer.phase(), BootPhase::Unauthenticated);
    let status = harness.sequencer.watchdog().status();
    assert!(!status.is_stuck);
    assert_eq!(status.stuck_reason, None);
}
