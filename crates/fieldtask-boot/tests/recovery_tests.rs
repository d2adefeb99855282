//! Automatic retries, user Retry and the eviction order it relies on

use fieldtask_boot::{
    BootError, BootPhase, CacheKey, ConnectError, ConnectionSupervisor, ErrorCategory,
    MokaQueryCache, QueryCache, RetryPolicy,
};
use fieldtask_model::{Backend, Connector, Failure, Identity, Principal, UserProfile};
use fieldtask_test_utils::{
    fast_config, identity, network_failure, stopped_failure, wait_for_phase, BootHarness, CacheOp,
    ConnectStep, InMemoryStore, MockIdentityProvider,
};
use mockall::mock;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Connector {}

    #[async_trait::async_trait]
    impl Connector for Connector {
        async fn connect(&self, identity: &Identity) -> Result<Arc<dyn Backend>, Failure>;
    }
}

fn supervisor_with(connector: MockConnector) -> ConnectionSupervisor {
    ConnectionSupervisor::new(
        Arc::new(connector),
        Arc::new(MokaQueryCache::new(64)) as Arc<dyn QueryCache>,
        RetryPolicy {
            max_auto_retries: 2,
            base_delay_ms: 1_000,
            multiplier: 1.0,
        },
    )
}

async fn expect_phase(harness: &BootHarness, label: &str) -> BootPhase {
    let mut rx = harness.phases();
    tokio::time::timeout(Duration::from_secs(60), wait_for_phase(&mut rx, |p| p.label() == label))
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| panic!("phase {label} not reached, last was {}", harness.sequencer.phase()))
}

#[tokio::test(start_paused = true)]
async fn test_network_failure_is_retried_exactly_twice() {
    let mut connector = MockConnector::new();
    connector
        .expect_connect()
        .times(3)
        .returning(|_| Err(network_failure()));
    let supervisor = supervisor_with(connector);

    let started = tokio::time::Instant::now();
    let err = supervisor.ensure(&identity("rae")).await.unwrap_err();

    let classified = err.classified().expect("classified failure");
    assert_eq!(classified.category, ErrorCategory::NetworkTransient);
    assert_eq!(classified.stage, "actor-init");
    assert_eq!(supervisor.stats().auto_retries, 2);
    assert_eq!(started.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_fatal_categories_are_never_auto_retried() {
    let fatal = [
        (stopped_failure(), ErrorCategory::StoppedBackend),
        (Failure::from("Unauthorized: session expired"), ErrorCategory::Authorization),
        (Failure::from("Something odd happened"), ErrorCategory::Unclassified),
    ];
    for (failure, category) in fatal {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(move |_| Err(failure.clone()));
        let supervisor = supervisor_with(connector);

        let err = supervisor.ensure(&identity("rae")).await.unwrap_err();
        assert!(matches!(&err, ConnectError::Failed(e) if e.category == category));
        assert_eq!(supervisor.stats().auto_retries, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_retry_rebuilds_after_fatal_failure() {
    let store = InMemoryStore::new();
    let mut connector = MockConnector::new();
    let mut seq = mockall::Sequence::new();
    connector
        .expect_connect()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Err(stopped_failure()));
    connector
        .expect_connect()
        .times(1)
        .in_sequence(&mut seq)
        .returning(move |id| Ok(Arc::new(store.backend_for(id)) as Arc<dyn Backend>));
    let supervisor = supervisor_with(connector);
    let rae = identity("rae");

    assert!(supervisor.ensure(&rae).await.is_err());
    assert!(supervisor.error().is_some());

    let connection = supervisor.retry().await.expect("retry connects");
    assert!(connection.is_bound_to(&rae));
    assert!(supervisor.is_ready());
    assert!(supervisor.error().is_none());
    assert_eq!(supervisor.stats().user_retries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_from_boot_error_evicts_before_refetch() {
    let harness = BootHarness::new(MockIdentityProvider::signed_in("rae"), fast_config());
    harness
        .store
        .seed_profile(&Principal::new("rae"), UserProfile::new("Rae"));
    harness.connector.push(ConnectStep::Fail(stopped_failure()));
    harness.spawn();

    let phase = expect_phase(&harness, "boot-error").await;
    assert_eq!(
        phase.error().map(|e| e.category),
        Some(ErrorCategory::StoppedBackend)
    );
    assert_eq!(harness.connector.calls(), 1);

    harness.cache.reset_ops();
    let phase = harness.sequencer.retry().await.expect("retry runs");
    assert_eq!(phase, BootPhase::ReadyDashboard);

    let connection_key = CacheKey::Connection(Principal::new("rae"));
    let profile_key = CacheKey::Profile(Principal::new("rae"));
    let ops = harness.cache.ops();
    let evict_connection = ops
        .iter()
        .position(|op| *op == CacheOp::Evict(connection_key.clone()))
        .expect("connection evicted");
    let evict_profile = ops
        .iter()
        .position(|op| *op == CacheOp::Evict(profile_key.clone()))
        .expect("profile evicted");
    let get_connection = ops
        .iter()
        .position(|op| *op == CacheOp::Get(connection_key.clone()))
        .expect("connection looked up");
    let refetch_profile = ops
        .iter()
        .position(|op| *op == CacheOp::Refetch(profile_key.clone()))
        .expect("profile refetched");

    assert!(evict_connection < get_connection);
    assert!(evict_profile < get_connection);
    assert!(evict_profile < refetch_profile);
    assert_eq!(harness.connector.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_retry_stays_in_boot_error() {
    let harness = BootHarness::new(MockIdentityProvider::signed_in("rae"), fast_config());
    harness.connector.push(ConnectStep::Fail(stopped_failure()));
    harness.connector.push(ConnectStep::Fail(stopped_failure()));
    harness.spawn();
    expect_phase(&harness, "boot-error").await;

    let phase = harness.sequencer.retry().await.expect("retry runs");
    assert_eq!(phase.label(), "boot-error");
    assert_eq!(harness.connector.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_retry_is_refused() {
    let harness = BootHarness::new(MockIdentityProvider::signed_in("rae"), fast_config());
    harness.connector.push(ConnectStep::Fail(stopped_failure()));
    harness.spawn();
    expect_phase(&harness, "boot-error").await;

    let first = {
        let sequencer = Arc::clone(&harness.sequencer);
        tokio::spawn(async move { sequencer.retry().await })
    };
    tokio::task::yield_now().await;

    let second = harness.sequencer.retry().await;
    assert_eq!(second.unwrap_err(), BootError::RetryInProgress);
    assert!(first.await.expect("task completes").is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_retry_refused_while_identity_initializing() {
    let harness = BootHarness::new(MockIdentityProvider::initializing(), fast_config());
    let err = harness.sequencer.retry().await.unwrap_err();
    assert_eq!(err, BootError::IdentityInitializing);
}

#[tokio::test(start_paused = true)]
async fn test_logout_during_retry_abandons_it() {
    let harness = BootHarness::new(MockIdentityProvider::signed_in("rae"), fast_config());
    harness
        .store
        .seed_profile(&Principal::new("rae"), UserProfile::new("Rae"));
    harness.connector.push(ConnectStep::Fail(stopped_failure()));
    harness.spawn();
    expect_phase(&harness, "boot-error").await;

    let retry = {
        let sequencer = Arc::clone(&harness.sequencer);
        tokio::spawn(async move { sequencer.retry().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.sequencer.logout().await;

    let phase = retry.await.expect("task completes").expect("retry runs");
    assert_eq!(phase, BootPhase::Unauthenticated);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let supervisor = harness.sequencer.supervisor();
    assert_eq!(supervisor.target(), Some(Identity::anonymous()));
    let connection = supervisor.connection().expect("anonymous connection");
    assert!(connection.is_bound_to(&Identity::anonymous()));
    assert_eq!(harness.connector.calls_for(&Principal::new("rae")), 1);
    assert!(harness
        .cache
        .get(&CacheKey::Profile(Principal::new("rae")))
        .await
        .is_none());
    assert_eq!(harness.sequencer.phase(), BootPhase::Unauthenticated);
}
