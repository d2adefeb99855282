//! Testing utilities for the Fieldtask workspace
//!
//! In-memory collaborators for the boot layer plus a harness wiring them
//! into a [`BootSequencer`].

#![allow(missing_docs)]

pub mod backend;
pub mod cache;
pub mod connector;
pub mod identity;

pub use backend::{InMemoryBackend, InMemoryStore, ANONYMOUS_REJECTED, NOT_REGISTERED};
pub use cache::{CacheOp, RecordingCache};
pub use connector::{ConnectStep, ScriptedConnector};
pub use identity::{identity, MockIdentityProvider};

use fieldtask_boot::{
    BootConfig, BootContext, BootPhase, BootSequencer, ConnectionSupervisor, MokaQueryCache,
    QueryCache, RetryPolicy,
};
use fieldtask_model::{Failure, UserProfile};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Timings short enough for tests under paused time
pub fn fast_config() -> BootConfig {
    BootConfig::default()
        .with_watchdog_timeout(Duration::from_secs(15))
        .with_retry(RetryPolicy {
            max_auto_retries: 2,
            base_delay_ms: 100,
            multiplier: 1.0,
        })
        .with_retry_settle_delay(Duration::from_millis(250))
}

pub fn profile(name: &str) -> UserProfile {
    UserProfile::new(name)
}

/// Raw network failure as the transport reports it
pub fn network_failure() -> Failure {
    Failure::from("TypeError: Failed to fetch")
}

/// Replica reject for a stopped backend
pub fn stopped_failure() -> Failure {
    Failure::reject(5, "IC0508: Canister abc-cai is stopped")
}

/// Sequencer over in-memory collaborators
#[derive(Debug)]
pub struct BootHarness {
    pub store: Arc<InMemoryStore>,
    pub connector: Arc<ScriptedConnector>,
    pub identity: Arc<MockIdentityProvider>,
    pub cache: Arc<RecordingCache<MokaQueryCache>>,
    pub context: Arc<BootContext>,
    pub sequencer: Arc<BootSequencer>,
}

impl BootHarness {
    pub fn new(identity: Arc<MockIdentityProvider>, config: BootConfig) -> Self {
        Self::with_store(InMemoryStore::new(), identity, config)
    }

    pub fn with_store(store: Arc<InMemoryStore>, identity: Arc<MockIdentityProvider>, config: BootConfig) -> Self {
        let connector = ScriptedConnector::new(Arc::clone(&store));
        let cache = Arc::new(RecordingCache::new(MokaQueryCache::new(config.cache_capacity)));
        let shared: Arc<dyn QueryCache> = Arc::clone(&cache) as Arc<dyn QueryCache>;
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::clone(&connector) as Arc<dyn fieldtask_model::Connector>,
            Arc::clone(&shared),
            config.retry,
        ));
        let context = Arc::new(BootContext::new("fieldtask-test"));
        let sequencer = Arc::new(BootSequencer::new(
            Arc::clone(&identity) as Arc<dyn fieldtask_model::IdentityProvider>,
            supervisor,
            shared,
            Arc::clone(&context),
            config,
        ));
        Self {
            store,
            connector,
            identity,
            cache,
            context,
            sequencer,
        }
    }

    /// Spawn the sequencer's boot loop
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.sequencer).run())
    }

    pub fn phases(&self) -> watch::Receiver<BootPhase> {
        self.sequencer.subscribe()
    }
}

/// Wait until the phase satisfies `predicate`
///
/// Returns `None` if the sequencer is dropped first.
pub async fn wait_for_phase(
    rx: &mut watch::Receiver<BootPhase>,
    predicate: impl Fn(&BootPhase) -> bool,
) -> Option<BootPhase> {
    rx.wait_for(|phase| predicate(phase)).await.ok().map(|phase| phase.clone())
}
