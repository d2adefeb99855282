//! Boot sequencer
//!
//! Combines identity, connection, profile fetch and watchdog state into the
//! active [`BootPhase`] and drives the Retry and Logout recovery actions.
//!
//! # Example
//!
//! ```rust,ignore
//! let sequencer = Arc::new(BootSequencer::from_config(identity, connector, config, context));
//! tokio::spawn(Arc::clone(&sequencer).run());
//!
//! let mut phases = sequencer.subscribe();
//! while phases.changed().await.is_ok() {
//!     if phases.borrow().is_recoverable() {
//!         sequencer.retry().await?;
//!     }
//! }
//! ```

use crate::cache::{CacheKey, CacheValue, MokaQueryCache, QueryCache};
use crate::classify::{classify_at, stage, ClassifiedError};
use crate::config::BootConfig;
use crate::connection::Connection;
use crate::context::BootContext;
use crate::error::{BootError, GuardError};
use crate::phase::{derive_phase, BootPhase, PhaseInputs, ProfileFetchState};
use crate::supervisor::ConnectionSupervisor;
use crate::watchdog::{BootWatchdog, WatchdogStatus};
use fieldtask_model::{Connector, Failure, Identity, IdentityProvider, Principal, UserProfile};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Profile fetch state tagged with the principal and attempt it belongs to
#[derive(Debug, Default)]
struct ProfileSlot {
    principal: Option<Principal>,
    attempt: u64,
    state: ProfileFetchState,
}

impl ProfileSlot {
    fn state_for(&self, principal: &Principal) -> ProfileFetchState {
        if self.principal.as_ref() == Some(principal) {
            self.state.clone()
        } else {
            ProfileFetchState::NotFetched
        }
    }

    /// Start a new attempt; older attempts can no longer commit
    fn begin(&mut self, principal: &Principal, state: ProfileFetchState) -> u64 {
        self.attempt += 1;
        self.principal = Some(principal.clone());
        self.state = state;
        self.attempt
    }
}

/// Ends the retry it was issued for, unless a newer retry took over
struct RetryGuard<'a> {
    active: &'a Mutex<Option<u64>>,
    epoch: u64,
}

impl Drop for RetryGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock();
        if *active == Some(self.epoch) {
            *active = None;
        }
    }
}

/// Top-level boot state machine
pub struct BootSequencer {
    identity: Arc<dyn IdentityProvider>,
    supervisor: Arc<ConnectionSupervisor>,
    cache: Arc<dyn QueryCache>,
    watchdog: BootWatchdog,
    context: Arc<BootContext>,
    config: BootConfig,
    profile: Mutex<ProfileSlot>,
    /// Epoch of the retry in progress
    retrying: Mutex<Option<u64>>,
    retry_epoch: watch::Sender<u64>,
    phase: watch::Sender<BootPhase>,
}

impl BootSequencer {
    /// Create sequencer over existing parts
    #[must_use]
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        supervisor: Arc<ConnectionSupervisor>,
        cache: Arc<dyn QueryCache>,
        context: Arc<BootContext>,
        config: BootConfig,
    ) -> Self {
        Self {
            identity,
            supervisor,
            cache,
            watchdog: BootWatchdog::new(config.watchdog_timeout()),
            context,
            config,
            profile: Mutex::new(ProfileSlot::default()),
            retrying: Mutex::new(None),
            retry_epoch: watch::Sender::new(0),
            phase: watch::Sender::new(BootPhase::Connecting),
        }
    }

    /// Create sequencer with a moka cache and a fresh supervisor
    #[must_use]
    pub fn from_config(
        identity: Arc<dyn IdentityProvider>,
        connector: Arc<dyn Connector>,
        config: BootConfig,
        context: Arc<BootContext>,
    ) -> Self {
        let cache: Arc<dyn QueryCache> = Arc::new(MokaQueryCache::new(config.cache_capacity));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            connector,
            Arc::clone(&cache),
            config.retry,
        ));
        Self::new(identity, supervisor, cache, context, config)
    }

    /// Active phase
    #[must_use]
    pub fn phase(&self) -> BootPhase {
        self.phase.borrow().clone()
    }

    /// Subscribe to phase changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BootPhase> {
        self.phase.subscribe()
    }

    /// Connection supervisor
    #[inline]
    #[must_use]
    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    /// Boot watchdog
    #[inline]
    #[must_use]
    pub fn watchdog(&self) -> &BootWatchdog {
        &self.watchdog
    }

    /// Diagnostics context
    #[inline]
    #[must_use]
    pub fn context(&self) -> &Arc<BootContext> {
        &self.context
    }

    /// Query cache
    #[inline]
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn QueryCache> {
        &self.cache
    }

    /// Profile fetch state for the current identity
    #[must_use]
    pub fn profile_state(&self) -> ProfileFetchState {
        let principal = self.identity.snapshot().effective_identity().principal().clone();
        self.profile.lock().state_for(&principal)
    }

    /// Recompute the phase from current state
    ///
    /// Feeds the watchdog and records the stage in the boot context.
    pub fn refresh(&self) -> BootPhase {
        let snapshot = self.identity.snapshot();
        let identity = snapshot.effective_identity();
        let connection = self.supervisor.state();
        let connection_error = connection
            .error()
            .filter(|_| self.supervisor.target().as_ref() == Some(&identity));
        let profile = self.profile.lock().state_for(identity.principal());

        let idle = WatchdogStatus::default();
        let mut inputs = PhaseInputs {
            identity_initializing: snapshot.initializing,
            authenticated: snapshot.is_authenticated(),
            connection_ready: self.supervisor.is_ready_for(&identity),
            connection_error,
            profile: &profile,
            watchdog: &idle,
        };
        self.watchdog.observe(inputs.watchdog_flags());
        let status = self.watchdog.status();
        inputs.watchdog = &status;

        let phase = derive_phase(&inputs);
        self.context.record_stage(phase.label());
        let changed = self.phase.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase.clone();
                true
            }
        });
        if changed {
            match &phase {
                BootPhase::BootError(err) => error!(
                    phase = phase.label(),
                    category = %err.category,
                    stage = %err.stage,
                    "boot phase changed"
                ),
                BootPhase::Stuck { reason, .. } => {
                    error!(phase = phase.label(), reason = reason.as_str(), "boot phase changed");
                }
                _ => info!(phase = phase.label(), principal = %identity.principal(), "boot phase changed"),
            }
        }
        phase
    }

    /// Run one boot pass for the current identity
    ///
    /// Ensures the connection and, for authenticated identities, fetches the
    /// profile. Returns early when the identity changes mid-pass.
    pub async fn boot(&self) -> BootPhase {
        let snapshot = self.identity.snapshot();
        if snapshot.initializing {
            return self.refresh();
        }
        let identity = snapshot.effective_identity();
        debug!(principal = %identity.principal(), "boot pass");

        let connection = match self.await_observed(&identity, self.supervisor.ensure(&identity)).await {
            Some(Ok(connection)) => connection,
            Some(Err(err)) => {
                debug!(%err, "boot pass ended without connection");
                return self.refresh();
            }
            None => return self.refresh(),
        };

        if snapshot.is_authenticated()
            && !matches!(self.profile_state(), ProfileFetchState::Fetched(_))
        {
            let _ = self
                .await_observed(&identity, self.load_profile(&connection))
                .await;
        }
        self.refresh()
    }

    /// Boot, then re-boot on every identity change until the provider goes away
    pub async fn run(self: Arc<Self>) {
        let mut identity_rx = self.identity.subscribe();
        loop {
            identity_rx.borrow_and_update();
            self.boot().await;
            if identity_rx.changed().await.is_err() {
                debug!("identity provider closed, boot loop ending");
                break;
            }
        }
    }

    /// Recover from a boot error or a stuck boot
    ///
    /// Drops the current connection and any in-flight work, evicts the
    /// cached connection and profile, waits the settle delay, then rebuilds.
    /// A failed rebuild leaves the phase in boot error rather than returning
    /// an error. The retry is abandoned when the identity changes before it
    /// finishes.
    ///
    /// A retry issued while the phase is stuck supersedes one still running;
    /// otherwise overlapping retries are refused.
    ///
    /// # Errors
    /// - `BootError::RetryInProgress` when another retry is running
    /// - `BootError::IdentityInitializing` before the identity settles
    pub async fn retry(&self) -> Result<BootPhase, BootError> {
        let snapshot = self.identity.snapshot();
        if snapshot.initializing {
            return Err(BootError::IdentityInitializing);
        }
        let guard = self.begin_retry()?;
        let epoch = guard.epoch;
        let identity = snapshot.effective_identity();
        let principal = identity.principal().clone();
        info!(principal = %principal, epoch, "boot retry");

        self.supervisor.restart(&identity);
        self.profile.lock().begin(&principal, ProfileFetchState::NotFetched);
        self.watchdog.reset();
        self.refresh();

        self.cache.evict(&CacheKey::Connection(principal.clone())).await;
        self.cache.evict(&CacheKey::Profile(principal.clone())).await;
        tokio::time::sleep(self.config.retry_settle_delay()).await;

        let current = self.identity.snapshot();
        if current.initializing || current.effective_identity() != identity {
            info!(principal = %principal, "identity changed during retry, retry abandoned");
            return Ok(self.refresh());
        }
        if *self.retry_epoch.borrow() != epoch {
            debug!(epoch, "retry superseded");
            return Ok(self.refresh());
        }

        match self
            .await_retry(&identity, epoch, self.supervisor.ensure(&identity))
            .await
        {
            Some(Ok(connection)) if snapshot.is_authenticated() => {
                let _ = self
                    .await_retry(&identity, epoch, self.load_profile(&connection))
                    .await;
            }
            Some(Ok(_)) | None => {}
            Some(Err(err)) => warn!(%err, "retry did not produce a connection"),
        }
        Ok(self.refresh())
    }

    fn begin_retry(&self) -> Result<RetryGuard<'_>, BootError> {
        let mut active = self.retrying.lock();
        if let Some(running) = *active {
            if !matches!(*self.phase.borrow(), BootPhase::Stuck { .. }) {
                warn!("retry ignored, already in progress");
                return Err(BootError::RetryInProgress);
            }
            info!(superseded = running, "stuck retry superseded");
        }
        let mut epoch = 0;
        self.retry_epoch.send_modify(|current| {
            *current += 1;
            epoch = *current;
        });
        *active = Some(epoch);
        Ok(RetryGuard {
            active: &self.retrying,
            epoch,
        })
    }

    /// [`await_observed`](Self::await_observed), also giving up when a newer
    /// retry supersedes the one at `epoch`
    async fn await_retry<F: Future>(&self, identity: &Identity, epoch: u64, fut: F) -> Option<F::Output> {
        let mut epoch_rx = self.retry_epoch.subscribe();
        tokio::select! {
            biased;
            _ = epoch_rx.wait_for(|current| *current != epoch) => {
                debug!(epoch, "retry superseded");
                None
            }
            out = self.await_observed(identity, fut) => out,
        }
    }

    /// End the session and drop every cached entry
    pub async fn logout(&self) {
        info!("logout");
        self.identity.clear().await;
        self.supervisor.cancel_in_flight();
        self.cache.clear().await;
        self.watchdog.reset();
        {
            let mut slot = self.profile.lock();
            slot.attempt += 1;
            slot.principal = None;
            slot.state = ProfileFetchState::NotFetched;
        }
        self.refresh();
    }

    /// Save the caller's profile from the setup form
    ///
    /// The phase moves straight to the dashboard without passing through
    /// profile loading.
    ///
    /// # Errors
    /// Guard failures, or `GuardError::Backend` when the save was rejected.
    pub async fn save_profile(&self, profile: UserProfile) -> Result<(), GuardError> {
        let identity = self.identity.snapshot().effective_identity();
        let saved = profile.clone();
        self.supervisor
            .with_ready(&identity, stage::PROFILE_SAVE, |backend| async move {
                backend.save_caller_profile(saved).await
            })
            .await?;

        let principal = identity.principal().clone();
        self.cache
            .set(CacheKey::Profile(principal.clone()), CacheValue::Profile(Some(profile.clone())))
            .await;
        self.profile
            .lock()
            .begin(&principal, ProfileFetchState::Fetched(Some(profile)));
        info!(principal = %principal, "profile saved");
        self.refresh();
        Ok(())
    }

    /// Fetch the profile through the cache, retrying transient failures
    async fn load_profile(&self, connection: &Arc<Connection>) -> ProfileFetchState {
        let principal = connection.identity().principal().clone();
        let attempt = self.profile.lock().begin(&principal, ProfileFetchState::Loading);
        self.refresh();

        let key = CacheKey::Profile(principal.clone());
        if let Some(entry) = self.cache.get(&key).await {
            if let (false, CacheValue::Profile(profile)) = (entry.stale, entry.value) {
                debug!(principal = %principal, "profile served from cache");
                return self.finish_profile(&principal, attempt, ProfileFetchState::Fetched(profile));
            }
        }

        let policy = self.config.retry;
        let mut retries = 0;
        let outcome = loop {
            let raw = match self.cache.refetch(key.clone(), &**connection).await {
                Ok(CacheValue::Profile(profile)) => break ProfileFetchState::Fetched(profile),
                Ok(other) => Failure::from(format!("unexpected cache value for profile: {other:?}")),
                Err(raw) => raw,
            };
            let err = classify_at(&raw, stage::PROFILE_FETCH);
            if err.is_registration_required() {
                break ProfileFetchState::Fetched(None);
            }
            if !err.is_auto_retryable() || retries >= policy.max_auto_retries {
                break self.profile_failed(&principal, err);
            }
            retries += 1;
            warn!(principal = %principal, retry = retries, category = %err.category, "profile fetch failed, retrying");
            tokio::time::sleep(policy.delay_for(retries)).await;
            if self.profile.lock().attempt != attempt {
                debug!(attempt, "profile fetch superseded");
                return ProfileFetchState::NotFetched;
            }
        };
        self.finish_profile(&principal, attempt, outcome)
    }

    fn profile_failed(&self, principal: &Principal, err: ClassifiedError) -> ProfileFetchState {
        error!(
            principal = %principal,
            category = %err.category,
            stage = %err.stage,
            detail = %err.raw_detail,
            "profile fetch failed"
        );
        ProfileFetchState::Failed(err)
    }

    /// Commit a fetch result unless a newer attempt started
    fn finish_profile(&self, principal: &Principal, attempt: u64, state: ProfileFetchState) -> ProfileFetchState {
        {
            let mut slot = self.profile.lock();
            if slot.attempt != attempt || slot.principal.as_ref() != Some(principal) {
                debug!(attempt, "profile result disregarded");
                return slot.state.clone();
            }
            slot.state = state.clone();
        }
        self.refresh();
        state
    }

    /// Await `fut` while keeping the phase current
    ///
    /// Returns `None` when the identity changes before `fut` completes.
    async fn await_observed<F: Future>(&self, identity: &Identity, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        let mut connection_rx = self.supervisor.subscribe();
        let mut watchdog_rx = self.watchdog.subscribe();
        let mut identity_rx = self.identity.subscribe();
        loop {
            self.refresh();
            tokio::select! {
                biased;
                out = &mut fut => return Some(out),
                Ok(()) = identity_rx.changed() => {
                    let snapshot = identity_rx.borrow_and_update().clone();
                    if snapshot.initializing || snapshot.effective_identity() != *identity {
                        debug!(principal = %identity.principal(), "identity changed, boot pass abandoned");
                        return None;
                    }
                }
                Ok(()) = connection_rx.changed() => {}
                Ok(()) = watchdog_rx.changed() => {}
            }
        }
    }
}

impl std::fmt::Debug for BootSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = self.phase.borrow().label();
        f.debug_struct("BootSequencer")
            .field("phase", &phase)
            .field("supervisor", &self.supervisor)
            .field("watchdog", &self.watchdog)
            .finish_non_exhaustive()
    }
}
