//! Connection supervisor
//!
//! Owns the single current backend [`Connection`]:
//! - Construction bound to the current identity, with bounded automatic
//!   retries for transient network failures
//! - Atomic replacement on identity change; results of superseded attempts
//!   are disregarded
//! - Purge and refetch of identity-scoped cache entries after a rebuild
//! - Readiness guard for mutations

use crate::cache::{CacheKey, CacheValue, QueryCache};
use crate::classify::{classify_at, stage, ClassifiedError};
use crate::config::RetryPolicy;
use crate::connection::{Connection, ConnectionState};
use crate::error::{ConnectError, GuardError};
use fieldtask_model::{Backend, Connector, Failure, Identity, Principal};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Supervisor statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    /// Connector calls made
    pub attempts: u64,
    /// Automatic retries after transient failures
    pub auto_retries: u64,
    /// User-initiated retries
    pub user_retries: u64,
    /// Connections committed
    pub connections_built: u64,
    /// Results disregarded because a newer attempt existed
    pub superseded: u64,
    /// Connections reused from the cache
    pub cache_hits: u64,
}

#[derive(Debug, Default)]
struct Inner {
    /// Identity the current (or in-flight) connection is for
    target: Option<Identity>,
    /// Bumped for every attempt and every cancellation
    generation: u64,
    /// Generation of the attempt in flight
    in_flight: Option<u64>,
    /// Principal of the last committed connection
    last_bound: Option<Principal>,
    stats: SupervisorStats,
}

/// Owner of the current backend connection
pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    cache: Arc<dyn QueryCache>,
    policy: RetryPolicy,
    inner: Mutex<Inner>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionSupervisor {
    /// Create supervisor
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, cache: Arc<dyn QueryCache>, policy: RetryPolicy) -> Self {
        Self {
            connector,
            cache,
            policy,
            inner: Mutex::new(Inner::default()),
            state: watch::Sender::new(ConnectionState::NotStarted),
        }
    }

    /// Ensure a connection bound to `identity` exists
    ///
    /// Returns the current connection when it is already bound to
    /// `identity`; otherwise starts a new attempt that supersedes any
    /// attempt in flight.
    ///
    /// # Errors
    /// - `ConnectError::Failed` when construction failed after automatic retries
    /// - `ConnectError::Superseded` when a newer attempt replaced this one
    pub async fn ensure(&self, identity: &Identity) -> Result<Arc<Connection>, ConnectError> {
        if let Some(connection) = self.ready_for(identity) {
            return Ok(connection);
        }
        if let Some(waiting) = self.joinable(identity) {
            return self.wait_for(waiting).await;
        }
        self.construct(identity).await
    }

    /// Rebuild the connection for the bound identity
    ///
    /// Cancels the attempt in flight and evicts the cached connection first,
    /// so a poisoned connection cannot be reused.
    ///
    /// # Errors
    /// Same as [`ensure`](Self::ensure).
    pub async fn retry(&self) -> Result<Arc<Connection>, ConnectError> {
        let identity = self.target().unwrap_or_else(Identity::anonymous);
        self.restart(&identity);
        self.evict_connection(&identity).await;
        self.construct(&identity).await
    }

    /// Drop the current connection and any attempt in flight for a user retry
    ///
    /// The state reads initializing until the next construction for
    /// `identity` commits, so [`ensure`](Self::ensure) builds a fresh
    /// connection instead of returning the dropped one.
    pub fn restart(&self, identity: &Identity) {
        let mut inner = self.inner.lock();
        inner.stats.user_retries += 1;
        inner.generation += 1;
        inner.in_flight = None;
        inner.target = Some(identity.clone());
        self.state.send_replace(ConnectionState::Initializing);
        info!(principal = %identity.principal(), generation = inner.generation, "connection retry requested");
    }

    /// Disregard the result of the attempt in flight
    ///
    /// Transport calls cannot be aborted; the result is dropped on arrival.
    pub fn cancel_in_flight(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        if let Some(attempt) = inner.in_flight.take() {
            debug!(attempt, "connection attempt cancelled");
            self.state.send_if_modified(|state| {
                if state.is_initializing() {
                    *state = ConnectionState::NotStarted;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Remove the cached connection for `identity`
    pub async fn evict_connection(&self, identity: &Identity) {
        self.cache
            .evict(&CacheKey::Connection(identity.principal().clone()))
            .await;
    }

    /// Current connection, if ready and not being replaced
    #[must_use]
    pub fn connection(&self) -> Option<Arc<Connection>> {
        let inner = self.inner.lock();
        if inner.in_flight.is_some() {
            return None;
        }
        self.state.borrow().connection().cloned()
    }

    /// Whether a connection is ready and no newer construction is in flight
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.connection().is_some()
    }

    /// Whether a connection bound to `identity` is ready
    #[must_use]
    pub fn is_ready_for(&self, identity: &Identity) -> bool {
        self.ready_for(identity).is_some()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Subscribe to state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Construction failure, if the current state is failed
    #[must_use]
    pub fn error(&self) -> Option<ClassifiedError> {
        self.state.borrow().error().cloned()
    }

    /// Identity the supervisor is bound to
    #[must_use]
    pub fn target(&self) -> Option<Identity> {
        self.inner.lock().target.clone()
    }

    /// Statistics
    #[must_use]
    pub fn stats(&self) -> SupervisorStats {
        self.inner.lock().stats
    }

    /// Connection to use for a mutation on behalf of `identity`
    ///
    /// # Errors
    /// - `GuardError::LoginRequired` for the anonymous identity
    /// - `GuardError::ConnectionInitializing` while construction is pending
    /// - `GuardError::ConnectionUnavailable` when construction failed or the
    ///   connection belongs to another identity
    pub fn require_ready(&self, identity: &Identity) -> Result<Arc<Connection>, GuardError> {
        if identity.is_anonymous() {
            return Err(GuardError::LoginRequired);
        }
        if let Some(connection) = self.ready_for(identity) {
            return Ok(connection);
        }
        let in_flight = self.inner.lock().in_flight.is_some();
        match &*self.state.borrow() {
            _ if in_flight => Err(GuardError::ConnectionInitializing),
            ConnectionState::NotStarted | ConnectionState::Initializing => {
                Err(GuardError::ConnectionInitializing)
            }
            ConnectionState::Ready(_) | ConnectionState::Failed(_) => {
                Err(GuardError::ConnectionUnavailable)
            }
        }
    }

    /// Run a backend mutation through the readiness guard
    ///
    /// The connection is looked up for this call only. Backend failures are
    /// classified with `operation` as their stage.
    ///
    /// # Errors
    /// Guard failures as in [`require_ready`](Self::require_ready), or
    /// `GuardError::Backend` when the backend rejected the call.
    pub async fn with_ready<T, F, Fut>(
        &self,
        identity: &Identity,
        operation: &str,
        f: F,
    ) -> Result<T, GuardError>
    where
        F: FnOnce(Arc<dyn Backend>) -> Fut + Send,
        Fut: Future<Output = Result<T, Failure>> + Send,
    {
        let connection = self.require_ready(identity)?;
        f(Arc::clone(connection.backend())).await.map_err(|raw| {
            let err = classify_at(&raw, operation);
            warn!(operation, category = %err.category, "mutation failed");
            GuardError::Backend(err)
        })
    }

    fn ready_for(&self, identity: &Identity) -> Option<Arc<Connection>> {
        self.connection().filter(|c| c.is_bound_to(identity))
    }

    /// Receiver to wait on when an attempt for `identity` is already in flight
    fn joinable(&self, identity: &Identity) -> Option<(u64, watch::Receiver<ConnectionState>)> {
        let inner = self.inner.lock();
        match (inner.in_flight, &inner.target) {
            (Some(attempt), Some(target)) if target == identity => Some((attempt, self.state.subscribe())),
            _ => None,
        }
    }

    async fn wait_for(
        &self,
        (attempt, mut rx): (u64, watch::Receiver<ConnectionState>),
    ) -> Result<Arc<Connection>, ConnectError> {
        loop {
            {
                let inner = self.inner.lock();
                if inner.in_flight != Some(attempt) {
                    if inner.generation != attempt {
                        return Err(ConnectError::Superseded { attempt });
                    }
                    return match &*rx.borrow_and_update() {
                        ConnectionState::Ready(c) if c.generation() == attempt => Ok(Arc::clone(c)),
                        ConnectionState::Failed(err) => Err(ConnectError::Failed(err.clone())),
                        _ => Err(ConnectError::Superseded { attempt }),
                    };
                }
            }
            if rx.changed().await.is_err() {
                return Err(ConnectError::Superseded { attempt });
            }
        }
    }

    async fn construct(&self, identity: &Identity) -> Result<Arc<Connection>, ConnectError> {
        let attempt = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            let attempt = inner.generation;
            inner.target = Some(identity.clone());
            inner.in_flight = Some(attempt);
            self.state.send_replace(ConnectionState::Initializing);
            attempt
        };
        info!(principal = %identity.principal(), attempt, "connection initializing");

        let key = CacheKey::Connection(identity.principal().clone());
        if let Some(entry) = self.cache.get(&key).await {
            if let (false, CacheValue::Connection(cached)) = (entry.stale, &entry.value) {
                if cached.is_bound_to(identity) {
                    debug!(principal = %identity.principal(), "connection served from cache");
                    self.inner.lock().stats.cache_hits += 1;
                    let backend = Arc::clone(cached.backend());
                    return self.commit(identity, attempt, Ok(backend)).await;
                }
            }
        }

        let outcome = self.connect_with_retries(identity, attempt).await?;
        self.commit(identity, attempt, outcome).await
    }

    async fn connect_with_retries(
        &self,
        identity: &Identity,
        attempt: u64,
    ) -> Result<Result<Arc<dyn Backend>, ClassifiedError>, ConnectError> {
        let mut retries = 0;
        loop {
            self.inner.lock().stats.attempts += 1;
            let raw = match self.connector.connect(identity).await {
                Ok(backend) => return Ok(Ok(backend)),
                Err(raw) => raw,
            };
            self.check_current(attempt)?;

            let err = classify_at(&raw, stage::ACTOR_INIT);
            if !err.is_auto_retryable() || retries >= self.policy.max_auto_retries {
                return Ok(Err(err));
            }

            retries += 1;
            self.inner.lock().stats.auto_retries += 1;
            let delay = self.policy.delay_for(retries);
            warn!(
                principal = %identity.principal(),
                attempt,
                retry = retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                category = %err.category,
                "connection failed, retrying"
            );
            tokio::time::sleep(delay).await;
            self.check_current(attempt)?;
        }
    }

    fn check_current(&self, attempt: u64) -> Result<(), ConnectError> {
        let mut inner = self.inner.lock();
        if inner.generation == attempt {
            Ok(())
        } else {
            inner.stats.superseded += 1;
            debug!(attempt, current = inner.generation, "connection attempt superseded");
            Err(ConnectError::Superseded { attempt })
        }
    }

    async fn commit(
        &self,
        identity: &Identity,
        attempt: u64,
        outcome: Result<Arc<dyn Backend>, ClassifiedError>,
    ) -> Result<Arc<Connection>, ConnectError> {
        let (connection, replaced) = {
            let mut inner = self.inner.lock();
            if inner.generation != attempt {
                inner.stats.superseded += 1;
                debug!(attempt, current = inner.generation, "connection result disregarded");
                return Err(ConnectError::Superseded { attempt });
            }
            inner.in_flight = None;
            match outcome {
                Ok(backend) => {
                    let connection = Arc::new(Connection::new(identity.clone(), attempt, backend));
                    let replaced = inner.last_bound.replace(identity.principal().clone()).is_some();
                    inner.stats.connections_built += 1;
                    self.state.send_replace(ConnectionState::Ready(Arc::clone(&connection)));
                    (connection, replaced)
                }
                Err(err) => {
                    error!(
                        principal = %identity.principal(),
                        attempt,
                        category = %err.category,
                        stage = %err.stage,
                        detail = %err.raw_detail,
                        "connection failed"
                    );
                    self.state.send_replace(ConnectionState::Failed(err.clone()));
                    return Err(ConnectError::Failed(err));
                }
            }
        };

        info!(principal = %identity.principal(), attempt, "connection ready");
        let principal = identity.principal().clone();
        self.cache
            .set(CacheKey::Connection(principal), CacheValue::Connection(Arc::clone(&connection)))
            .await;
        if replaced {
            self.purge_and_refetch(&connection).await;
        }
        Ok(connection)
    }

    /// Invalidate everything but connection entries, then reload the
    /// field list and profile for the new identity
    async fn purge_and_refetch(&self, connection: &Arc<Connection>) {
        let marked = self.cache.invalidate_matching(&|key: &CacheKey| !key.is_connection()).await;
        debug!(marked, "identity-scoped cache entries invalidated");

        let principal = connection.identity().principal().clone();
        let loader: &Connection = connection;
        let (fields, profile) = futures::join!(
            self.cache.refetch(CacheKey::Fields(principal.clone()), loader),
            self.cache.refetch(CacheKey::Profile(principal.clone()), loader),
        );
        for (what, result) in [("fields", fields.err()), ("profile", profile.err())] {
            if let Some(raw) = result {
                let err = classify_at(&raw, stage::PROFILE_FETCH);
                warn!(principal = %principal, what, category = %err.category, "refetch after rebuild failed");
            }
        }
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow().label();
        let inner = self.inner.lock();
        f.debug_struct("ConnectionSupervisor")
            .field("state", &state)
            .field("inner", &*inner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MokaQueryCache;
    use crate::classify::ErrorCategory;
    use fieldtask_model::{
        ExportBundle, Field, FieldDraft, FieldId, Principal, Task, TaskAttribute, TaskDraft, TaskId,
        UserProfile,
    };
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Backend that answers every read with empty data
    struct NullBackend;

    #[async_trait::async_trait]
    impl Backend for NullBackend {
        async fn get_caller_profile(&self) -> Result<Option<UserProfile>, Failure> {
            Ok(None)
        }
        async fn save_caller_profile(&self, _: UserProfile) -> Result<(), Failure> {
            Ok(())
        }
        async fn create_field(&self, _: FieldDraft) -> Result<FieldId, Failure> {
            Err(Failure::from("Unauthorized"))
        }
        async fn list_fields(&self) -> Result<Vec<Field>, Failure> {
            Ok(Vec::new())
        }
        async fn update_field(&self, _: FieldId, _: FieldDraft) -> Result<(), Failure> {
            Ok(())
        }
        async fn delete_field(&self, _: FieldId) -> Result<(), Failure> {
            Ok(())
        }
        async fn create_task(&self, _: TaskDraft) -> Result<TaskId, Failure> {
            Ok(TaskId("t".into()))
        }
        async fn list_all_tasks(&self) -> Result<Vec<Task>, Failure> {
            Ok(Vec::new())
        }
        async fn list_tasks_by_field(&self, _: FieldId) -> Result<Vec<Task>, Failure> {
            Ok(Vec::new())
        }
        async fn update_task(&self, _: TaskId, _: TaskDraft) -> Result<(), Failure> {
            Ok(())
        }
        async fn delete_task(&self, _: TaskId) -> Result<(), Failure> {
            Ok(())
        }
        async fn mark_completed(&self, _: TaskId) -> Result<(), Failure> {
            Ok(())
        }
        async fn undo_completion(&self, _: TaskId) -> Result<(), Failure> {
            Ok(())
        }
        async fn move_to_field(&self, _: TaskId, _: FieldId) -> Result<(), Failure> {
            Ok(())
        }
        async fn search_tasks(&self, _: FieldId, _: String) -> Result<Vec<Task>, Failure> {
            Ok(Vec::new())
        }
        async fn filter_by_attribute(
            &self,
            _: FieldId,
            _: TaskAttribute,
            _: u64,
            _: u64,
        ) -> Result<Vec<Task>, Failure> {
            Ok(Vec::new())
        }
        async fn export_all(&self) -> Result<ExportBundle, Failure> {
            Ok(ExportBundle::default())
        }
        async fn import_all(&self, _: ExportBundle) -> Result<(), Failure> {
            Ok(())
        }
    }

    /// Connector replaying queued outcomes, then succeeding
    #[derive(Default)]
    struct QueueConnector {
        outcomes: Mutex<VecDeque<Result<(), Failure>>>,
        calls: Mutex<u32>,
    }

    impl QueueConnector {
        fn failing(times: usize, raw: &str) -> Self {
            let connector = Self::default();
            for _ in 0..times {
                connector.outcomes.lock().push_back(Err(Failure::from(raw)));
            }
            connector
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait::async_trait]
    impl Connector for QueueConnector {
        async fn connect(&self, _: &Identity) -> Result<Arc<dyn Backend>, Failure> {
            *self.calls.lock() += 1;
            let next = self.outcomes.lock().pop_front();
            match next {
                Some(Err(raw)) => Err(raw),
                _ => Ok(Arc::new(NullBackend)),
            }
        }
    }

    fn alice() -> Identity {
        Identity::new(Principal::new("alice"))
    }

    fn supervisor(connector: Arc<QueueConnector>) -> ConnectionSupervisor {
        ConnectionSupervisor::new(connector, Arc::new(MokaQueryCache::new(64)), RetryPolicy::default())
    }

    #[tokio::test]
    async fn builds_once_per_identity() {
        let connector = Arc::new(QueueConnector::default());
        let sup = supervisor(Arc::clone(&connector));

        assert!(matches!(sup.state(), ConnectionState::NotStarted));
        let first = sup.ensure(&alice()).await.unwrap();
        let second = sup.ensure(&alice()).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.calls(), 1);
        assert!(sup.is_ready());
        assert!(sup.is_ready_for(&alice()));
    }

    #[tokio::test(start_paused = true)]
    async fn network_failures_retry_twice_then_fail() {
        let connector = Arc::new(QueueConnector::failing(3, "network error"));
        let sup = supervisor(Arc::clone(&connector));

        let err = sup.ensure(&alice()).await.unwrap_err();
        let classified = err.classified().unwrap();
        assert_eq!(classified.category, ErrorCategory::NetworkTransient);
        assert_eq!(classified.stage, stage::ACTOR_INIT);
        assert_eq!(connector.calls(), 3);
        assert_eq!(sup.stats().auto_retries, 2);
        assert!(sup.error().is_some());
        assert!(!sup.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn network_failure_recovers_within_budget() {
        let connector = Arc::new(QueueConnector::failing(1, "Failed to fetch"));
        let sup = supervisor(Arc::clone(&connector));

        assert!(sup.ensure(&alice()).await.is_ok());
        assert_eq!(connector.calls(), 2);
    }

    #[tokio::test]
    async fn fatal_categories_never_auto_retry() {
        for raw in ["Canister abc is stopped", "Unauthorized", "something odd"] {
            let connector = Arc::new(QueueConnector::failing(1, raw));
            let sup = supervisor(Arc::clone(&connector));
            assert!(sup.ensure(&alice()).await.is_err());
            assert_eq!(connector.calls(), 1, "{raw}");
            assert_eq!(sup.stats().auto_retries, 0);
        }
    }

    #[tokio::test]
    async fn retry_rebuilds_after_failure() {
        let connector = Arc::new(QueueConnector::failing(1, "Unauthorized"));
        let sup = supervisor(Arc::clone(&connector));

        assert!(sup.ensure(&alice()).await.is_err());
        let connection = sup.retry().await.unwrap();
        assert!(connection.is_bound_to(&alice()));
        assert_eq!(sup.stats().user_retries, 1);
    }

    #[tokio::test]
    async fn restart_drops_ready_connection() {
        let connector = Arc::new(QueueConnector::default());
        let sup = supervisor(Arc::clone(&connector));
        let first = sup.ensure(&alice()).await.unwrap();

        sup.restart(&alice());
        assert!(sup.state().is_initializing());
        assert!(!sup.is_ready_for(&alice()));
        assert_eq!(
            sup.require_ready(&alice()).unwrap_err(),
            GuardError::ConnectionInitializing
        );

        sup.evict_connection(&alice()).await;
        let second = sup.ensure(&alice()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.generation() > first.generation());
        assert_eq!(connector.calls(), 2);
        assert_eq!(sup.stats().user_retries, 1);
    }

    #[tokio::test]
    async fn guard_reports_readiness() {
        let connector = Arc::new(QueueConnector::failing(1, "Unauthorized"));
        let sup = supervisor(Arc::clone(&connector));

        assert_eq!(
            sup.require_ready(&Identity::anonymous()).unwrap_err(),
            GuardError::LoginRequired
        );
        assert_eq!(
            sup.require_ready(&alice()).unwrap_err(),
            GuardError::ConnectionInitializing
        );

        let _ = sup.ensure(&alice()).await;
        assert_eq!(
            sup.require_ready(&alice()).unwrap_err(),
            GuardError::ConnectionUnavailable
        );

        sup.retry().await.unwrap();
        assert!(sup.require_ready(&alice()).is_ok());

        let err = sup
            .with_ready(&alice(), "create-field", |backend| async move {
                backend.create_field(FieldDraft::named("Work")).await
            })
            .await
            .unwrap_err();
        match err {
            GuardError::Backend(classified) => {
                assert_eq!(classified.category, ErrorCategory::Authorization);
                assert_eq!(classified.stage, "create-field");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_attempt_is_disregarded() {
        let connector = Arc::new(QueueConnector::failing(1, "network timeout"));
        let sup = Arc::new(supervisor(Arc::clone(&connector)));

        let pending = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.ensure(&alice()).await }
        });
        // Let the first attempt fail and start its backoff sleep
        tokio::time::sleep(Duration::from_millis(10)).await;
        sup.cancel_in_flight();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ConnectError::Superseded { .. })));
        assert!(!sup.is_ready());
        assert!(sup.stats().superseded >= 1);
    }
}
