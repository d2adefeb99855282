//! Backend connections and their lifecycle state

use crate::cache::{CacheKey, CacheValue, EntryLoader};
use crate::classify::{classify_at, stage, ClassifiedError};
use fieldtask_model::{Backend, Failure, Identity};
use std::fmt;
use std::sync::Arc;

/// Backend client bound to one identity
///
/// Immutable once created: a different identity always gets a new
/// `Connection`. Callers must re-read the current connection from the
/// supervisor before every operation instead of holding on to one.
#[derive(Clone)]
pub struct Connection {
    identity: Identity,
    generation: u64,
    backend: Arc<dyn Backend>,
}

impl Connection {
    /// Bind a backend client to an identity
    #[must_use]
    pub fn new(identity: Identity, generation: u64, backend: Arc<dyn Backend>) -> Self {
        Self {
            identity,
            generation,
            backend,
        }
    }

    /// Identity this connection acts as
    #[inline]
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Supervisor generation that produced this connection
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Backend client
    #[inline]
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Whether this connection acts as `identity`
    #[inline]
    #[must_use]
    pub fn is_bound_to(&self, identity: &Identity) -> bool {
        self.identity == *identity
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("principal", self.identity.principal())
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl EntryLoader for Connection {
    async fn load(&self, key: &CacheKey) -> Result<CacheValue, Failure> {
        if key.principal() != self.identity.principal() {
            return Err(Failure::from(format!(
                "cache key {key:?} is scoped to another principal than {}",
                self.identity.principal()
            )));
        }

        match key {
            CacheKey::Connection(_) => Err(Failure::from(
                "connection entries are built by the supervisor, not loaded",
            )),
            CacheKey::Profile(_) => match self.backend.get_caller_profile().await {
                Ok(profile) => Ok(CacheValue::Profile(profile)),
                // No profile yet; a new user, not a failure
                Err(raw) if classify_at(&raw, stage::PROFILE_FETCH).is_registration_required() => {
                    Ok(CacheValue::Profile(None))
                }
                Err(raw) => Err(raw),
            },
            CacheKey::Fields(_) => self.backend.list_fields().await.map(CacheValue::Fields),
            CacheKey::Tasks(_) => self.backend.list_all_tasks().await.map(CacheValue::Tasks),
            CacheKey::TasksByField(_, field) => self
                .backend
                .list_tasks_by_field(field.clone())
                .await
                .map(CacheValue::Tasks),
        }
    }
}

/// Lifecycle state of the current connection
#[derive(Debug, Clone, Default)]
pub enum ConnectionState {
    /// Nothing requested yet
    #[default]
    NotStarted,
    /// Construction in flight
    Initializing,
    /// Connection usable
    Ready(Arc<Connection>),
    /// Construction failed
    Failed(ClassifiedError),
}

impl ConnectionState {
    /// Stable label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Initializing => "initializing",
            Self::Ready(_) => "ready",
            Self::Failed(_) => "failed",
        }
    }

    /// Ready connection, if any
    #[inline]
    #[must_use]
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        match self {
            Self::Ready(connection) => Some(connection),
            _ => None,
        }
    }

    /// Construction failure, if any
    #[inline]
    #[must_use]
    pub fn error(&self) -> Option<&ClassifiedError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Whether construction is in flight
    #[inline]
    #[must_use]
    pub fn is_initializing(&self) -> bool {
        matches!(self, Self::Initializing)
    }
}

impl PartialEq for ConnectionState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::NotStarted, Self::NotStarted) | (Self::Initializing, Self::Initializing) => true,
            (Self::Ready(a), Self::Ready(b)) => Arc::ptr_eq(a, b),
            (Self::Failed(a), Self::Failed(b)) => a == b,
            _ => false,
        }
    }
}
