//! Identities and the identity provider
//!
//! An [`Identity`] is an opaque credential handle owned by the identity
//! provider. The client core never mutates one; it only reads it and reacts
//! when the provider replaces it.

use crate::failure::Failure;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Textual principal of the anonymous caller
pub const ANONYMOUS_PRINCIPAL: &str = "2vxsx-fae";

/// Principal (textual caller id) of an identity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Principal(String);

impl Principal {
    /// Create principal from its textual form
    #[inline]
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// The anonymous principal
    #[inline]
    #[must_use]
    pub fn anonymous() -> Self {
        Self(ANONYMOUS_PRINCIPAL.to_string())
    }

    /// Whether this is the anonymous principal
    #[inline]
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS_PRINCIPAL
    }

    /// Textual form
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Credential handle bound to a principal
///
/// Two identities are the same value iff their principals match; cache keys
/// and connection binding are scoped by principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    principal: Principal,
}

impl Identity {
    /// Create identity for a principal
    #[inline]
    #[must_use]
    pub fn new(principal: Principal) -> Self {
        Self { principal }
    }

    /// The anonymous identity (no real session)
    #[inline]
    #[must_use]
    pub fn anonymous() -> Self {
        Self::new(Principal::anonymous())
    }

    /// Principal this identity acts as
    #[inline]
    #[must_use]
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Whether this identity carries no real session
    #[inline]
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.principal.is_anonymous()
    }
}

/// Point-in-time view of the identity provider
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentitySnapshot {
    /// Provider is still restoring a stored session
    pub initializing: bool,
    /// Settled identity, if any
    pub identity: Option<Identity>,
}

impl IdentitySnapshot {
    /// Snapshot of a provider that is still initializing
    #[inline]
    #[must_use]
    pub fn initializing() -> Self {
        Self {
            initializing: true,
            identity: None,
        }
    }

    /// Settled snapshot
    #[inline]
    #[must_use]
    pub fn settled(identity: Option<Identity>) -> Self {
        Self {
            initializing: false,
            identity,
        }
    }

    /// Identity present and non-anonymous
    #[inline]
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.identity.as_ref().is_some_and(|i| !i.is_anonymous())
    }

    /// Identity the connection should be bound to (anonymous when absent)
    #[must_use]
    pub fn effective_identity(&self) -> Identity {
        self.identity.clone().unwrap_or_else(Identity::anonymous)
    }
}

/// Decentralized identity / session provider
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Start an interactive login; resolves with the new identity
    async fn login(&self) -> Result<Identity, Failure>;

    /// Clear the current session
    async fn clear(&self);

    /// Subscribe to identity changes
    fn subscribe(&self) -> watch::Receiver<IdentitySnapshot>;

    /// Current snapshot
    fn snapshot(&self) -> IdentitySnapshot {
        self.subscribe().borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_identity() {
        assert!(Identity::anonymous().is_anonymous());
        assert!(!Identity::new(Principal::new("abc")).is_anonymous());
    }

    #[test]
    fn snapshot_authentication() {
        assert!(!IdentitySnapshot::initializing().is_authenticated());
        assert!(!IdentitySnapshot::settled(None).is_authenticated());
        assert!(!IdentitySnapshot::settled(Some(Identity::anonymous())).is_authenticated());

        let snap = IdentitySnapshot::settled(Some(Identity::new(Principal::new("abc"))));
        assert!(snap.is_authenticated());
        assert_eq!(snap.effective_identity().principal().as_str(), "abc");
    }

    #[test]
    fn effective_identity_defaults_to_anonymous() {
        assert!(IdentitySnapshot::settled(None).effective_identity().is_anonymous());
    }
}
