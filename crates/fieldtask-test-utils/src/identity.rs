//! Controllable identity provider

use fieldtask_model::{Failure, Identity, IdentityProvider, IdentitySnapshot, Principal};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// [`IdentityProvider`] driven directly by the test
#[derive(Debug)]
pub struct MockIdentityProvider {
    snapshot: watch::Sender<IdentitySnapshot>,
    logins: Mutex<VecDeque<Identity>>,
    clears: AtomicUsize,
}

impl MockIdentityProvider {
    fn with(snapshot: IdentitySnapshot) -> Arc<Self> {
        Arc::new(Self {
            snapshot: watch::Sender::new(snapshot),
            logins: Mutex::new(VecDeque::new()),
            clears: AtomicUsize::new(0),
        })
    }

    /// Provider still restoring a session
    pub fn initializing() -> Arc<Self> {
        Self::with(IdentitySnapshot::initializing())
    }

    /// Settled with no session
    pub fn anonymous() -> Arc<Self> {
        Self::with(IdentitySnapshot::settled(None))
    }

    /// Settled with a session for `principal`
    pub fn signed_in(principal: &str) -> Arc<Self> {
        Self::with(IdentitySnapshot::settled(Some(identity(principal))))
    }

    /// Replace the session as if the user logged in
    pub fn login_as(&self, principal: &str) -> Identity {
        let id = identity(principal);
        self.snapshot.send_replace(IdentitySnapshot::settled(Some(id.clone())));
        id
    }

    /// Finish session restoration
    pub fn settle(&self, identity: Option<Identity>) {
        self.snapshot.send_replace(IdentitySnapshot::settled(identity));
    }

    /// Identity returned by the next `login()`
    pub fn queue_login(&self, principal: &str) {
        self.logins.lock().push_back(identity(principal));
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn login(&self) -> Result<Identity, Failure> {
        let next = self.logins.lock().pop_front();
        let id = next.ok_or_else(|| Failure::from("login window closed by user"))?;
        self.snapshot.send_replace(IdentitySnapshot::settled(Some(id.clone())));
        Ok(id)
    }

    async fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.snapshot.send_replace(IdentitySnapshot::settled(None));
    }

    fn subscribe(&self) -> watch::Receiver<IdentitySnapshot> {
        self.snapshot.subscribe()
    }
}

/// Identity for a principal name
pub fn identity(principal: &str) -> Identity {
    Identity::new(Principal::new(principal))
}
