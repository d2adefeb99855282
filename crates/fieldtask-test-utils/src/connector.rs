//! Connector replaying a script of outcomes

use crate::backend::InMemoryStore;
use fieldtask_model::{Backend, Connector, Failure, Identity, Principal};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// One scripted connection attempt
#[derive(Debug, Clone)]
pub enum ConnectStep {
    /// Build a backend over the store
    Succeed,
    /// Reject with the failure
    Fail(Failure),
    /// Never resolve
    Hang,
}

/// [`Connector`] over an [`InMemoryStore`] whose outcomes are scripted
///
/// Once the script runs out every attempt succeeds.
#[derive(Debug)]
pub struct ScriptedConnector {
    store: Arc<InMemoryStore>,
    script: Mutex<VecDeque<ConnectStep>>,
    delay: Mutex<Duration>,
    principal_delays: Mutex<HashMap<Principal, Duration>>,
    calls: Mutex<Vec<Principal>>,
}

impl ScriptedConnector {
    pub fn new(store: Arc<InMemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            script: Mutex::new(VecDeque::new()),
            delay: Mutex::new(Duration::ZERO),
            principal_delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, step: ConnectStep) -> &Self {
        self.script.lock().push_back(step);
        self
    }

    pub fn fail_times(&self, times: usize, failure: &Failure) -> &Self {
        for _ in 0..times {
            self.push(ConnectStep::Fail(failure.clone()));
        }
        self
    }

    /// Delay applied to every attempt
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Extra delay for attempts on behalf of one principal
    pub fn delay_principal(&self, principal: &Principal, delay: Duration) {
        self.principal_delays.lock().insert(principal.clone(), delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, principal: &Principal) -> usize {
        self.calls.lock().iter().filter(|p| *p == principal).count()
    }

    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }
}

#[async_trait::async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, identity: &Identity) -> Result<Arc<dyn Backend>, Failure> {
        let principal = identity.principal().clone();
        self.calls.lock().push(principal.clone());
        let step = self.script.lock().pop_front().unwrap_or(ConnectStep::Succeed);
        let delay = *self.delay.lock()
            + self
                .principal_delays
                .lock()
                .get(&principal)
                .copied()
                .unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match step {
            ConnectStep::Succeed => Ok(Arc::new(self.store.backend_for(identity)) as Arc<dyn Backend>),
            ConnectStep::Fail(failure) => Err(failure),
            ConnectStep::Hang => std::future::pending().await,
        }
    }
}
