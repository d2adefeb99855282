//! Boot scenarios driven against in-memory collaborators

use fieldtask_boot::{
    BootConfig, BootDiagnostics, BootPhase, PreRenderFallback, RetryPolicy, StderrSurface,
};
use fieldtask_model::{Principal, UserProfile};
use fieldtask_test_utils::{
    network_failure, stopped_failure, wait_for_phase, BootHarness, ConnectStep, InMemoryStore,
    MockIdentityProvider,
};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{info, warn};

const RETURNING: &str = "returning-user";
const NEWCOMER: &str = "new-user";
const ALICE: &str = "alice";
const BOB: &str = "bob";

/// Delay of the slow connection in the identity-switch scenario
const STALE_CONNECT_DELAY: Duration = Duration::from_millis(1_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum Scenario {
    Anonymous,
    NewUser,
    ReturningUser,
    StoppedBackend,
    FlakyNetwork,
    HungConnection,
    IdentitySwitch,
}

impl Scenario {
    pub(crate) const ALL: [Scenario; 7] = [
        Scenario::Anonymous,
        Scenario::NewUser,
        Scenario::ReturningUser,
        Scenario::StoppedBackend,
        Scenario::FlakyNetwork,
        Scenario::HungConnection,
        Scenario::IdentitySwitch,
    ];

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Scenario::Anonymous => "anonymous",
            Scenario::NewUser => "new-user",
            Scenario::ReturningUser => "returning-user",
            Scenario::StoppedBackend => "stopped-backend",
            Scenario::FlakyNetwork => "flaky-network",
            Scenario::HungConnection => "hung-connection",
            Scenario::IdentitySwitch => "identity-switch",
        }
    }

    /// Phase label the scenario must end in
    pub(crate) fn expected(self) -> &'static str {
        match self {
            Scenario::Anonymous => "unauthenticated",
            Scenario::StoppedBackend => "boot-error",
            Scenario::NewUser
            | Scenario::ReturningUser
            | Scenario::FlakyNetwork
            | Scenario::HungConnection
            | Scenario::IdentitySwitch => "dashboard-ready",
        }
    }

    /// Principal the final connection must be bound to, when it matters
    fn expected_principal(self) -> Option<&'static str> {
        match self {
            Scenario::IdentitySwitch => Some(BOB),
            _ => None,
        }
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scenario::ALL
            .into_iter()
            .find(|scenario| scenario.as_str() == s)
            .ok_or_else(|| format!("unknown scenario: {s}"))
    }
}

/// Timings for the simulator when no config file is given
pub(crate) fn default_config() -> BootConfig {
    BootConfig::default()
        .with_watchdog_timeout(Duration::from_secs(3))
        .with_retry(RetryPolicy {
            max_auto_retries: 2,
            base_delay_ms: 200,
            multiplier: 1.0,
        })
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ScenarioReport {
    pub(crate) scenario: Scenario,
    pub(crate) expected: &'static str,
    pub(crate) final_phase: String,
    pub(crate) phases: Vec<String>,
    pub(crate) connect_calls: usize,
    pub(crate) bound_principal: Option<String>,
    pub(crate) elapsed_ms: u64,
    pub(crate) diagnostics: BootDiagnostics,
}

impl ScenarioReport {
    pub(crate) fn passed(&self) -> bool {
        let bound_ok = self
            .scenario
            .expected_principal()
            .map_or(true, |expected| self.bound_principal.as_deref() == Some(expected));
        self.final_phase == self.expected && bound_ok
    }

    pub(crate) fn generate_text(&self) -> String {
        let mut report = String::new();
        report.push_str(&format!("=== Boot scenario: {} ===\n\n", self.scenario.as_str()));
        report.push_str(&format!("Phases: {}\n", self.phases.join(" -> ")));
        report.push_str(&format!("Final phase: {} (expected {})\n", self.final_phase, self.expected));
        report.push_str(&format!("Connect calls: {}\n", self.connect_calls));
        if let Some(principal) = &self.bound_principal {
            report.push_str(&format!("Connection bound to: {principal}\n"));
        }
        report.push_str(&format!("Elapsed: {}ms\n", self.elapsed_ms));
        report.push_str("\n=== Diagnostics ===\n");
        report.push_str(&self.diagnostics.clipboard_payload());
        report.push_str(&format!(
            "\n\nResult: {}\n",
            if self.passed() { "PASSED" } else { "FAILED" }
        ));
        report
    }
}

/// Run one scenario to completion
pub(crate) async fn run_scenario(scenario: Scenario, config: BootConfig) -> ScenarioReport {
    let started = Instant::now();
    let limit = config.watchdog_timeout() * 3;
    let harness = setup(scenario, config);

    let fallback = PreRenderFallback::new(Arc::clone(&harness.context), Arc::new(StderrSurface));
    fallback.install();

    let (stop_tx, stop_rx) = oneshot::channel();
    let recorder = tokio::spawn(record_phases(harness.phases(), stop_rx));
    let boot = harness.spawn();
    fallback.mark_render_started();
    info!(scenario = scenario.as_str(), "scenario started");

    drive(scenario, &harness, limit).await;
    if !settle(&harness, scenario.expected(), limit).await {
        warn!(
            scenario = scenario.as_str(),
            expected = scenario.expected(),
            "expected phase not reached"
        );
    }

    boot.abort();
    let _ = stop_tx.send(());
    let phases = recorder.await.unwrap_or_default();
    let phase = harness.sequencer.phase();
    let bound_principal = harness
        .sequencer
        .supervisor()
        .connection()
        .map(|connection| connection.identity().principal().to_string());

    ScenarioReport {
        scenario,
        expected: scenario.expected(),
        final_phase: phase.label().to_string(),
        phases,
        connect_calls: harness.connector.calls(),
        bound_principal,
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        diagnostics: harness.context.diagnostics(phase.error()),
    }
}

fn setup(scenario: Scenario, config: BootConfig) -> BootHarness {
    let store = InMemoryStore::new();
    store.seed_profile(&Principal::new(RETURNING), UserProfile::new("Rae"));
    store.seed_profile(&Principal::new(BOB), UserProfile::new("Bob"));

    let provider = match scenario {
        Scenario::Anonymous | Scenario::NewUser => MockIdentityProvider::anonymous(),
        Scenario::IdentitySwitch => MockIdentityProvider::signed_in(ALICE),
        _ => MockIdentityProvider::signed_in(RETURNING),
    };
    let harness = BootHarness::with_store(store, provider, config);

    let connector = &harness.connector;
    match scenario {
        Scenario::NewUser => connector.set_delay(Duration::from_millis(200)),
        Scenario::StoppedBackend => {
            connector.push(ConnectStep::Fail(stopped_failure()));
        }
        Scenario::FlakyNetwork => {
            connector.fail_times(2, &network_failure());
        }
        Scenario::HungConnection => {
            connector.push(ConnectStep::Hang);
        }
        Scenario::IdentitySwitch => {
            connector.delay_principal(&Principal::new(ALICE), STALE_CONNECT_DELAY);
        }
        Scenario::Anonymous | Scenario::ReturningUser => {}
    }
    harness
}

/// User actions taken while the scenario runs
async fn drive(scenario: Scenario, harness: &BootHarness, limit: Duration) {
    match scenario {
        Scenario::NewUser => {
            settle(harness, "unauthenticated", limit).await;
            harness.identity.login_as(NEWCOMER);
            if settle(harness, "profile-setup-required", limit).await {
                if let Err(err) = harness.sequencer.save_profile(UserProfile::new("Nova")).await {
                    warn!(error = %err, "profile save failed");
                }
            }
        }
        Scenario::HungConnection => {
            if settle(harness, "stuck", limit).await {
                match harness.sequencer.retry().await {
                    Ok(phase) => info!(phase = phase.label(), "retry finished"),
                    Err(err) => warn!(error = %err, "retry refused"),
                }
            }
        }
        Scenario::IdentitySwitch => {
            tokio::time::sleep(Duration::from_millis(100)).await;
            harness.identity.login_as(BOB);
            settle(harness, "dashboard-ready", limit).await;
            // Let the superseded attempt for the first identity finish
            tokio::time::sleep(STALE_CONNECT_DELAY).await;
        }
        Scenario::Anonymous
        | Scenario::ReturningUser
        | Scenario::StoppedBackend
        | Scenario::FlakyNetwork => {}
    }
}

async fn settle(harness: &BootHarness, label: &str, limit: Duration) -> bool {
    let mut rx = harness.phases();
    tokio::time::timeout(limit, wait_for_phase(&mut rx, |phase| phase.label() == label))
        .await
        .ok()
        .flatten()
        .is_some()
}

async fn record_phases(mut rx: watch::Receiver<BootPhase>, mut stop: oneshot::Receiver<()>) -> Vec<String> {
    let mut seen = vec![rx.borrow_and_update().label().to_string()];
    loop {
        tokio::select! {
            biased;
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let label = rx.borrow_and_update().label();
                if seen.last().map(String::as_str) != Some(label) {
                    seen.push(label.to_string());
                }
            }
            _ = &mut stop => break,
        }
    }
    seen
}
