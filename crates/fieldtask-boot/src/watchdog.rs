//! Boot watchdog
//!
//! Declares the boot stuck when an authenticated session makes no forward
//! progress toward a fetched profile within a deadline. The deadline is soft:
//! it never cancels the underlying work, it only changes what is shown.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Flags the watchdog observes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchdogFlags {
    /// Identity present and non-anonymous
    pub authenticated: bool,
    /// Connection construction in flight
    pub connection_initializing: bool,
    /// Profile fetch in flight
    pub profile_loading: bool,
    /// Profile fetch settled
    pub profile_fetched: bool,
    /// Connection construction failed; nothing is in progress
    pub connection_failed: bool,
}

impl WatchdogFlags {
    /// Whether progress is being waited for
    #[inline]
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.authenticated && !self.profile_fetched && !self.connection_failed
    }
}

/// Why the boot was declared stuck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StuckReason {
    /// Connection construction never finished
    ConnectionInitializing,
    /// Profile fetch started but never settled
    ProfileLoading,
    /// Profile fetch never started although the connection was up
    ProfileFetchNeverEnabled,
}

impl StuckReason {
    /// Pick the reason from the flags at deadline time
    #[must_use]
    pub fn from_flags(flags: WatchdogFlags) -> Self {
        if flags.connection_initializing {
            Self::ConnectionInitializing
        } else if flags.profile_loading {
            Self::ProfileLoading
        } else {
            Self::ProfileFetchNeverEnabled
        }
    }

    /// Stable label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionInitializing => "connection-initializing",
            Self::ProfileLoading => "profile-loading",
            Self::ProfileFetchNeverEnabled => "profile-fetch-never-enabled",
        }
    }

    /// Human-readable explanation
    #[must_use]
    pub fn message(self, timeout: Duration) -> String {
        let secs = timeout.as_secs();
        match self {
            Self::ConnectionInitializing => {
                format!("Connecting to the backend is taking longer than {secs} seconds.")
            }
            Self::ProfileLoading => {
                format!("Loading your profile is taking longer than {secs} seconds.")
            }
            Self::ProfileFetchNeverEnabled => format!(
                "Your profile did not start loading within {secs} seconds. The connection may not have become ready."
            ),
        }
    }
}

/// Observable watchdog status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchdogStatus {
    /// Deadline elapsed without progress
    pub is_stuck: bool,
    /// Why, when stuck
    pub reason: Option<StuckReason>,
    /// Display text for `reason`
    pub stuck_reason: Option<String>,
}

struct ArmedTimer {
    handle: JoinHandle<()>,
    armed_since: Instant,
    deadline: Instant,
}

#[derive(Default)]
struct TimerState {
    /// Last observed flags; `None` after a reset
    flags: Option<WatchdogFlags>,
    /// Bumped on every arm and disarm; a firing timer with an old epoch is ignored
    epoch: u64,
    timer: Option<ArmedTimer>,
}

impl TimerState {
    fn disarm(&mut self) -> bool {
        self.epoch += 1;
        match self.timer.take() {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }
}

struct Shared {
    timeout: Duration,
    state: Mutex<TimerState>,
    status: watch::Sender<WatchdogStatus>,
}

impl Shared {
    fn fire(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return;
        }
        state.timer = None;
        let Some(flags) = state.flags.filter(WatchdogFlags::is_waiting) else {
            return;
        };
        let reason = StuckReason::from_flags(flags);
        error!(
            reason = reason.as_str(),
            timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            "boot stuck"
        );
        self.status.send_replace(WatchdogStatus {
            is_stuck: true,
            reason: Some(reason),
            stuck_reason: Some(reason.message(self.timeout)),
        });
    }

    fn clear_stuck(&self) {
        self.status.send_if_modified(|status| {
            if *status == WatchdogStatus::default() {
                false
            } else {
                *status = WatchdogStatus::default();
                true
            }
        });
    }
}

/// Deadline monitor over the boot flags
///
/// At most one timer is live; every re-arm aborts the previous one first.
pub struct BootWatchdog {
    shared: Arc<Shared>,
}

impl BootWatchdog {
    /// Create watchdog with the given deadline
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                timeout,
                state: Mutex::new(TimerState::default()),
                status: watch::Sender::new(WatchdogStatus::default()),
            }),
        }
    }

    /// Re-evaluate against the current flags
    ///
    /// Identical flags are a no-op. When the waiting condition no longer
    /// holds the timer is disarmed and any stuck status cleared. Otherwise
    /// the deadline restarts, unless the boot is already stuck.
    ///
    /// Must be called from within a Tokio runtime to arm.
    pub fn observe(&self, flags: WatchdogFlags) {
        let mut state = self.shared.state.lock();
        if state.flags == Some(flags) {
            return;
        }
        state.flags = Some(flags);

        if !flags.is_waiting() {
            if state.disarm() {
                debug!("watchdog disarmed, progress made");
            }
            self.shared.clear_stuck();
            return;
        }
        if self.shared.status.borrow().is_stuck {
            return;
        }
        self.arm(&mut state);
    }

    /// Stop the timer without clearing a stuck status
    pub fn disarm(&self) {
        let mut state = self.shared.state.lock();
        state.flags = None;
        if state.disarm() {
            debug!("watchdog disarmed");
        }
    }

    /// Disarm and clear the stuck status; idempotent
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        state.flags = None;
        state.disarm();
        self.shared.clear_stuck();
        debug!("watchdog reset");
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> WatchdogStatus {
        self.shared.status.borrow().clone()
    }

    /// Subscribe to status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<WatchdogStatus> {
        self.shared.status.subscribe()
    }

    /// Whether a timer is live
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.shared.state.lock().timer.is_some()
    }

    /// When the live timer was armed
    #[must_use]
    pub fn armed_since(&self) -> Option<Instant> {
        self.shared.state.lock().timer.as_ref().map(|t| t.armed_since)
    }

    /// When the live timer fires
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.state.lock().timer.as_ref().map(|t| t.deadline)
    }

    /// Configured deadline
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    fn arm(&self, state: &mut TimerState) {
        state.disarm();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("watchdog not armed, no runtime");
            return;
        };

        let epoch = state.epoch;
        let armed_since = Instant::now();
        let deadline = armed_since + self.shared.timeout;
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(shared) = shared.upgrade() {
                shared.fire(epoch);
            }
        });
        debug!(epoch, "watchdog armed");
        state.timer = Some(ArmedTimer {
            handle,
            armed_since,
            deadline,
        });
    }
}

impl Drop for BootWatchdog {
    fn drop(&mut self) {
        self.shared.state.lock().disarm();
    }
}

impl std::fmt::Debug for BootWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootWatchdog")
            .field("timeout", &self.shared.timeout)
            .field("armed", &self.is_armed())
            .finish_non_exhaustive()
    }
}
