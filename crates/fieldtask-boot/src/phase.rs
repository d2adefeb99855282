//! Boot phase derivation
//!
//! The phase is never stored as a source of truth; it is recomputed from
//! identity, connection, profile fetch and watchdog state.

use crate::classify::ClassifiedError;
use crate::watchdog::{StuckReason, WatchdogFlags, WatchdogStatus};
use fieldtask_model::UserProfile;

/// State of the caller profile fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProfileFetchState {
    /// Not started
    #[default]
    NotFetched,
    /// In flight
    Loading,
    /// Settled; `None` when the caller has no profile yet
    Fetched(Option<UserProfile>),
    /// Failed after automatic retries
    Failed(ClassifiedError),
}

impl ProfileFetchState {
    /// Whether the fetch has settled either way
    #[inline]
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Fetched(_) | Self::Failed(_))
    }
}

/// Top-level UI phase; exactly one is active
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootPhase {
    /// No session; show login
    Unauthenticated,
    /// Session present, connection not ready yet
    Connecting,
    /// Connection ready, profile fetch not settled
    ProfileLoading,
    /// Caller has no profile yet; show the setup form
    ProfileSetupRequired,
    /// Everything loaded
    ReadyDashboard,
    /// Hard failure; offers Retry and Logout
    BootError(ClassifiedError),
    /// Watchdog deadline passed; offers Retry and Logout
    Stuck {
        /// Reason picked at deadline time
        reason: StuckReason,
        /// Display text
        message: String,
    },
}

impl BootPhase {
    /// Stable label, also used as the boot stage
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Connecting => "connecting",
            Self::ProfileLoading => "profile-loading",
            Self::ProfileSetupRequired => "profile-setup-required",
            Self::ReadyDashboard => "dashboard-ready",
            Self::BootError(_) => "boot-error",
            Self::Stuck { .. } => "stuck",
        }
    }

    /// Whether Retry and Logout are offered
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::BootError(_) | Self::Stuck { .. })
    }

    /// Classified error shown in this phase
    #[must_use]
    pub fn error(&self) -> Option<&ClassifiedError> {
        match self {
            Self::BootError(error) => Some(error),
            _ => None,
        }
    }
}

impl std::fmt::Display for BootPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Everything the phase is derived from
#[derive(Debug, Clone, Copy)]
pub struct PhaseInputs<'a> {
    /// Identity provider still restoring a session
    pub identity_initializing: bool,
    /// Identity present and non-anonymous
    pub authenticated: bool,
    /// Connection bound to the current identity is ready
    pub connection_ready: bool,
    /// Connection construction failure for the current identity
    pub connection_error: Option<&'a ClassifiedError>,
    /// Profile fetch for the current identity
    pub profile: &'a ProfileFetchState,
    /// Watchdog status
    pub watchdog: &'a WatchdogStatus,
}

impl PhaseInputs<'_> {
    /// Flags fed to the watchdog
    #[must_use]
    pub fn watchdog_flags(&self) -> WatchdogFlags {
        WatchdogFlags {
            authenticated: self.authenticated,
            connection_initializing: self.authenticated
                && !self.connection_ready
                && self.connection_error.is_none(),
            profile_loading: matches!(self.profile, ProfileFetchState::Loading),
            profile_fetched: self.profile.is_settled(),
            connection_failed: self.connection_error.is_some(),
        }
    }
}

/// Derive the active phase
///
/// Precedence: unauthenticated, hard errors, stuck, connecting, profile
/// loading, then the settled profile outcome. A registration-required
/// profile failure means "no profile" and never a boot error.
#[must_use]
pub fn derive_phase(inputs: &PhaseInputs<'_>) -> BootPhase {
    if inputs.identity_initializing {
        return BootPhase::Connecting;
    }
    if !inputs.authenticated {
        return BootPhase::Unauthenticated;
    }
    if let Some(error) = inputs.connection_error {
        return BootPhase::BootError(error.clone());
    }
    if let ProfileFetchState::Failed(error) = inputs.profile {
        if !error.is_registration_required() {
            return BootPhase::BootError(error.clone());
        }
    }
    if let (true, Some(reason)) = (inputs.watchdog.is_stuck, inputs.watchdog.reason) {
        let message = inputs
            .watchdog
            .stuck_reason
            .clone()
            .unwrap_or_else(|| reason.as_str().to_string());
        return BootPhase::Stuck { reason, message };
    }
    if !inputs.connection_ready {
        return BootPhase::Connecting;
    }
    match inputs.profile {
        ProfileFetchState::NotFetched | ProfileFetchState::Loading => BootPhase::ProfileLoading,
        ProfileFetchState::Fetched(None) | ProfileFetchState::Failed(_) => {
            BootPhase::ProfileSetupRequired
        }
        ProfileFetchState::Fetched(Some(_)) => BootPhase::ReadyDashboard,
    }
}
