//! Boot diagnostics context
//!
//! An explicitly passed, owned record of where boot currently is. Created at
//! startup, updated by the pre-render fallback and by boot phase changes,
//! and read whenever diagnostics are shown or copied.

use crate::classify::{ClassifiedError, ErrorCategory};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Stage before the fallback handlers are installed
pub const STAGE_PRE_RENDER_INIT: &str = "pre-render-init";
/// Stage once the UI host has started rendering
pub const STAGE_PRE_RENDER_READY: &str = "pre-render-ready";

/// Process-wide boot diagnostics marker
#[derive(Debug)]
pub struct BootContext {
    build_marker: String,
    started_at: DateTime<Utc>,
    stage: RwLock<String>,
}

impl BootContext {
    /// Create context for a build
    #[must_use]
    pub fn new(build_marker: impl Into<String>) -> Self {
        Self {
            build_marker: build_marker.into(),
            started_at: Utc::now(),
            stage: RwLock::new(STAGE_PRE_RENDER_INIT.to_string()),
        }
    }

    /// Build identifier
    #[inline]
    #[must_use]
    pub fn build_marker(&self) -> &str {
        &self.build_marker
    }

    /// When boot started
    #[inline]
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Current stage label
    #[must_use]
    pub fn stage(&self) -> String {
        self.stage.read().clone()
    }

    pub(crate) fn record_stage(&self, stage: &str) {
        let mut current = self.stage.write();
        if *current != stage {
            *current = stage.to_string();
        }
    }

    /// Snapshot for display or copying
    #[must_use]
    pub fn diagnostics(&self, error: Option<&ClassifiedError>) -> BootDiagnostics {
        BootDiagnostics {
            stage: self.stage(),
            build_marker: self.build_marker.clone(),
            started_at: self.started_at,
            timestamp: Utc::now(),
            category: error.map(|e| e.category),
            error_stage: error.map(|e| e.stage.clone()),
            user_message: error.map(|e| e.user_message.clone()),
            raw_detail: error.map(|e| e.raw_detail.clone()),
        }
    }
}

impl Default for BootContext {
    fn default() -> Self {
        Self::new(concat!("fieldtask-boot@", env!("CARGO_PKG_VERSION")))
    }
}

/// Diagnostics shown in the boot error panel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootDiagnostics {
    /// Boot stage at the time of the snapshot
    pub stage: String,
    /// Build identifier
    pub build_marker: String,
    /// When boot started
    pub started_at: DateTime<Utc>,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
    /// Failure category, if a failure is being shown
    pub category: Option<ErrorCategory>,
    /// Stage the failure was attributed to
    pub error_stage: Option<String>,
    /// User-facing message
    pub user_message: Option<String>,
    /// Truncated diagnostic payload
    pub raw_detail: Option<String>,
}

impl BootDiagnostics {
    /// Text placed on the clipboard by "copy diagnostics"
    #[must_use]
    pub fn clipboard_payload(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}
