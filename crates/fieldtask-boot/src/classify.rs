//! Remote failure classification
//!
//! Reduces a raw [`Failure`] of unknown shape to a [`ClassifiedError`]:
//! a category that decides retry vs. fatal vs. silent recovery, a short
//! user-facing message, and a truncated diagnostic payload.
//!
//! Classification is pure and re-derived for every failure instance.
//! Callers are responsible for logging.

use fieldtask_model::Failure;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum length of a user-facing message, in characters
pub const USER_MESSAGE_MAX: usize = 150;
/// Maximum length of the raw diagnostic payload, in characters
pub const RAW_DETAIL_MAX: usize = 500;
/// Appended to text cut at a length cap
pub const TRUNCATION_MARKER: &str = "… [truncated]";
/// Shown when nothing more specific can be said safely
pub const GENERIC_MESSAGE: &str = "An unexpected error occurred while starting the application.";

/// Fields holding the message itself, in priority order
const MESSAGE_FIELDS: &[&str] = &[
    "message",
    "reject_message",
    "rejectMessage",
    "error_message",
    "errorMessage",
    "msg",
    "description",
    "detail",
];

/// Fields holding a nested failure
const CAUSE_FIELDS: &[&str] = &["cause", "error", "source", "reason", "inner", "data"];

/// Fields holding status / reject codes
const CODE_FIELDS: &[&str] = &[
    "code",
    "reject_code",
    "rejectCode",
    "error_code",
    "errorCode",
    "status",
];

/// Nesting bound for structured failures
const MAX_DEPTH: usize = 8;

/// Markers that identify a stopped backend canister next to "is stopped"
const STOPPED_MARKERS: &[&str] = &["ic0508", "canister"];

const OBJECT_DUMP: &str = "[object Object]";

static REGISTRATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\buser (?:is )?not registered\b").expect("registration pattern is valid")
});

/// Boot stage labels attached to classified errors
pub mod stage {
    /// Stage not yet attached
    pub const UNSPECIFIED: &str = "unspecified";
    /// Backend connection construction
    pub const ACTOR_INIT: &str = "actor-init";
    /// Caller profile fetch
    pub const PROFILE_FETCH: &str = "profile-fetch";
    /// Profile save from the setup form
    pub const PROFILE_SAVE: &str = "profile-save";
    /// Failure caught before the UI started rendering
    pub const PRE_RENDER: &str = "pre-render";
    /// Failure caught after rendering started
    pub const RENDER: &str = "render";
}

/// Actionable failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    /// Caller has no profile yet; a normal new-user signal
    RegistrationRequired,
    /// Backend is stopped; fatal until an operator restarts it
    StoppedBackend,
    /// Session lacks permission; suggest logout
    Authorization,
    /// Network hiccup; retryable a bounded number of times
    NetworkTransient,
    /// Anything else
    Unclassified,
}

impl ErrorCategory {
    /// Stable label
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RegistrationRequired => "registration-required",
            Self::StoppedBackend => "stopped-backend",
            Self::Authorization => "authorization",
            Self::NetworkTransient => "network-transient",
            Self::Unclassified => "unclassified",
        }
    }

    /// Whether the automatic retry path may handle this category
    #[inline]
    #[must_use]
    pub fn is_auto_retryable(self) -> bool {
        matches!(self, Self::NetworkTransient)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw failure reduced to a category and a safe display message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{category} failure during {stage}: {user_message}")]
pub struct ClassifiedError {
    /// Failure category
    pub category: ErrorCategory,
    /// Where in boot the failure occurred
    pub stage: String,
    /// Short, safe, user-facing message
    pub user_message: String,
    /// Truncated diagnostic payload
    pub raw_detail: String,
}

impl ClassifiedError {
    /// Attach the boot stage
    #[inline]
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = stage.into();
        self
    }

    /// Whether this is the new-user signal rather than a failure
    #[inline]
    #[must_use]
    pub fn is_registration_required(&self) -> bool {
        self.category == ErrorCategory::RegistrationRequired
    }

    /// Whether the automatic retry path may handle this failure
    #[inline]
    #[must_use]
    pub fn is_auto_retryable(&self) -> bool {
        self.category.is_auto_retryable()
    }
}

/// Classify a raw failure
#[must_use]
pub fn classify(raw: &Failure) -> ClassifiedError {
    if raw.is_absent() {
        return ClassifiedError {
            category: ErrorCategory::Unclassified,
            stage: stage::UNSPECIFIED.to_string(),
            user_message: GENERIC_MESSAGE.to_string(),
            raw_detail: "<absent>".to_string(),
        };
    }

    let extraction = Extraction::of(raw);
    let haystack = extraction.haystack();
    let category = categorize(&haystack);

    let user_message = match category {
        ErrorCategory::RegistrationRequired => {
            "Please complete your profile setup to continue.".to_string()
        }
        ErrorCategory::StoppedBackend => {
            "The backend service is currently stopped. Please try again later.".to_string()
        }
        ErrorCategory::Authorization => {
            "Authentication failed. Your session may have expired.".to_string()
        }
        ErrorCategory::NetworkTransient if haystack.contains("timeout") || haystack.contains("timed out") => {
            "Connection timed out. The service may be temporarily unavailable.".to_string()
        }
        ErrorCategory::NetworkTransient => {
            "Network connection error. Please check your internet connection.".to_string()
        }
        ErrorCategory::Unclassified => extraction
            .primary
            .as_deref()
            .and_then(sanitize_message)
            .unwrap_or_else(|| GENERIC_MESSAGE.to_string()),
    };

    ClassifiedError {
        category,
        stage: stage::UNSPECIFIED.to_string(),
        user_message,
        raw_detail: truncate(&raw_detail(raw), RAW_DETAIL_MAX),
    }
}

/// Classify a raw failure and attach the stage it occurred in
#[inline]
#[must_use]
pub fn classify_at(raw: &Failure, stage: &str) -> ClassifiedError {
    classify(raw).with_stage(stage)
}

/// Accept a message for display only if it is short and carries no dumps
#[must_use]
pub fn sanitize_message(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty()
        || collapsed.contains(OBJECT_DUMP)
        || collapsed.to_lowercase().contains("stack")
        || collapsed.starts_with('{')
        || collapsed.starts_with('[')
        || collapsed.chars().count() > USER_MESSAGE_MAX
    {
        return None;
    }
    Some(collapsed)
}

/// Cut `text` to at most `cap` characters, marking the cut
#[must_use]
pub fn truncate(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    let keep = cap.saturating_sub(marker_len);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

fn categorize(haystack: &str) -> ErrorCategory {
    if REGISTRATION_RE.is_match(haystack) {
        ErrorCategory::RegistrationRequired
    } else if haystack.contains("is stopped") && STOPPED_MARKERS.iter().any(|m| haystack.contains(m)) {
        ErrorCategory::StoppedBackend
    } else if haystack.contains("unauthorized") || haystack.contains("permission") {
        ErrorCategory::Authorization
    } else if ["network", "fetch", "timeout", "timed out"]
        .iter()
        .any(|needle| haystack.contains(needle))
    {
        ErrorCategory::NetworkTransient
    } else {
        ErrorCategory::Unclassified
    }
}

fn raw_detail(raw: &Failure) -> String {
    match raw {
        Failure::Absent => "<absent>".to_string(),
        Failure::Text(text) => text.clone(),
        Failure::Structured(value) => serde_json::to_string(value).unwrap_or_else(|_| value.to_string()),
        Failure::Native(error) => {
            let mut detail = error.to_string();
            let mut source = error.source();
            while let Some(cause) = source {
                detail.push_str(": ");
                detail.push_str(&cause.to_string());
                source = cause.source();
            }
            detail
        }
    }
}

/// Text recovered from a failure
#[derive(Debug, Default)]
struct Extraction {
    /// Most specific message, in field priority order
    primary: Option<String>,
    /// Every message fragment found, depth first
    fragments: Vec<String>,
    /// Status / reject codes found
    codes: Vec<String>,
}

impl Extraction {
    fn of(raw: &Failure) -> Self {
        let mut out = Self::default();
        match raw {
            Failure::Absent => {}
            Failure::Text(text) => out.visit_text(text, 0),
            Failure::Structured(value) => out.visit_value(value, 0),
            Failure::Native(error) => {
                out.visit_text(&error.to_string(), 0);
                let mut source = error.source();
                let mut depth = 1;
                while let Some(cause) = source {
                    if depth > MAX_DEPTH {
                        break;
                    }
                    out.visit_text(&cause.to_string(), depth);
                    source = cause.source();
                    depth += 1;
                }
            }
        }

        if out.fragments.is_empty() {
            if let Failure::Structured(value) = raw {
                // Nothing recognisable; fall back to a bounded dump for matching only
                let dump = truncate(&value.to_string(), RAW_DETAIL_MAX);
                out.fragments.push(dump);
            }
        }
        out
    }

    fn haystack(&self) -> String {
        let mut parts = self.fragments.clone();
        parts.extend(self.codes.iter().cloned());
        parts.join(" | ").to_lowercase()
    }

    fn visit_text(&mut self, text: &str, depth: usize) {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == OBJECT_DUMP {
            return;
        }
        if depth < MAX_DEPTH && (trimmed.starts_with('{') || trimmed.starts_with('[')) {
            if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
                if parsed.is_object() || parsed.is_array() {
                    self.visit_value(&parsed, depth + 1);
                    return;
                }
            }
        }
        if self.primary.is_none() {
            self.primary = Some(trimmed.to_string());
        }
        self.fragments.push(trimmed.to_string());
    }

    fn visit_value(&mut self, value: &Value, depth: usize) {
        if depth > MAX_DEPTH {
            return;
        }
        match value {
            Value::String(text) => self.visit_text(text, depth),
            Value::Object(map) => {
                for field in MESSAGE_FIELDS {
                    if let Some(inner) = map.get(*field) {
                        self.visit_value(inner, depth + 1);
                    }
                }
                for field in CODE_FIELDS {
                    match map.get(*field) {
                        Some(Value::String(code)) => self.codes.push(code.clone()),
                        Some(Value::Number(code)) => self.codes.push(code.to_string()),
                        _ => {}
                    }
                }
                for field in CAUSE_FIELDS {
                    if let Some(inner) = map.get(*field) {
                        self.visit_value(inner, depth + 1);
                    }
                }
            }
            Value::Array(items) => {
                for item in items.iter().take(MAX_DEPTH) {
                    self.visit_value(item, depth + 1);
                }
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
    }
}
