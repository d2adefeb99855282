//! Error types for the boot layer
//!
//! Provides error handling for:
//! - Connection construction (superseded vs. classified failures)
//! - User-initiated boot recovery
//! - Mutation readiness guards
//! - Configuration loading

use crate::classify::ClassifiedError;
use std::path::PathBuf;

/// Connection construction errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// A newer attempt (or identity) replaced this one; its result was disregarded
    #[error("connection attempt {attempt} was superseded")]
    Superseded {
        /// Attempt number that was disregarded
        attempt: u64,
    },

    /// Construction failed
    #[error(transparent)]
    Failed(#[from] ClassifiedError),
}

impl ConnectError {
    /// Classified failure, if this was one
    #[inline]
    #[must_use]
    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            Self::Failed(error) => Some(error),
            Self::Superseded { .. } => None,
        }
    }
}

/// Boot recovery errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootError {
    /// Another Retry is still running
    #[error("a retry is already in progress")]
    RetryInProgress,

    /// Identity provider has not settled yet
    #[error("identity provider is still initializing")]
    IdentityInitializing,
}

/// Mutation readiness guard errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    /// Anonymous callers cannot mutate
    #[error("login required: you must log in to perform this action")]
    LoginRequired,

    /// Connection construction still in flight
    #[error("the connection is still initializing, please wait a moment and try again")]
    ConnectionInitializing,

    /// No usable connection
    #[error("unable to connect to the backend, please try again")]
    ConnectionUnavailable,

    /// Backend rejected the operation
    #[error(transparent)]
    Backend(#[from] ClassifiedError),
}

impl GuardError {
    /// Short, safe, user-facing message
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Backend(error) => error.user_message.clone(),
            other => {
                let text = other.to_string();
                let mut chars = text.chars();
                chars
                    .next()
                    .map(|first| first.to_uppercase().chain(chars).collect())
                    .unwrap_or_default()
            }
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("io error reading {path}: {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or type error
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Value out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
