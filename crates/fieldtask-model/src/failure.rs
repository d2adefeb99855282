//! Raw remote failures
//!
//! Remote calls reject with values of unknown shape: a plain string, a
//! native error with a cause chain, or a nested structure carrying reject
//! messages and codes. [`Failure`] keeps that value intact so that the
//! classifier can inspect it; nothing here interprets it.

use serde_json::Value;
use std::sync::Arc;

/// Untyped failure value produced by a remote call or a failing startup step
#[derive(Debug, Clone)]
pub enum Failure {
    /// No value at all (null / undefined rejection)
    Absent,
    /// Bare string rejection
    Text(String),
    /// Structured rejection (reject message, reject code, nested cause, ...)
    Structured(Value),
    /// Native error with an optional `source()` chain
    Native(Arc<dyn std::error::Error + Send + Sync>),
}

impl Failure {
    /// Wrap a native error
    #[inline]
    pub fn native(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Native(Arc::new(error))
    }

    /// Structured remote rejection with a reject message and code
    #[must_use]
    pub fn reject(reject_code: u32, reject_message: impl Into<String>) -> Self {
        Self::Structured(serde_json::json!({
            "reject_code": reject_code,
            "reject_message": reject_message.into(),
        }))
    }

    /// Whether this failure carries no value
    #[inline]
    #[must_use]
    pub fn is_absent(&self) -> bool {
        match self {
            Self::Absent => true,
            Self::Structured(Value::Null) => true,
            _ => false,
        }
    }
}

impl From<String> for Failure {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Failure {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Value> for Failure {
    fn from(value: Value) -> Self {
        Self::Structured(value)
    }
}

impl From<std::io::Error> for Failure {
    fn from(error: std::io::Error) -> Self {
        Self::native(error)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => f.write_str("<absent>"),
            Self::Text(text) => f.write_str(text),
            Self::Structured(value) => write!(f, "{value}"),
            Self::Native(error) => write!(f, "{error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_detection() {
        assert!(Failure::Absent.is_absent());
        assert!(Failure::Structured(Value::Null).is_absent());
        assert!(!Failure::from("boom").is_absent());
    }

    #[test]
    fn reject_shape() {
        let Failure::Structured(value) = Failure::reject(5, "Canister is stopped") else {
            panic!("expected structured failure");
        };
        assert_eq!(value["reject_code"], 5);
        assert_eq!(value["reject_message"], "Canister is stopped");
    }

    #[test]
    fn native_display() {
        let failure = Failure::native(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "request timed out",
        ));
        assert_eq!(failure.to_string(), "request timed out");
    }
}
