use serde::Serialize;
use std::fmt;

/// How a terminal outcome should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// DNS timeout or server failure. The caller may retry with backoff.
    Transient,
    /// Malformed, ambiguous or duplicated records. A real misconfiguration.
    PolicyInvalid,
    /// Nothing is published at the queried name.
    NotPublished,
    /// DNS-lookup, void-lookup or depth budget exhausted.
    LimitExceeded,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::PolicyInvalid => write!(f, "policy-invalid"),
            ErrorClass::NotPublished => write!(f, "not-published"),
            ErrorClass::LimitExceeded => write!(f, "limit-exceeded"),
        }
    }
}
