//! Sender Policy Framework evaluation (RFC 7208).

mod cidr;
mod eval;
pub mod macros;
mod record;

pub use eval::{SpfEvaluation, SpfEvaluationState, SpfRequest, SpfVerifier};
pub use record::{Directive, Mechanism, Qualifier, SpfRecord, is_spf_record};

use crate::dns::DnsError;
use crate::domain::DomainName;
use crate::error::ErrorClass;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub const MAX_DNS_LOOKUPS: u32 = 10;
pub const MAX_VOID_LOOKUPS: u32 = 2;
pub const MAX_DEPTH: u32 = 10;
/// Upper bound on MX hosts and PTR names examined by one mechanism.
pub const MAX_NAME_FANOUT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpfResult {
    None,
    Neutral,
    Pass,
    Fail,
    SoftFail,
    TempError,
    PermError,
}

impl From<Qualifier> for SpfResult {
    fn from(q: Qualifier) -> Self {
        match q {
            Qualifier::Pass => SpfResult::Pass,
            Qualifier::Fail => SpfResult::Fail,
            Qualifier::SoftFail => SpfResult::SoftFail,
            Qualifier::Neutral => SpfResult::Neutral,
        }
    }
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpfResult::None => "none",
            SpfResult::Neutral => "neutral",
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    DnsLookups,
    VoidLookups,
    Depth,
    NameFanout,
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::DnsLookups => write!(f, "DNS lookup limit ({MAX_DNS_LOOKUPS})"),
            Limit::VoidLookups => write!(f, "void lookup limit ({MAX_VOID_LOOKUPS})"),
            Limit::Depth => write!(f, "recursion depth limit ({MAX_DEPTH})"),
            Limit::NameFanout => write!(f, "MX/PTR name limit ({MAX_NAME_FANOUT})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum SpfError {
    #[error("DNS {error} for {name}")]
    Dns { name: String, error: DnsError },
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("{count} SPF records published at {domain}")]
    MultipleRecords { domain: DomainName, count: usize },
    #[error("{limit} exceeded at `{mechanism}`")]
    LimitExceeded { limit: Limit, mechanism: String },
    #[error("invalid target domain `{0}`")]
    InvalidDomain(String),
    #[error("redirect target {0} publishes no SPF record")]
    RedirectWithoutRecord(DomainName),
    #[error("evaluation deadline expired")]
    Deadline,
}

impl SpfError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SpfError::Dns { .. } | SpfError::Deadline => ErrorClass::Transient,
            SpfError::LimitExceeded { .. } => ErrorClass::LimitExceeded,
            SpfError::Syntax(_)
            | SpfError::MultipleRecords { .. }
            | SpfError::InvalidDomain(_)
            | SpfError::RedirectWithoutRecord(_) => ErrorClass::PolicyInvalid,
        }
    }

    /// `TempError` only for transient causes; everything else is permanent.
    pub fn result(&self) -> SpfResult {
        if self.class().is_retryable() {
            SpfResult::TempError
        } else {
            SpfResult::PermError
        }
    }
}
