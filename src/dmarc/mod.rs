//! DMARC policy discovery and identifier alignment (RFC 7489).

mod policy;
mod record;

pub use policy::{
    AlignmentResult, Disposition, DispositionReport, DmarcDiscovery, DmarcOutcome, DmarcVerifier,
    compute_disposition,
};
pub use record::{AlignmentMode, DmarcRecord, FailureOption, Policy, is_dmarc_record};

use crate::dns::DnsError;
use crate::domain::DomainName;
use crate::error::ErrorClass;
use serde::Serialize;
use thiserror::Error;

/// Policy discovery failures. Absence is not an error: see [`DmarcOutcome::NoneFound`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum DmarcError {
    #[error("{count} DMARC records published at {name}")]
    MultipleRecords { name: DomainName, count: usize },
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("DNS {0}")]
    Dns(DnsError),
    #[error("discovery deadline expired")]
    Timeout,
}

impl DmarcError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DmarcError::MultipleRecords { .. } | DmarcError::Malformed(_) => ErrorClass::PolicyInvalid,
            DmarcError::Dns(err) => err.class(),
            DmarcError::Timeout => ErrorClass::Transient,
        }
    }
}
