//! DKIM selector key retrieval (RFC 6376 §3.6.2).
//!
//! Only the published key is examined. Signature verification needs the
//! signed message and is out of reach of a DNS-only engine.

mod record;

pub use record::{DkimInvalid, DkimKeyRecord, KeyFlag, KeyType};
pub(crate) use record::parse_tag_list;

use crate::dns::{DnsError, DnsLookup, TxtRecord};
use crate::domain::DomainName;
use crate::error::ErrorClass;
use crate::trace::Trace;
use futures::future::join_all;
use serde::Serialize;
use std::time::Duration;

/// Selectors tried by [`DkimResolver::probe_selectors`] when none is configured.
pub const DEFAULT_PROBE_SELECTORS: [&str; 6] =
    ["default", "selector1", "selector2", "google", "dkim", "mail"];

/// Where the selector came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confirmation {
    /// Supplied by the caller, e.g. from a DKIM-Signature `s=` tag.
    Given,
    /// Guessed by probing; a hit says nothing about what the domain signs with.
    Unconfirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum DkimKeyStatus {
    Valid(DkimKeyRecord),
    /// `p=` is empty: the key was deliberately withdrawn.
    Revoked(DkimKeyRecord),
    NotFound,
    Invalid(DkimInvalid),
    TempError(DnsError),
}

impl DkimKeyStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, DkimKeyStatus::Valid(_))
    }

    /// `None` for a usable or revoked key.
    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            DkimKeyStatus::Valid(_) | DkimKeyStatus::Revoked(_) => None,
            DkimKeyStatus::NotFound => Some(ErrorClass::NotPublished),
            DkimKeyStatus::Invalid(_) => Some(ErrorClass::PolicyInvalid),
            DkimKeyStatus::TempError(_) => Some(ErrorClass::Transient),
        }
    }

    pub fn summary(&self) -> String {
        match self {
            DkimKeyStatus::Valid(r) => format!("valid {} key, {} bytes", r.key_type, r.key_len),
            DkimKeyStatus::Revoked(_) => "revoked (empty p=)".to_string(),
            DkimKeyStatus::NotFound => "not found".to_string(),
            DkimKeyStatus::Invalid(reason) => format!("invalid: {reason}"),
            DkimKeyStatus::TempError(err) => format!("DNS {err}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DkimKeyLookup {
    pub selector: String,
    pub domain: DomainName,
    pub confirmation: Confirmation,
    pub status: DkimKeyStatus,
    pub trace: Trace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Found,
    /// Nothing found, but some selectors could not be checked.
    Error,
    /// Nothing found; absence proves nothing without a selector.
    NotChecked,
}

#[derive(Debug, Clone, Serialize)]
pub struct DkimProbe {
    pub domain: DomainName,
    pub status: ProbeStatus,
    /// Selectors with a record, in candidate order. Always `Unconfirmed`.
    pub found: Vec<DkimKeyLookup>,
    pub errors: Vec<(String, DnsError)>,
}

impl DkimProbe {
    /// Every candidate reported as timed out.
    pub fn timed_out(domain: &DomainName, candidates: &[String]) -> Self {
        Self {
            domain: domain.clone(),
            status: ProbeStatus::Error,
            found: Vec::new(),
            errors: candidates.iter().map(|s| (s.clone(), DnsError::Timeout)).collect(),
        }
    }
}

pub struct DkimResolver<R> {
    resolver: R,
}

impl<R: DnsLookup> DkimResolver<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    pub async fn resolve_dkim_key(&self, selector: &str, domain: &DomainName) -> DkimKeyLookup {
        self.lookup(selector, domain, Confirmation::Given).await
    }

    /// Expiry reports the key as a transient failure.
    pub async fn resolve_dkim_key_within(
        &self,
        selector: &str,
        domain: &DomainName,
        deadline: Duration,
    ) -> DkimKeyLookup {
        match tokio::time::timeout(deadline, self.resolve_dkim_key(selector, domain)).await {
            Ok(lookup) => lookup,
            Err(_) => {
                let mut trace = Trace::new();
                trace.push("dkim", format!("{selector}._domainkey.{domain}"), "deadline expired");
                DkimKeyLookup {
                    selector: selector.to_string(),
                    domain: domain.clone(),
                    confirmation: Confirmation::Given,
                    status: DkimKeyStatus::TempError(DnsError::Timeout),
                    trace,
                }
            }
        }
    }

    async fn lookup(&self, selector: &str, domain: &DomainName, confirmation: Confirmation) -> DkimKeyLookup {
        let mut trace = Trace::new();
        let name = format!("{selector}._domainkey.{domain}");
        let status = match valid_selector(selector).then(|| domain.prepend(&format!("{selector}._domainkey"))) {
            Some(Ok(qname)) => classify(self.resolver.lookup_txt(&qname).await),
            _ => DkimKeyStatus::Invalid(DkimInvalid::InvalidSelector),
        };
        trace.push("dkim", name.as_str(), status.summary());
        log::debug!("DKIM {}: {}", name, status.summary());

        DkimKeyLookup {
            selector: selector.to_string(),
            domain: domain.clone(),
            confirmation,
            status,
            trace,
        }
    }

    /// Best-effort guess at which selectors a domain publishes. Every hit is
    /// labelled [`Confirmation::Unconfirmed`].
    pub async fn probe_selectors(&self, domain: &DomainName, candidates: &[String]) -> DkimProbe {
        let lookups = join_all(
            candidates
                .iter()
                .map(|selector| self.lookup(selector, domain, Confirmation::Unconfirmed)),
        )
        .await;

        let mut found = Vec::new();
        let mut errors = Vec::new();
        for lookup in lookups {
            match &lookup.status {
                DkimKeyStatus::NotFound => {}
                DkimKeyStatus::TempError(err) => errors.push((lookup.selector.clone(), err.clone())),
                _ => found.push(lookup),
            }
        }

        let status = if !found.is_empty() {
            ProbeStatus::Found
        } else if !errors.is_empty() {
            ProbeStatus::Error
        } else {
            ProbeStatus::NotChecked
        };
        DkimProbe {
            domain: domain.clone(),
            status,
            found,
            errors,
        }
    }
}

/// Selectors are dot-separated labels; no empty labels or stray characters.
fn valid_selector(selector: &str) -> bool {
    !selector.is_empty()
        && selector.split('.').all(|label| {
            !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

fn classify(answer: Result<Vec<TxtRecord>, DnsError>) -> DkimKeyStatus {
    let records = match answer {
        Ok(records) if records.is_empty() => return DkimKeyStatus::NotFound,
        Ok(records) => records,
        Err(err) if err.is_absent() => return DkimKeyStatus::NotFound,
        Err(err) => return DkimKeyStatus::TempError(err),
    };
    if records.len() > 1 {
        return DkimKeyStatus::Invalid(DkimInvalid::MultipleRecords);
    }
    if records[0].has_replaced_bytes() {
        return DkimKeyStatus::Invalid(DkimInvalid::NonUtf8);
    }

    match records[0].joined().parse::<DkimKeyRecord>() {
        Ok(key) if key.is_revoked() => DkimKeyStatus::Revoked(key),
        Ok(key) => DkimKeyStatus::Valid(key),
        Err(reason) => DkimKeyStatus::Invalid(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::mock::MockResolver;

    fn domain() -> DomainName {
        DomainName::parse("example.com").unwrap()
    }

    #[tokio::test]
    async fn test_valid_key() {
        let resolver = MockResolver::new().txt("sel._domainkey.example.com", "v=DKIM1; k=rsa; p=YWJj");
        let lookup = DkimResolver::new(resolver).resolve_dkim_key("sel", &domain()).await;
        assert!(lookup.status.is_valid());
        assert_eq!(lookup.confirmation, Confirmation::Given);
        assert_eq!(lookup.trace.len(), 1);
    }

    #[tokio::test]
    async fn test_revoked_is_distinct_from_not_found() {
        let resolver = MockResolver::new().txt("old._domainkey.example.com", "v=DKIM1; k=rsa; p=");
        let dkim = DkimResolver::new(resolver);
        let revoked = dkim.resolve_dkim_key("old", &domain()).await;
        let missing = dkim.resolve_dkim_key("none", &domain()).await;
        assert!(matches!(revoked.status, DkimKeyStatus::Revoked(_)));
        assert_eq!(missing.status, DkimKeyStatus::NotFound);
        assert_eq!(revoked.status.error_class(), None);
        assert_eq!(missing.status.error_class(), Some(ErrorClass::NotPublished));
    }

    #[tokio::test]
    async fn test_multiple_records_are_invalid() {
        let resolver = MockResolver::new()
            .txt("sel._domainkey.example.com", "v=DKIM1; p=YWJj")
            .txt("sel._domainkey.example.com", "v=DKIM1; p=ZGVm");
        let lookup = DkimResolver::new(resolver).resolve_dkim_key("sel", &domain()).await;
        assert_eq!(lookup.status, DkimKeyStatus::Invalid(DkimInvalid::MultipleRecords));
    }

    #[tokio::test]
    async fn test_split_txt_strings_are_rejoined() {
        let resolver = MockResolver::new().txt_chunks("big._domainkey.example.com", &["v=DKIM1; k=rsa; p=YW", "JjZGVm"]);
        let lookup = DkimResolver::new(resolver).resolve_dkim_key("big", &domain()).await;
        match lookup.status {
            DkimKeyStatus::Valid(key) => assert_eq!(key.key_len, 6),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_key() {
        let resolver = MockResolver::new().txt("sel._domainkey.example.com", "v=DKIM1; p=%%%");
        let lookup = DkimResolver::new(resolver).resolve_dkim_key("sel", &domain()).await;
        assert_eq!(lookup.status, DkimKeyStatus::Invalid(DkimInvalid::MalformedKey));
        assert_eq!(lookup.status.error_class(), Some(ErrorClass::PolicyInvalid));
    }

    #[tokio::test]
    async fn test_non_utf8_key_is_reported_as_such() {
        let resolver = MockResolver::new().txt("sel._domainkey.example.com", "v=DKIM1; p=YWJ\u{FFFD}j");
        let lookup = DkimResolver::new(resolver).resolve_dkim_key("sel", &domain()).await;
        assert_eq!(lookup.status, DkimKeyStatus::Invalid(DkimInvalid::NonUtf8));
        assert!(lookup.trace.steps()[0].outcome.contains("non-utf8"));
    }

    #[tokio::test]
    async fn test_transient_failure() {
        let resolver = MockResolver::new().fail("sel._domainkey.example.com", DnsError::ServFail);
        let lookup = DkimResolver::new(resolver).resolve_dkim_key("sel", &domain()).await;
        assert_eq!(lookup.status, DkimKeyStatus::TempError(DnsError::ServFail));
    }

    #[tokio::test]
    async fn test_bad_selector_is_not_queried() {
        let resolver = MockResolver::new();
        let dkim = DkimResolver::new(resolver);
        let lookup = dkim.resolve_dkim_key("bad selector", &domain()).await;
        assert_eq!(lookup.status, DkimKeyStatus::Invalid(DkimInvalid::InvalidSelector));
        assert_eq!(dkim.resolver.query_count(), 0);
    }

    #[tokio::test]
    async fn test_probe_marks_hits_unconfirmed() {
        let resolver = MockResolver::new()
            .txt("google._domainkey.example.com", "v=DKIM1; p=YWJj")
            .txt("selector1._domainkey.example.com", "v=DKIM1; p=")
            .fail("mail._domainkey.example.com", DnsError::Timeout);
        let candidates: Vec<String> = DEFAULT_PROBE_SELECTORS.iter().map(|s| s.to_string()).collect();
        let probe = DkimResolver::new(resolver).probe_selectors(&domain(), &candidates).await;

        assert_eq!(probe.status, ProbeStatus::Found);
        let selectors: Vec<&str> = probe.found.iter().map(|l| l.selector.as_str()).collect();
        assert_eq!(selectors, ["selector1", "google"]);
        assert!(probe.found.iter().all(|l| l.confirmation == Confirmation::Unconfirmed));
        assert_eq!(probe.errors, [("mail".to_string(), DnsError::Timeout)]);
    }

    #[tokio::test]
    async fn test_probe_without_hits_is_not_checked() {
        let candidates = vec!["default".to_string()];
        let probe = DkimResolver::new(MockResolver::new()).probe_selectors(&domain(), &candidates).await;
        assert_eq!(probe.status, ProbeStatus::NotChecked);
        assert!(probe.found.is_empty());
    }
}
