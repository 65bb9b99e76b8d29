use super::record::{AlignmentMode, DmarcRecord, Policy, is_dmarc_record};
use super::DmarcError;
use crate::dns::DnsLookup;
use crate::domain::DomainName;
use crate::org_domain::OrgDomainResolver;
use crate::spf::SpfResult;
use crate::trace::Trace;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum DmarcOutcome {
    Found {
        record: DmarcRecord,
        /// Domain whose `_dmarc` name published the record.
        source: DomainName,
        via_org_fallback: bool,
    },
    NoneFound,
    Error(DmarcError),
}

#[derive(Debug, Clone, Serialize)]
pub struct DmarcDiscovery {
    pub domain: DomainName,
    pub outcome: DmarcOutcome,
    pub trace: Trace,
}

impl DmarcDiscovery {
    pub fn record(&self) -> Option<&DmarcRecord> {
        match &self.outcome {
            DmarcOutcome::Found { record, .. } => Some(record),
            _ => None,
        }
    }

    /// `sp=` governs only mail from a strict subdomain of the domain
    /// that published the record, found through the fallback.
    pub fn applies_to_subdomain(&self) -> bool {
        match &self.outcome {
            DmarcOutcome::Found {
                source,
                via_org_fallback,
                ..
            } => *via_org_fallback && self.domain.is_subdomain_of(source),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlignmentResult {
    pub spf_aligned: bool,
    pub dkim_aligned: bool,
}

impl AlignmentResult {
    pub fn is_aligned(&self) -> bool {
        self.spf_aligned || self.dkim_aligned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Pass,
    Quarantine,
    Reject,
    None,
}

impl From<Policy> for Disposition {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::None => Disposition::None,
            Policy::Quarantine => Disposition::Quarantine,
            Policy::Reject => Disposition::Reject,
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Disposition::Pass => "pass",
            Disposition::Quarantine => "quarantine",
            Disposition::Reject => "reject",
            Disposition::None => "none",
        })
    }
}

/// Nominal and pct-scoped outcome, kept apart because sampling is the
/// receiver's choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispositionReport {
    pub disposition: Disposition,
    /// Policy that was selected (`p=` or `sp=`).
    pub policy: Policy,
    pub pct: u8,
    /// `None` when `pct` is partial and no sample was supplied.
    pub effective: Option<Disposition>,
}

/// `sample` is a caller-drawn value in `0..100`; the policy applies when
/// `sample < pct`.
pub fn compute_disposition(
    record: &DmarcRecord,
    alignment: AlignmentResult,
    applies_to_subdomain: bool,
    sample: Option<u8>,
) -> DispositionReport {
    let policy = if applies_to_subdomain {
        record.effective_subdomain_policy()
    } else {
        record.policy
    };

    if alignment.is_aligned() {
        return DispositionReport {
            disposition: Disposition::Pass,
            policy,
            pct: record.pct,
            effective: Some(Disposition::Pass),
        };
    }

    let nominal = Disposition::from(policy);
    let effective = match (record.pct, sample) {
        (100, _) => Some(nominal),
        (0, _) => Some(Disposition::None),
        (pct, Some(sample)) if sample < pct => Some(nominal),
        (_, Some(_)) => Some(Disposition::None),
        (_, None) => None,
    };
    DispositionReport {
        disposition: nominal,
        policy,
        pct: record.pct,
        effective,
    }
}

pub struct DmarcVerifier<R, O> {
    resolver: R,
    org: O,
}

impl<R: DnsLookup, O: OrgDomainResolver> DmarcVerifier<R, O> {
    pub fn new(resolver: R, org: O) -> Self {
        Self { resolver, org }
    }

    pub async fn resolve_dmarc(&self, domain: &DomainName) -> DmarcDiscovery {
        let mut trace = Trace::new();
        let outcome = match self.discover(domain, &mut trace).await {
            Ok(Some((record, source))) => {
                let via_org_fallback = &source != domain;
                DmarcOutcome::Found {
                    record,
                    source,
                    via_org_fallback,
                }
            }
            Ok(None) => DmarcOutcome::NoneFound,
            Err(err) => DmarcOutcome::Error(err),
        };
        match &outcome {
            DmarcOutcome::Found { record, source, .. } => {
                log::info!("DMARC {}: p={} (from {})", domain, record.policy, source)
            }
            DmarcOutcome::NoneFound => log::info!("DMARC {}: none", domain),
            DmarcOutcome::Error(err) => log::info!("DMARC {}: {}", domain, err),
        }

        DmarcDiscovery {
            domain: domain.clone(),
            outcome,
            trace,
        }
    }

    pub async fn resolve_dmarc_within(&self, domain: &DomainName, deadline: Duration) -> DmarcDiscovery {
        match tokio::time::timeout(deadline, self.resolve_dmarc(domain)).await {
            Ok(discovery) => discovery,
            Err(_) => {
                let mut trace = Trace::new();
                trace.push("deadline", domain.as_str(), format!("expired after {deadline:?}"));
                DmarcDiscovery {
                    domain: domain.clone(),
                    outcome: DmarcOutcome::Error(DmarcError::Timeout),
                    trace,
                }
            }
        }
    }

    async fn discover(
        &self,
        domain: &DomainName,
        trace: &mut Trace,
    ) -> Result<Option<(DmarcRecord, DomainName)>, DmarcError> {
        if let Some(record) = self.query(domain, trace).await? {
            return Ok(Some((record, domain.clone())));
        }

        let org = self.org.organizational_domain(domain);
        if &org == domain {
            return Ok(None);
        }
        trace.push("fallback", domain.as_str(), format!("organizational domain {org}"));
        Ok(self.query(&org, trace).await?.map(|record| (record, org)))
    }

    async fn query(&self, domain: &DomainName, trace: &mut Trace) -> Result<Option<DmarcRecord>, DmarcError> {
        let Ok(name) = domain.prepend("_dmarc") else {
            trace.push("query", format!("_dmarc.{domain}"), "name too long");
            return Ok(None);
        };

        let answer = match self.resolver.lookup_txt(&name).await {
            Ok(answer) => answer,
            Err(err) if err.is_absent() => {
                trace.push("query", name.as_str(), err.to_string());
                return Ok(None);
            }
            Err(err) => {
                log::warn!("DMARC lookup for {} failed: {}", name, err);
                trace.push("query", name.as_str(), err.to_string());
                return Err(DmarcError::Dns(err));
            }
        };

        let mut candidates: Vec<String> = answer
            .iter()
            .map(|txt| txt.joined())
            .filter(|txt| is_dmarc_record(txt))
            .collect();
        match candidates.len() {
            0 => {
                trace.push("query", name.as_str(), "no v=DMARC1 record");
                Ok(None)
            }
            1 => {
                let text = candidates.remove(0);
                trace.push("query", name.as_str(), text.as_str());
                let (record, warnings) = DmarcRecord::parse(&text).inspect_err(|err| {
                    trace.push("parse", text.as_str(), err.to_string());
                })?;
                for warning in warnings {
                    trace.push("parse", name.as_str(), warning);
                }
                Ok(Some(record))
            }
            count => {
                trace.push("query", name.as_str(), format!("{count} records"));
                Err(DmarcError::MultipleRecords { name, count })
            }
        }
    }

    /// Relaxed mode compares organizational domains, strict mode requires
    /// equality. SPF counts only when it passed.
    pub fn evaluate_alignment(
        &self,
        record: &DmarcRecord,
        from_domain: &DomainName,
        spf_domain: &DomainName,
        spf_result: SpfResult,
        dkim_domains: &[DomainName],
    ) -> AlignmentResult {
        let spf_aligned =
            spf_result == SpfResult::Pass && self.aligned(record.aspf, spf_domain, from_domain);
        let dkim_aligned = dkim_domains
            .iter()
            .any(|d| self.aligned(record.adkim, d, from_domain));
        AlignmentResult {
            spf_aligned,
            dkim_aligned,
        }
    }

    fn aligned(&self, mode: AlignmentMode, identifier: &DomainName, from_domain: &DomainName) -> bool {
        match mode {
            AlignmentMode::Strict => identifier == from_domain,
            AlignmentMode::Relaxed => {
                self.org.organizational_domain(identifier) == self.org.organizational_domain(from_domain)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::DnsError;
    use crate::dns::mock::MockResolver;
    use crate::org_domain::PslOrgDomain;

    fn name(s: &str) -> DomainName {
        DomainName::parse(s).unwrap()
    }

    fn verifier(resolver: MockResolver) -> DmarcVerifier<MockResolver, PslOrgDomain> {
        DmarcVerifier::new(resolver, PslOrgDomain)
    }

    #[tokio::test]
    async fn test_found_at_domain() {
        let resolver = MockResolver::new()
            .txt("_dmarc.example.com", "v=DMARC1; p=reject")
            .txt("_dmarc.example.com", "google-site-verification=abc");
        let discovery = verifier(resolver).resolve_dmarc(&name("example.com")).await;
        match &discovery.outcome {
            DmarcOutcome::Found {
                record,
                source,
                via_org_fallback,
            } => {
                assert_eq!(record.policy, Policy::Reject);
                assert_eq!(source, &name("example.com"));
                assert!(!*via_org_fallback);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!discovery.applies_to_subdomain());
    }

    #[tokio::test]
    async fn test_two_records_are_an_error() {
        let resolver = MockResolver::new()
            .txt("_dmarc.example.com", "v=DMARC1; p=reject")
            .txt("_dmarc.example.com", "v=DMARC1; p=reject");
        let discovery = verifier(resolver).resolve_dmarc(&name("example.com")).await;
        assert!(matches!(
            discovery.outcome,
            DmarcOutcome::Error(DmarcError::MultipleRecords { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_org_fallback() {
        let resolver = MockResolver::new().txt("_dmarc.example.com", "v=DMARC1; p=reject; sp=quarantine");
        let v = verifier(resolver);
        let discovery = v.resolve_dmarc(&name("mail.example.com")).await;
        match &discovery.outcome {
            DmarcOutcome::Found {
                source,
                via_org_fallback,
                ..
            } => {
                assert_eq!(source, &name("example.com"));
                assert!(*via_org_fallback);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(discovery.applies_to_subdomain());
        assert_eq!(
            v.resolver.queries.lock().unwrap().as_slice(),
            ["TXT _dmarc.mail.example.com", "TXT _dmarc.example.com"]
        );
    }

    #[tokio::test]
    async fn test_no_fallback_from_org_domain() {
        let resolver = MockResolver::new();
        let v = verifier(resolver);
        let discovery = v.resolve_dmarc(&name("example.com")).await;
        assert!(matches!(discovery.outcome, DmarcOutcome::NoneFound));
        assert_eq!(v.resolver.query_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_stops_discovery() {
        let resolver = MockResolver::new().fail("_dmarc.mail.example.com", DnsError::ServFail);
        let v = verifier(resolver);
        let discovery = v.resolve_dmarc(&name("mail.example.com")).await;
        assert!(matches!(discovery.outcome, DmarcOutcome::Error(DmarcError::Dns(DnsError::ServFail))));
        assert_eq!(v.resolver.query_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_policy_is_discovery_error() {
        let resolver = MockResolver::new().txt("_dmarc.example.com", "v=DMARC1; rua=mailto:a@b.com");
        let discovery = verifier(resolver).resolve_dmarc(&name("example.com")).await;
        assert!(matches!(discovery.outcome, DmarcOutcome::Error(DmarcError::Malformed(_))));
        assert_eq!(discovery.trace.steps().last().unwrap().step, "parse");
    }

    #[tokio::test]
    async fn test_fallback_warnings_are_traced() {
        let resolver = MockResolver::new().txt("_dmarc.example.com", "v=DMARC1; p=none; adkim=x");
        let discovery = verifier(resolver).resolve_dmarc(&name("example.com")).await;
        assert!(discovery.record().is_some());
        assert!(
            discovery
                .trace
                .steps()
                .iter()
                .any(|s| s.outcome == "adkim=x ignored, using default")
        );
    }

    fn record(text: &str) -> DmarcRecord {
        text.parse().unwrap()
    }

    #[test]
    fn test_strict_spf_alignment_requires_exact_match() {
        let v = verifier(MockResolver::new());
        let from = name("example.com");
        let spf_domain = name("mail.example.com");

        let strict = record("v=DMARC1; p=reject; aspf=s");
        let relaxed = record("v=DMARC1; p=reject");
        assert!(!v.evaluate_alignment(&strict, &from, &spf_domain, SpfResult::Pass, &[]).spf_aligned);
        assert!(v.evaluate_alignment(&relaxed, &from, &spf_domain, SpfResult::Pass, &[]).spf_aligned);
        assert!(!v.evaluate_alignment(&relaxed, &from, &spf_domain, SpfResult::SoftFail, &[]).spf_aligned);
    }

    #[test]
    fn test_dkim_alignment_any_domain() {
        let v = verifier(MockResolver::new());
        let from = name("news.example.com");
        let rec = record("v=DMARC1; p=reject; adkim=s");
        let domains = [name("esp.net"), name("news.example.com")];
        let alignment = v.evaluate_alignment(&rec, &from, &name("esp.net"), SpfResult::Pass, &domains);
        assert!(!alignment.spf_aligned);
        assert!(alignment.dkim_aligned);
        assert!(alignment.is_aligned());
    }

    #[test]
    fn test_disposition() {
        let rec = record("v=DMARC1; p=reject; sp=quarantine");
        let failed = AlignmentResult::default();

        let report = compute_disposition(&rec, failed, false, None);
        assert_eq!(report.disposition, Disposition::Reject);
        assert_eq!(report.effective, Some(Disposition::Reject));

        let report = compute_disposition(&rec, failed, true, None);
        assert_eq!(report.policy, Policy::Quarantine);

        let aligned = AlignmentResult {
            spf_aligned: true,
            dkim_aligned: false,
        };
        assert_eq!(compute_disposition(&rec, aligned, false, None).disposition, Disposition::Pass);
    }

    #[test]
    fn test_partial_pct() {
        let rec = record("v=DMARC1; p=quarantine; pct=25");
        let failed = AlignmentResult::default();

        let report = compute_disposition(&rec, failed, false, None);
        assert_eq!(report.disposition, Disposition::Quarantine);
        assert_eq!(report.pct, 25);
        assert_eq!(report.effective, None);

        assert_eq!(compute_disposition(&rec, failed, false, Some(10)).effective, Some(Disposition::Quarantine));
        assert_eq!(compute_disposition(&rec, failed, false, Some(25)).effective, Some(Disposition::None));

        let off = record("v=DMARC1; p=reject; pct=0");
        assert_eq!(compute_disposition(&off, failed, false, None).effective, Some(Disposition::None));
    }
}
