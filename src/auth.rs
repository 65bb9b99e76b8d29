//! Composes the SPF, DKIM and DMARC engines into one verdict.

use crate::config::EngineConfig;
use crate::dkim::{DkimKeyLookup, DkimProbe, DkimResolver};
use crate::dmarc::{
    AlignmentResult, Disposition, DispositionReport, DmarcDiscovery, DmarcVerifier, compute_disposition,
};
use crate::dns::{DnsLookup, DnsResolver};
use crate::domain::DomainName;
use crate::org_domain::{OrgDomainResolver, PslOrgDomain};
use crate::spf::{SpfEvaluation, SpfRequest, SpfVerifier};
use futures::future::join_all;
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;

/// `s=` and `d=` of one DKIM-Signature seen on the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DkimSignatureRef {
    pub selector: String,
    pub domain: DomainName,
}

#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// Identity SPF checks: the MAIL FROM domain, or HELO for a null sender.
    pub spf_domain: DomainName,
    pub ip: IpAddr,
    pub helo: Option<DomainName>,
    pub sender: Option<String>,
    /// RFC5322.From domain, the identity DMARC protects.
    pub from_domain: DomainName,
    pub dkim_signatures: Vec<DkimSignatureRef>,
    /// Caller-drawn value in `0..100` used to apply a partial `pct=`.
    pub pct_sample: Option<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthenticationVerdict {
    pub spf: SpfEvaluation,
    pub dkim: Vec<DkimKeyLookup>,
    pub dmarc: DmarcDiscovery,
    pub alignment: AlignmentResult,
    /// Nominal DMARC disposition; `none` without a usable record.
    pub disposition: Disposition,
    pub disposition_report: Option<DispositionReport>,
    pub trace: Vec<String>,
}

pub struct Authenticator<R, O = PslOrgDomain> {
    spf: SpfVerifier<R>,
    dkim: DkimResolver<R>,
    dmarc: DmarcVerifier<R, O>,
    deadline: Duration,
    probe_selectors: Vec<String>,
}

impl Authenticator<DnsResolver, PslOrgDomain> {
    /// Live resolver and the compiled-in public suffix list.
    pub fn from_config(config: &EngineConfig) -> anyhow::Result<Self> {
        let resolver = DnsResolver::with_nameservers(&config.nameservers, config.query_timeout())?;
        Ok(Self::new(resolver, PslOrgDomain, config))
    }
}

impl<R: DnsLookup + Clone, O: OrgDomainResolver> Authenticator<R, O> {
    pub fn new(resolver: R, org: O, config: &EngineConfig) -> Self {
        Self {
            spf: SpfVerifier::new(resolver.clone()),
            dkim: DkimResolver::new(resolver.clone()),
            dmarc: DmarcVerifier::new(resolver, org),
            deadline: config.deadline(),
            probe_selectors: config.probe_selectors.clone(),
        }
    }

    pub async fn check_spf(&self, request: &SpfRequest) -> SpfEvaluation {
        self.spf.evaluate_spf_within(request, self.deadline).await
    }

    pub async fn check_dkim(&self, selector: &str, domain: &DomainName) -> DkimKeyLookup {
        self.dkim.resolve_dkim_key_within(selector, domain, self.deadline).await
    }

    /// Tries the configured selector list. Hits are unconfirmed guesses.
    pub async fn probe_dkim(&self, domain: &DomainName) -> DkimProbe {
        let probe = self.dkim.probe_selectors(domain, &self.probe_selectors);
        match tokio::time::timeout(self.deadline, probe).await {
            Ok(probe) => probe,
            Err(_) => DkimProbe::timed_out(domain, &self.probe_selectors),
        }
    }

    pub async fn check_dmarc(&self, domain: &DomainName) -> DmarcDiscovery {
        self.dmarc.resolve_dmarc_within(domain, self.deadline).await
    }

    /// Runs all three engines concurrently. A failure in one never prevents
    /// the others from reporting.
    pub async fn evaluate(&self, request: &AuthRequest) -> AuthenticationVerdict {
        let spf_request = SpfRequest::new(request.spf_domain.clone(), request.ip)
            .with_helo(request.helo.clone())
            .with_sender(request.sender.clone());

        let (spf, dkim, dmarc) = tokio::join!(
            self.check_spf(&spf_request),
            join_all(
                request
                    .dkim_signatures
                    .iter()
                    .map(|sig| self.check_dkim(&sig.selector, &sig.domain)),
            ),
            self.check_dmarc(&request.from_domain),
        );

        let dkim_domains: Vec<DomainName> = dkim
            .iter()
            .filter(|lookup| lookup.status.is_valid())
            .map(|lookup| lookup.domain.clone())
            .collect();

        let mut trace = spf.trace.lines("spf: ");
        for lookup in &dkim {
            trace.extend(lookup.trace.lines("dkim: "));
        }
        trace.extend(dmarc.trace.lines("dmarc: "));

        let (alignment, report) = match dmarc.record() {
            Some(record) => {
                let alignment = self.dmarc.evaluate_alignment(
                    record,
                    &request.from_domain,
                    &request.spf_domain,
                    spf.result,
                    &dkim_domains,
                );
                let report =
                    compute_disposition(record, alignment, dmarc.applies_to_subdomain(), request.pct_sample);
                trace.push(format!(
                    "alignment: spf={} dkim={} (aspf={:?}, adkim={:?})",
                    alignment.spf_aligned, alignment.dkim_aligned, record.aspf, record.adkim
                ));
                (alignment, Some(report))
            }
            None => {
                trace.push("alignment: not evaluated without a DMARC record".to_string());
                (AlignmentResult::default(), None)
            }
        };

        let disposition = report.map_or(Disposition::None, |r| r.disposition);
        trace.push(match report.and_then(|r| r.effective) {
            Some(effective) => format!("disposition: {disposition} (effective {effective})"),
            None if report.is_some() => format!("disposition: {disposition} (pct sampling left to receiver)"),
            None => format!("disposition: {disposition}"),
        });
        log::info!(
            "verdict for {}: spf={} dkim_valid={} disposition={}",
            request.from_domain,
            spf.result,
            dkim_domains.len(),
            disposition
        );

        AuthenticationVerdict {
            spf,
            dkim,
            dmarc,
            alignment,
            disposition,
            disposition_report: report,
            trace,
        }
    }
}
