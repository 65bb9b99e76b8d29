use super::cidr::{ip_in_network, ip4_in_network, ip6_in_network};
use super::macros::{self, MacroContext};
use super::record::{Directive, Mechanism, SpfRecord, is_spf_record};
use super::{Limit, MAX_DEPTH, MAX_DNS_LOOKUPS, MAX_NAME_FANOUT, MAX_VOID_LOOKUPS, SpfError, SpfResult};
use crate::dns::{DnsError, DnsLookup, MxRecord, TxtRecord};
use crate::domain::DomainName;
use crate::error::ErrorClass;
use crate::trace::Trace;
use futures::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

/// Inputs of one `check_host` evaluation.
#[derive(Debug, Clone)]
pub struct SpfRequest {
    /// MAIL FROM domain, or the HELO domain when checking the HELO identity.
    pub domain: DomainName,
    pub ip: IpAddr,
    pub helo: Option<DomainName>,
    /// Full MAIL FROM address; `postmaster@<domain>` when absent.
    pub sender: Option<String>,
}

impl SpfRequest {
    pub fn new(domain: DomainName, ip: IpAddr) -> Self {
        Self {
            domain,
            ip,
            helo: None,
            sender: None,
        }
    }

    pub fn with_helo(mut self, helo: Option<DomainName>) -> Self {
        self.helo = helo;
        self
    }

    pub fn with_sender(mut self, sender: Option<String>) -> Self {
        self.sender = sender;
        self
    }
}

/// Budget shared by the whole include/redirect tree of one evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpfEvaluationState {
    pub dns_lookups: u32,
    pub void_lookups: u32,
    pub depth: u32,
}

impl SpfEvaluationState {
    fn count_lookup(&mut self, at: &str) -> Result<(), SpfError> {
        self.dns_lookups += 1;
        if self.dns_lookups > MAX_DNS_LOOKUPS {
            return Err(SpfError::LimitExceeded {
                limit: Limit::DnsLookups,
                mechanism: at.to_string(),
            });
        }
        Ok(())
    }

    fn count_void(&mut self, at: &str) -> Result<(), SpfError> {
        self.void_lookups += 1;
        if self.void_lookups > MAX_VOID_LOOKUPS {
            return Err(SpfError::LimitExceeded {
                limit: Limit::VoidLookups,
                mechanism: at.to_string(),
            });
        }
        Ok(())
    }

    fn descend(&mut self, at: &str) -> Result<(), SpfError> {
        if self.depth >= MAX_DEPTH {
            return Err(SpfError::LimitExceeded {
                limit: Limit::Depth,
                mechanism: at.to_string(),
            });
        }
        self.depth += 1;
        Ok(())
    }

    fn ascend(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn remaining_lookups(&self) -> u32 {
        MAX_DNS_LOOKUPS.saturating_sub(self.dns_lookups)
    }
}

/// Outcome of one SPF evaluation, with everything needed to explain it.
#[derive(Debug, Clone, Serialize)]
pub struct SpfEvaluation {
    pub domain: DomainName,
    pub ip: IpAddr,
    pub result: SpfResult,
    /// Directive that decided the result and the domain whose record held it.
    pub matched: Option<(DomainName, Directive)>,
    pub error: Option<SpfError>,
    pub error_class: Option<ErrorClass>,
    pub state: SpfEvaluationState,
    pub trace: Trace,
}

struct EvalContext {
    ip: IpAddr,
    sender: String,
    helo: String,
}

struct Verdict {
    result: SpfResult,
    matched: Option<(DomainName, Directive)>,
}

impl Verdict {
    fn bare(result: SpfResult) -> Self {
        Self {
            result,
            matched: None,
        }
    }
}

/// First-level DNS question a mechanism asks.
enum Query {
    Txt(DomainName),
    A(DomainName),
    Aaaa(DomainName),
    Mx(DomainName),
    Ptr(IpAddr),
}

impl Query {
    fn addresses(name: DomainName, ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Query::A(name),
            IpAddr::V6(_) => Query::Aaaa(name),
        }
    }
}

enum Answer {
    Txt(Vec<TxtRecord>),
    Addrs(Vec<IpAddr>),
    Mx(Vec<MxRecord>),
    Names(Vec<DomainName>),
}

impl Answer {
    fn is_empty(&self) -> bool {
        match self {
            Answer::Txt(v) => v.is_empty(),
            Answer::Addrs(v) => v.is_empty(),
            Answer::Mx(v) => v.is_empty(),
            Answer::Names(v) => v.is_empty(),
        }
    }
}

type Prefetched = Option<Result<Answer, DnsError>>;

/// Bytes allowed in an expanded target name.
fn is_target_byte(b: u8) -> bool {
    b.is_ascii_graphic() && !matches!(b, b'/' | b'@' | b'!' | b'\\')
}

/// SPF verifier
pub struct SpfVerifier<R> {
    resolver: R,
}

impl<R: DnsLookup> SpfVerifier<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    pub async fn evaluate_spf(&self, request: &SpfRequest) -> SpfEvaluation {
        let mut state = SpfEvaluationState::default();
        self.evaluate_spf_with_state(request, &mut state).await
    }

    /// Evaluates against a caller-owned budget, which keeps its final counts.
    pub async fn evaluate_spf_with_state(
        &self,
        request: &SpfRequest,
        state: &mut SpfEvaluationState,
    ) -> SpfEvaluation {
        self.run_check(request, state, None).await
    }

    /// Like [`evaluate_spf`](Self::evaluate_spf); expiry cancels in-flight
    /// queries and yields `TempError` with the counts and trace gathered so far.
    pub async fn evaluate_spf_within(&self, request: &SpfRequest, deadline: Duration) -> SpfEvaluation {
        let mut state = SpfEvaluationState::default();
        self.run_check(request, &mut state, Some(deadline)).await
    }

    async fn run_check(
        &self,
        request: &SpfRequest,
        state: &mut SpfEvaluationState,
        deadline: Option<Duration>,
    ) -> SpfEvaluation {
        let ctx = EvalContext {
            ip: request.ip.to_canonical(),
            sender: request
                .sender
                .clone()
                .unwrap_or_else(|| format!("postmaster@{}", request.domain)),
            helo: request
                .helo
                .as_ref()
                .map_or_else(|| "unknown".to_string(), |h| h.to_string()),
        };
        // State and trace live out here, so a cancelled check leaves its progress behind.
        let mut trace = Trace::new();
        let check = self.check_host(&ctx, &request.domain, None, None, state, &mut trace);
        let outcome = match deadline {
            None => check.await,
            Some(limit) => {
                let timed = tokio::time::timeout(limit, check).await;
                timed.unwrap_or_else(|_| {
                    log::warn!("SPF evaluation for {} hit the {:?} deadline", request.domain, limit);
                    trace.push("deadline", request.domain.as_str(), format!("{:?} expired", limit));
                    Err(SpfError::Deadline)
                })
            }
        };

        let evaluation = match outcome {
            Ok(verdict) => SpfEvaluation {
                domain: request.domain.clone(),
                ip: request.ip,
                result: verdict.result,
                matched: verdict.matched,
                error: None,
                error_class: None,
                state: *state,
                trace,
            },
            Err(err) => {
                trace.push("result", request.domain.as_str(), format!("{}: {}", err.result(), err));
                SpfEvaluation {
                    domain: request.domain.clone(),
                    ip: request.ip,
                    result: err.result(),
                    matched: None,
                    error_class: Some(err.class()),
                    error: Some(err),
                    state: *state,
                    trace,
                }
            }
        };
        log::info!(
            "SPF {} for {} from {} ({} lookups)",
            evaluation.result,
            evaluation.domain,
            evaluation.ip,
            evaluation.state.dns_lookups
        );
        evaluation
    }

    /// Boxed recursive check_host. `origin` names the include/redirect that led here.
    fn check_host<'a>(
        &'a self,
        ctx: &'a EvalContext,
        domain: &'a DomainName,
        prefetched: Option<Result<Vec<TxtRecord>, DnsError>>,
        origin: Option<&'a str>,
        state: &'a mut SpfEvaluationState,
        trace: &'a mut Trace,
    ) -> Pin<Box<dyn Future<Output = Result<Verdict, SpfError>> + Send + 'a>> {
        Box::pin(async move {
            let answer = match prefetched {
                Some(answer) => answer,
                None => self.resolver.lookup_txt(domain).await,
            };
            let records = match answer {
                Ok(records) if !records.is_empty() => records,
                Ok(_) | Err(DnsError::NxDomain | DnsError::NoData) => {
                    trace.push("record", domain.as_str(), "no TXT records");
                    if let Some(at) = origin {
                        state.count_void(at)?;
                    }
                    return Ok(Verdict::bare(SpfResult::None));
                }
                Err(error) => {
                    trace.push("record", domain.as_str(), format!("DNS {error}"));
                    return Err(SpfError::Dns {
                        name: domain.to_string(),
                        error,
                    });
                }
            };

            let spf: Vec<String> = records
                .iter()
                .map(TxtRecord::joined)
                .filter(|txt| is_spf_record(txt))
                .collect();
            let text = match spf.as_slice() {
                [] => {
                    trace.push("record", domain.as_str(), "no v=spf1 record");
                    return Ok(Verdict::bare(SpfResult::None));
                }
                [text] => text,
                _ => {
                    trace.push("record", domain.as_str(), format!("{} v=spf1 records", spf.len()));
                    return Err(SpfError::MultipleRecords {
                        domain: domain.clone(),
                        count: spf.len(),
                    });
                }
            };
            trace.push("record", domain.as_str(), text.as_str());

            let record = SpfRecord::parse(text).inspect_err(|err| {
                trace.push("parse", domain.as_str(), err.to_string());
            })?;

            let mut answers = self
                .prefetch(ctx, domain, &record, state.remaining_lookups())
                .await;

            for (directive, prefetched) in record.directives.iter().zip(answers.iter_mut()) {
                let label = format!("{domain}: {directive}");
                let outcome = self
                    .match_directive(ctx, domain, directive, prefetched.take(), &label, state, trace)
                    .await;
                match outcome {
                    Ok(true) => {
                        trace.push("mechanism", label, format!("match => {}", SpfResult::from(directive.qualifier)));
                        return Ok(Verdict {
                            result: directive.qualifier.into(),
                            matched: Some((domain.clone(), directive.clone())),
                        });
                    }
                    Ok(false) => trace.push("mechanism", label, "no match"),
                    Err(err) => {
                        trace.push("mechanism", label, format!("error: {err}"));
                        return Err(err);
                    }
                }
            }

            if let Some(spec) = &record.redirect {
                let label = format!("{domain}: redirect={spec}");
                let target = self.target(ctx, domain, Some(spec.as_str()))?;
                state.count_lookup(&label).inspect_err(|err| {
                    trace.push("redirect", label.as_str(), format!("error: {err}"));
                })?;
                state.descend(&label)?;
                trace.push("redirect", label.as_str(), format!("evaluating {target}"));
                let verdict = self
                    .check_host(ctx, &target, None, Some(&label), state, trace)
                    .await;
                state.ascend();
                let verdict = verdict?;
                if verdict.result == SpfResult::None {
                    return Err(SpfError::RedirectWithoutRecord(target));
                }
                return Ok(verdict);
            }

            trace.push("default", domain.as_str(), "no mechanism matched => neutral");
            Ok(Verdict::bare(SpfResult::Neutral))
        })
    }

    /// Issues the first-level query of every DNS mechanism in the record
    /// concurrently. Answers are indexed by directive position and are only
    /// consumed, in order, by the sequential pass.
    async fn prefetch(
        &self,
        ctx: &EvalContext,
        domain: &DomainName,
        record: &SpfRecord,
        budget: u32,
    ) -> Vec<Prefetched> {
        let mut slots: Vec<Prefetched> = record.directives.iter().map(|_| None).collect();
        let jobs = record
            .directives
            .iter()
            .enumerate()
            .filter(|(_, d)| d.mechanism.needs_dns())
            .take(budget as usize)
            .filter_map(|(i, d)| Some((i, self.plan(ctx, domain, &d.mechanism)?)))
            .map(|(i, query)| async move { (i, self.run(&query).await) });

        for (i, answer) in join_all(jobs).await {
            slots[i] = Some(answer);
        }
        slots
    }

    fn plan(&self, ctx: &EvalContext, domain: &DomainName, mechanism: &Mechanism) -> Option<Query> {
        let query = match mechanism {
            Mechanism::Include { domain: spec } => Query::Txt(self.target(ctx, domain, Some(spec.as_str())).ok()?),
            Mechanism::A { domain: spec, .. } => {
                Query::addresses(self.target(ctx, domain, spec.as_deref()).ok()?, ctx.ip)
            }
            Mechanism::Mx { domain: spec, .. } => Query::Mx(self.target(ctx, domain, spec.as_deref()).ok()?),
            Mechanism::Exists { domain: spec } => Query::A(self.target(ctx, domain, Some(spec.as_str())).ok()?),
            Mechanism::Ptr { .. } => Query::Ptr(ctx.ip),
            _ => return None,
        };
        Some(query)
    }

    async fn run(&self, query: &Query) -> Result<Answer, DnsError> {
        let answer = match query {
            Query::Txt(name) => Answer::Txt(self.resolver.lookup_txt(name).await?),
            Query::A(name) => Answer::Addrs(
                self.resolver.lookup_a(name).await?.into_iter().map(IpAddr::V4).collect(),
            ),
            Query::Aaaa(name) => Answer::Addrs(
                self.resolver.lookup_aaaa(name).await?.into_iter().map(IpAddr::V6).collect(),
            ),
            Query::Mx(name) => Answer::Mx(self.resolver.lookup_mx(name).await?),
            Query::Ptr(ip) => Answer::Names(self.resolver.lookup_ptr(*ip).await?),
        };
        if answer.is_empty() {
            return Err(DnsError::NoData);
        }
        Ok(answer)
    }

    async fn fetch(&self, prefetched: Prefetched, query: Query) -> Result<Answer, DnsError> {
        match prefetched {
            Some(answer) => answer,
            None => self.run(&query).await,
        }
    }

    async fn addresses(&self, name: &DomainName, ip: IpAddr) -> Result<Vec<IpAddr>, DnsError> {
        match self.run(&Query::addresses(name.clone(), ip)).await? {
            Answer::Addrs(addrs) => Ok(addrs),
            _ => Ok(Vec::new()),
        }
    }

    /// Expands a domain-spec; `None` means the current domain.
    fn target(&self, ctx: &EvalContext, domain: &DomainName, spec: Option<&str>) -> Result<DomainName, SpfError> {
        let Some(spec) = spec else {
            return Ok(domain.clone());
        };
        let macro_ctx = MacroContext {
            sender: &ctx.sender,
            domain: domain.as_str(),
            ip: ctx.ip,
            helo: &ctx.helo,
        };
        let mut expanded = macros::expand(spec, &macro_ctx).map_err(|e| SpfError::Syntax(e.to_string()))?;
        // Over-long expansions lose labels from the left.
        while expanded.len() > 253 {
            match expanded.split_once('.') {
                Some((_, rest)) => expanded = rest.to_string(),
                None => break,
            }
        }
        match DomainName::parse(&expanded) {
            Ok(name) if name.as_str().bytes().all(is_target_byte) => Ok(name),
            _ => Err(SpfError::InvalidDomain(expanded)),
        }
    }

    /// Absent answers cost a void lookup and never match.
    fn void_or_error(
        &self,
        err: DnsError,
        name: impl ToString,
        label: &str,
        state: &mut SpfEvaluationState,
    ) -> Result<bool, SpfError> {
        if err.is_absent() {
            state.count_void(label)?;
            Ok(false)
        } else {
            Err(SpfError::Dns {
                name: name.to_string(),
                error: err,
            })
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn match_directive(
        &self,
        ctx: &EvalContext,
        domain: &DomainName,
        directive: &Directive,
        prefetched: Prefetched,
        label: &str,
        state: &mut SpfEvaluationState,
        trace: &mut Trace,
    ) -> Result<bool, SpfError> {
        if directive.mechanism.needs_dns() {
            state.count_lookup(label)?;
        }

        match &directive.mechanism {
            Mechanism::All => Ok(true),
            Mechanism::Ip4 { addr, prefix } => Ok(match ctx.ip {
                IpAddr::V4(ip) => ip4_in_network(ip, *addr, *prefix),
                IpAddr::V6(_) => false,
            }),
            Mechanism::Ip6 { addr, prefix } => Ok(match ctx.ip {
                IpAddr::V6(ip) => ip6_in_network(ip, *addr, *prefix),
                IpAddr::V4(_) => false,
            }),
            Mechanism::A {
                domain: spec,
                cidr4,
                cidr6,
            } => {
                let target = self.target(ctx, domain, spec.as_deref())?;
                match self.fetch(prefetched, Query::addresses(target.clone(), ctx.ip)).await {
                    Ok(Answer::Addrs(addrs)) => Ok(addrs
                        .iter()
                        .any(|a| ip_in_network(ctx.ip, *a, cidr4.unwrap_or(32), cidr6.unwrap_or(128)))),
                    Ok(_) => Ok(false),
                    Err(err) => self.void_or_error(err, &target, label, state),
                }
            }
            Mechanism::Mx {
                domain: spec,
                cidr4,
                cidr6,
            } => {
                let target = self.target(ctx, domain, spec.as_deref())?;
                let mut hosts = match self.fetch(prefetched, Query::Mx(target.clone())).await {
                    Ok(Answer::Mx(hosts)) => hosts,
                    Ok(_) => return Ok(false),
                    Err(err) => return self.void_or_error(err, &target, label, state),
                };
                if hosts.len() > MAX_NAME_FANOUT {
                    return Err(SpfError::LimitExceeded {
                        limit: Limit::NameFanout,
                        mechanism: label.to_string(),
                    });
                }
                hosts.sort_by_key(|mx| mx.preference);
                let lookups = join_all(hosts.iter().map(|mx| self.addresses(&mx.exchange, ctx.ip))).await;
                for (mx, addrs) in hosts.iter().zip(lookups) {
                    match addrs {
                        Ok(addrs) => {
                            if addrs
                                .iter()
                                .any(|a| ip_in_network(ctx.ip, *a, cidr4.unwrap_or(32), cidr6.unwrap_or(128)))
                            {
                                return Ok(true);
                            }
                        }
                        Err(err) if err.is_absent() => {}
                        Err(error) => {
                            return Err(SpfError::Dns {
                                name: mx.exchange.to_string(),
                                error,
                            });
                        }
                    }
                }
                Ok(false)
            }
            Mechanism::Ptr { domain: spec } => {
                let target = self.target(ctx, domain, spec.as_deref())?;
                let names = match self.fetch(prefetched, Query::Ptr(ctx.ip)).await {
                    Ok(Answer::Names(names)) => names,
                    Ok(_) => return Ok(false),
                    Err(err) => return self.void_or_error(err, ctx.ip, label, state),
                };
                let candidates: Vec<&DomainName> = names.iter().take(MAX_NAME_FANOUT).collect();
                let lookups = join_all(candidates.iter().map(|name| self.addresses(name, ctx.ip))).await;
                // Lookup failures here only drop the candidate name.
                Ok(candidates.iter().zip(lookups).any(|(name, addrs)| {
                    addrs.is_ok_and(|addrs| addrs.contains(&ctx.ip)) && name.is_within(&target)
                }))
            }
            Mechanism::Exists { domain: spec } => {
                let target = self.target(ctx, domain, Some(spec.as_str()))?;
                match self.fetch(prefetched, Query::A(target.clone())).await {
                    Ok(_) => Ok(true),
                    Err(err) => self.void_or_error(err, &target, label, state),
                }
            }
            Mechanism::Include { domain: spec } => {
                let target = self.target(ctx, domain, Some(spec.as_str()))?;
                let txt = match prefetched {
                    Some(Ok(Answer::Txt(records))) => Some(Ok(records)),
                    Some(Err(err)) => Some(Err(err)),
                    _ => None,
                };
                state.descend(label)?;
                trace.push("include", label, format!("evaluating {target}"));
                let inner = self.check_host(ctx, &target, txt, Some(label), state, trace).await;
                state.ascend();
                Ok(match inner?.result {
                    SpfResult::Pass => true,
                    SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral | SpfResult::None => false,
                    // Errors arrive as Err above.
                    SpfResult::TempError | SpfResult::PermError => false,
                })
            }
        }
    }
}
