use crate::domain::DomainName;
use crate::error::ErrorClass;
use async_trait::async_trait;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use trust_dns_resolver::{
    TokioAsyncResolver,
    config::{NameServerConfigGroup, ResolverConfig, ResolverOpts},
    error::{ResolveError, ResolveErrorKind},
    proto::op::ResponseCode,
};

/// Failure modes of a single DNS query.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum DnsError {
    #[error("NXDOMAIN")]
    NxDomain,
    #[error("no data")]
    NoData,
    #[error("timeout")]
    Timeout,
    #[error("SERVFAIL")]
    ServFail,
}

impl DnsError {
    /// NXDOMAIN and NODATA both mean "nothing published here".
    pub fn is_absent(&self) -> bool {
        matches!(self, DnsError::NxDomain | DnsError::NoData)
    }

    pub fn class(&self) -> ErrorClass {
        if self.is_absent() {
            ErrorClass::NotPublished
        } else {
            ErrorClass::Transient
        }
    }
}

/// One TXT resource record, kept as its on-the-wire character-strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxtRecord(pub Vec<String>);

impl TxtRecord {
    /// Concatenates the character-strings in wire order, without separators.
    pub fn joined(&self) -> String {
        self.0.concat()
    }

    /// True when a character-string was not valid UTF-8 and had bytes replaced.
    pub fn has_replaced_bytes(&self) -> bool {
        self.0.iter().any(|chunk| chunk.contains(char::REPLACEMENT_CHARACTER))
    }
}

impl From<&str> for TxtRecord {
    fn from(s: &str) -> Self {
        TxtRecord(vec![s.to_string()])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MxRecord {
    pub preference: u16,
    pub exchange: DomainName,
}

/// DNS Lookup Port: the only suspension point of the engines.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn lookup_txt(&self, name: &DomainName) -> Result<Vec<TxtRecord>, DnsError>;
    async fn lookup_a(&self, name: &DomainName) -> Result<Vec<Ipv4Addr>, DnsError>;
    async fn lookup_aaaa(&self, name: &DomainName) -> Result<Vec<Ipv6Addr>, DnsError>;
    async fn lookup_mx(&self, name: &DomainName) -> Result<Vec<MxRecord>, DnsError>;
    async fn lookup_ptr(&self, ip: IpAddr) -> Result<Vec<DomainName>, DnsError>;
}

#[async_trait]
impl<T: DnsLookup + ?Sized> DnsLookup for Arc<T> {
    async fn lookup_txt(&self, name: &DomainName) -> Result<Vec<TxtRecord>, DnsError> {
        (**self).lookup_txt(name).await
    }

    async fn lookup_a(&self, name: &DomainName) -> Result<Vec<Ipv4Addr>, DnsError> {
        (**self).lookup_a(name).await
    }

    async fn lookup_aaaa(&self, name: &DomainName) -> Result<Vec<Ipv6Addr>, DnsError> {
        (**self).lookup_aaaa(name).await
    }

    async fn lookup_mx(&self, name: &DomainName) -> Result<Vec<MxRecord>, DnsError> {
        (**self).lookup_mx(name).await
    }

    async fn lookup_ptr(&self, ip: IpAddr) -> Result<Vec<DomainName>, DnsError> {
        (**self).lookup_ptr(ip).await
    }
}

/// DNS resolver wrapper
#[derive(Clone)]
pub struct DnsResolver {
    inner: Arc<TokioAsyncResolver>,
}

impl DnsResolver {
    /// Empty `nameservers` falls back to the library default upstreams.
    pub fn with_nameservers(nameservers: &[IpAddr], timeout: Duration) -> anyhow::Result<Self> {
        let config = if nameservers.is_empty() {
            ResolverConfig::default()
        } else {
            ResolverConfig::from_parts(
                None,
                vec![],
                NameServerConfigGroup::from_ips_clear(nameservers, 53, true),
            )
        };
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        // The port mandates no retry policy; a single attempt per query.
        opts.attempts = 1;

        let resolver = TokioAsyncResolver::tokio(config, opts);
        Ok(Self {
            inner: Arc::new(resolver),
        })
    }
}

fn fqdn(name: &DomainName) -> String {
    format!("{}.", name)
}

fn map_error(err: ResolveError) -> DnsError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => match *response_code {
            ResponseCode::NXDomain => DnsError::NxDomain,
            ResponseCode::NoError => DnsError::NoData,
            _ => DnsError::ServFail,
        },
        ResolveErrorKind::Timeout => DnsError::Timeout,
        _ => DnsError::ServFail,
    }
}

fn decode_chunk(name: &DomainName, chunk: &[u8]) -> String {
    match std::str::from_utf8(chunk) {
        Ok(text) => text.to_string(),
        Err(_) => {
            log::warn!("TXT {} carries non-UTF-8 data, invalid bytes replaced", name);
            String::from_utf8_lossy(chunk).into_owned()
        }
    }
}

fn name_from_dns(name: &trust_dns_resolver::Name) -> Option<DomainName> {
    DomainName::parse(&name.to_ascii()).ok()
}

#[async_trait]
impl DnsLookup for DnsResolver {
    async fn lookup_txt(&self, name: &DomainName) -> Result<Vec<TxtRecord>, DnsError> {
        log::debug!("TXT {}", name);
        let response = self.inner.txt_lookup(fqdn(name)).await.map_err(map_error)?;
        Ok(response
            .iter()
            .map(|txt| {
                TxtRecord(txt.txt_data().iter().map(|chunk| decode_chunk(name, chunk)).collect())
            })
            .collect())
    }

    async fn lookup_a(&self, name: &DomainName) -> Result<Vec<Ipv4Addr>, DnsError> {
        log::debug!("A {}", name);
        let response = self.inner.ipv4_lookup(fqdn(name)).await.map_err(map_error)?;
        Ok(response.iter().map(|a| a.0).collect())
    }

    async fn lookup_aaaa(&self, name: &DomainName) -> Result<Vec<Ipv6Addr>, DnsError> {
        log::debug!("AAAA {}", name);
        let response = self.inner.ipv6_lookup(fqdn(name)).await.map_err(map_error)?;
        Ok(response.iter().map(|aaaa| aaaa.0).collect())
    }

    async fn lookup_mx(&self, name: &DomainName) -> Result<Vec<MxRecord>, DnsError> {
        log::debug!("MX {}", name);
        let response = self.inner.mx_lookup(fqdn(name)).await.map_err(map_error)?;
        Ok(response
            .iter()
            .filter_map(|mx| {
                Some(MxRecord {
                    preference: mx.preference(),
                    exchange: name_from_dns(mx.exchange())?,
                })
            })
            .collect())
    }

    async fn lookup_ptr(&self, ip: IpAddr) -> Result<Vec<DomainName>, DnsError> {
        log::debug!("PTR {}", ip);
        let response = self.inner.reverse_lookup(ip).await.map_err(map_error)?;
        Ok(response.iter().filter_map(|ptr| name_from_dns(&ptr.0)).collect())
    }
}

/// In-memory zone used by the unit tests of every engine.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockResolver {
        txt: HashMap<String, Vec<TxtRecord>>,
        a: HashMap<String, Vec<Ipv4Addr>>,
        aaaa: HashMap<String, Vec<Ipv6Addr>>,
        mx: HashMap<String, Vec<MxRecord>>,
        ptr: HashMap<IpAddr, Vec<DomainName>>,
        failures: HashMap<String, DnsError>,
        stalled: HashSet<String>,
        pub queries: Mutex<Vec<String>>,
    }

    impl MockResolver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn txt(mut self, name: &str, value: &str) -> Self {
            self.txt.entry(name.to_string()).or_default().push(value.into());
            self
        }

        pub fn txt_chunks(mut self, name: &str, chunks: &[&str]) -> Self {
            self.txt
                .entry(name.to_string())
                .or_default()
                .push(TxtRecord(chunks.iter().map(|c| c.to_string()).collect()));
            self
        }

        pub fn a(mut self, name: &str, ip: &str) -> Self {
            self.a.entry(name.to_string()).or_default().push(ip.parse().unwrap());
            self
        }

        pub fn aaaa(mut self, name: &str, ip: &str) -> Self {
            self.aaaa.entry(name.to_string()).or_default().push(ip.parse().unwrap());
            self
        }

        pub fn mx(mut self, name: &str, preference: u16, exchange: &str) -> Self {
            self.mx.entry(name.to_string()).or_default().push(MxRecord {
                preference,
                exchange: DomainName::parse(exchange).unwrap(),
            });
            self
        }

        pub fn ptr(mut self, ip: &str, name: &str) -> Self {
            self.ptr
                .entry(ip.parse().unwrap())
                .or_default()
                .push(DomainName::parse(name).unwrap());
            self
        }

        /// Every query type for `name` fails with `err`.
        pub fn fail(mut self, name: &str, err: DnsError) -> Self {
            self.failures.insert(name.to_string(), err);
            self
        }

        /// Queries for `name` never answer within a test's lifetime.
        pub fn stall(mut self, name: &str) -> Self {
            self.stalled.insert(name.to_string());
            self
        }

        pub fn query_count(&self) -> usize {
            self.queries.lock().unwrap().len()
        }

        fn record(&self, kind: &str, name: &str) -> Result<(), DnsError> {
            self.queries.lock().unwrap().push(format!("{kind} {name}"));
            match self.failures.get(name) {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }

        async fn hold(&self, name: &str) {
            if self.stalled.contains(name) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        }

        fn answer<T: Clone>(&self, map: &HashMap<String, Vec<T>>, name: &str) -> Result<Vec<T>, DnsError> {
            match map.get(name) {
                Some(v) if !v.is_empty() => Ok(v.clone()),
                _ if self.knows(name) => Err(DnsError::NoData),
                _ => Err(DnsError::NxDomain),
            }
        }

        fn knows(&self, name: &str) -> bool {
            self.txt.contains_key(name)
                || self.a.contains_key(name)
                || self.aaaa.contains_key(name)
                || self.mx.contains_key(name)
        }
    }

    #[async_trait]
    impl DnsLookup for MockResolver {
        async fn lookup_txt(&self, name: &DomainName) -> Result<Vec<TxtRecord>, DnsError> {
            self.record("TXT", name.as_str())?;
            self.hold(name.as_str()).await;
            self.answer(&self.txt, name.as_str())
        }

        async fn lookup_a(&self, name: &DomainName) -> Result<Vec<Ipv4Addr>, DnsError> {
            self.record("A", name.as_str())?;
            self.hold(name.as_str()).await;
            self.answer(&self.a, name.as_str())
        }

        async fn lookup_aaaa(&self, name: &DomainName) -> Result<Vec<Ipv6Addr>, DnsError> {
            self.record("AAAA", name.as_str())?;
            self.hold(name.as_str()).await;
            self.answer(&self.aaaa, name.as_str())
        }

        async fn lookup_mx(&self, name: &DomainName) -> Result<Vec<MxRecord>, DnsError> {
            self.record("MX", name.as_str())?;
            self.hold(name.as_str()).await;
            self.answer(&self.mx, name.as_str())
        }

        async fn lookup_ptr(&self, ip: IpAddr) -> Result<Vec<DomainName>, DnsError> {
            self.record("PTR", &ip.to_string())?;
            self.ptr.get(&ip).cloned().ok_or(DnsError::NxDomain)
        }
    }
}
