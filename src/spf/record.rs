//! SPF record parsing.

use super::macros;
use super::SpfError;
use serde::Serialize;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    fn symbol(self) -> char {
        match self {
            Qualifier::Pass => '+',
            Qualifier::Fail => '-',
            Qualifier::SoftFail => '~',
            Qualifier::Neutral => '?',
        }
    }
}

/// A mechanism; domain-specs are kept unexpanded, macros and all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Mechanism {
    All,
    Include { domain: String },
    A { domain: Option<String>, cidr4: Option<u8>, cidr6: Option<u8> },
    Mx { domain: Option<String>, cidr4: Option<u8>, cidr6: Option<u8> },
    Ptr { domain: Option<String> },
    Ip4 { addr: Ipv4Addr, prefix: u8 },
    Ip6 { addr: Ipv6Addr, prefix: u8 },
    Exists { domain: String },
}

impl Mechanism {
    /// Mechanisms that cost one unit of the DNS-lookup budget.
    pub fn needs_dns(&self) -> bool {
        matches!(
            self,
            Mechanism::Include { .. }
                | Mechanism::A { .. }
                | Mechanism::Mx { .. }
                | Mechanism::Ptr { .. }
                | Mechanism::Exists { .. }
        )
    }
}

fn fmt_cidr(f: &mut fmt::Formatter<'_>, cidr4: Option<u8>, cidr6: Option<u8>) -> fmt::Result {
    if let Some(c4) = cidr4 {
        write!(f, "/{c4}")?;
    }
    if let Some(c6) = cidr6 {
        write!(f, "//{c6}")?;
    }
    Ok(())
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mechanism::All => write!(f, "all"),
            Mechanism::Include { domain } => write!(f, "include:{domain}"),
            Mechanism::A { domain, cidr4, cidr6 } | Mechanism::Mx { domain, cidr4, cidr6 } => {
                let name = if matches!(self, Mechanism::A { .. }) { "a" } else { "mx" };
                write!(f, "{name}")?;
                if let Some(d) = domain {
                    write!(f, ":{d}")?;
                }
                fmt_cidr(f, *cidr4, *cidr6)
            }
            Mechanism::Ptr { domain: Some(d) } => write!(f, "ptr:{d}"),
            Mechanism::Ptr { domain: None } => write!(f, "ptr"),
            Mechanism::Ip4 { addr, prefix } => write!(f, "ip4:{addr}/{prefix}"),
            Mechanism::Ip6 { addr, prefix } => write!(f, "ip6:{addr}/{prefix}"),
            Mechanism::Exists { domain } => write!(f, "exists:{domain}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Directive {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism,
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.qualifier != Qualifier::Pass {
            write!(f, "{}", self.qualifier.symbol())?;
        }
        write!(f, "{}", self.mechanism)
    }
}

/// Parsed SPF record. Directive order is evaluation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpfRecord {
    pub directives: Vec<Directive>,
    pub redirect: Option<String>,
    pub exp: Option<String>,
}

/// True for `v=spf1` alone or followed by a space, in any case.
pub fn is_spf_record(txt: &str) -> bool {
    let txt = txt.trim_start();
    match txt.get(..6) {
        Some(version) if version.eq_ignore_ascii_case("v=spf1") => {
            txt.len() == 6 || txt.as_bytes()[6] == b' '
        }
        _ => false,
    }
}

impl SpfRecord {
    pub fn parse(txt: &str) -> Result<Self, SpfError> {
        if !is_spf_record(txt) {
            return Err(SpfError::Syntax("missing v=spf1".into()));
        }

        let mut directives = Vec::new();
        let mut redirect = None;
        let mut exp = None;

        for term in txt.split_ascii_whitespace().skip(1) {
            if let Some((name, value)) = split_modifier(term) {
                let slot = match name.to_ascii_lowercase().as_str() {
                    "redirect" => &mut redirect,
                    "exp" => &mut exp,
                    _ => continue,
                };
                if slot.is_some() {
                    return Err(SpfError::Syntax(format!("duplicate {name} modifier")));
                }
                check_domain_spec(value)?;
                *slot = Some(value.to_string());
                continue;
            }
            directives.push(parse_directive(term)?);
        }

        if redirect.is_some() && directives.iter().any(|d| d.mechanism == Mechanism::All) {
            return Err(SpfError::Syntax(
                "redirect modifier is unreachable behind an all mechanism".into(),
            ));
        }

        Ok(SpfRecord {
            directives,
            redirect,
            exp,
        })
    }
}

/// `name=value` where `name` is a modifier name; anything else is a directive.
fn split_modifier(term: &str) -> Option<(&str, &str)> {
    let (name, value) = term.split_once('=')?;
    let mut chars = name.chars();
    let first = chars.next()?;
    let valid = first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    valid.then_some((name, value))
}

fn check_domain_spec(spec: &str) -> Result<(), SpfError> {
    if spec.is_empty() {
        return Err(SpfError::Syntax("empty domain-spec".into()));
    }
    if spec.contains('/') {
        return Err(SpfError::Syntax(format!("unexpected CIDR in domain-spec `{spec}`")));
    }
    macros::validate(spec).map_err(|e| SpfError::Syntax(e.to_string()))?;
    if !has_domain_end(spec) {
        return Err(SpfError::Syntax(format!("domain-spec `{spec}` lacks a top-level label")));
    }
    Ok(())
}

/// RFC 7208 `domain-end`: a closing macro, or `.` followed by a toplabel.
fn has_domain_end(spec: &str) -> bool {
    let spec = spec.strip_suffix('.').unwrap_or(spec);
    if spec.ends_with('}') {
        return true;
    }
    let Some((_, top)) = spec.rsplit_once('.') else {
        return false;
    };
    !top.is_empty()
        && top.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        && top.bytes().any(|b| b.is_ascii_alphabetic())
        && !top.starts_with('-')
        && !top.ends_with('-')
}

fn parse_directive(term: &str) -> Result<Directive, SpfError> {
    let (qualifier, body) = match term.chars().next() {
        Some('+') => (Qualifier::Pass, &term[1..]),
        Some('-') => (Qualifier::Fail, &term[1..]),
        Some('~') => (Qualifier::SoftFail, &term[1..]),
        Some('?') => (Qualifier::Neutral, &term[1..]),
        _ => (Qualifier::Pass, term),
    };

    let split = body.find([':', '/']).unwrap_or(body.len());
    let (name, rest) = body.split_at(split);
    let mechanism = match name.to_ascii_lowercase().as_str() {
        "all" if rest.is_empty() => Mechanism::All,
        "include" => Mechanism::Include {
            domain: required_domain(rest, term)?,
        },
        "exists" => Mechanism::Exists {
            domain: required_domain(rest, term)?,
        },
        "ptr" => Mechanism::Ptr {
            domain: optional_domain(rest, term)?,
        },
        "ip4" => {
            let (addr, prefix) = parse_ip_network(rest, term, 32)?;
            Mechanism::Ip4 { addr, prefix }
        }
        "ip6" => {
            let (addr, prefix) = parse_ip_network(rest, term, 128)?;
            Mechanism::Ip6 { addr, prefix }
        }
        "a" | "mx" => {
            let (domain, cidr4, cidr6) = parse_dual_cidr(rest, term)?;
            if name.eq_ignore_ascii_case("a") {
                Mechanism::A { domain, cidr4, cidr6 }
            } else {
                Mechanism::Mx { domain, cidr4, cidr6 }
            }
        }
        _ => return Err(SpfError::Syntax(format!("unknown mechanism `{term}`"))),
    };

    Ok(Directive {
        qualifier,
        mechanism,
    })
}

fn required_domain(rest: &str, term: &str) -> Result<String, SpfError> {
    optional_domain(rest, term)?
        .ok_or_else(|| SpfError::Syntax(format!("`{term}` requires a domain")))
}

fn optional_domain(rest: &str, term: &str) -> Result<Option<String>, SpfError> {
    match rest.strip_prefix(':') {
        Some(spec) => {
            check_domain_spec(spec)?;
            Ok(Some(spec.to_string()))
        }
        None if rest.is_empty() => Ok(None),
        None => Err(SpfError::Syntax(format!("malformed mechanism `{term}`"))),
    }
}

fn parse_prefix(s: &str, max: u8, term: &str) -> Result<u8, SpfError> {
    let canonical = s == "0" || (!s.starts_with('0') && s.bytes().all(|b| b.is_ascii_digit()));
    match s.parse::<u8>() {
        Ok(p) if canonical && p <= max => Ok(p),
        _ => Err(SpfError::Syntax(format!("bad CIDR length in `{term}`"))),
    }
}

fn parse_ip_network<T: std::str::FromStr>(rest: &str, term: &str, max: u8) -> Result<(T, u8), SpfError> {
    let spec = rest
        .strip_prefix(':')
        .ok_or_else(|| SpfError::Syntax(format!("`{term}` requires an address")))?;
    let (addr, prefix) = match spec.split_once('/') {
        Some((addr, p)) => (addr, parse_prefix(p, max, term)?),
        None => (spec, max),
    };
    let addr = addr
        .parse()
        .map_err(|_| SpfError::Syntax(format!("bad address in `{term}`")))?;
    Ok((addr, prefix))
}

/// `[:domain][/cidr4][//cidr6]` for `a` and `mx`.
fn parse_dual_cidr(rest: &str, term: &str) -> Result<(Option<String>, Option<u8>, Option<u8>), SpfError> {
    let (domain_part, cidr_part) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };
    let domain = optional_domain(domain_part, term)?;

    let (cidr4, cidr6) = if cidr_part.is_empty() {
        (None, None)
    } else if let Some(c6) = cidr_part.strip_prefix("//") {
        (None, Some(parse_prefix(c6, 128, term)?))
    } else {
        let c = &cidr_part[1..];
        match c.split_once("//") {
            Some((c4, c6)) => (Some(parse_prefix(c4, 32, term)?), Some(parse_prefix(c6, 128, term)?)),
            None => (Some(parse_prefix(c, 32, term)?), None),
        }
    };
    Ok((domain, cidr4, cidr6))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let record = SpfRecord::parse("v=spf1 -all").unwrap();
        assert_eq!(record.directives.len(), 1);
        assert_eq!(record.directives[0].qualifier, Qualifier::Fail);
        assert_eq!(record.directives[0].mechanism, Mechanism::All);
    }

    #[test]
    fn test_parse_keeps_document_order() {
        let record =
            SpfRecord::parse("v=spf1 ip4:1.2.3.0/24 -all ip4:1.2.3.0/24 +all").unwrap();
        let rendered: Vec<String> = record.directives.iter().map(|d| d.to_string()).collect();
        assert_eq!(rendered, ["ip4:1.2.3.0/24", "-all", "ip4:1.2.3.0/24", "all"]);
    }

    #[test]
    fn test_parse_a_and_mx_cidr_forms() {
        let record =
            SpfRecord::parse("v=spf1 a a:example.com a/24 a:example.com/24//64 mx//48 -all").unwrap();
        assert_eq!(
            record.directives[3].mechanism,
            Mechanism::A {
                domain: Some("example.com".into()),
                cidr4: Some(24),
                cidr6: Some(64)
            }
        );
        assert_eq!(
            record.directives[4].mechanism,
            Mechanism::Mx {
                domain: None,
                cidr4: None,
                cidr6: Some(48)
            }
        );
    }

    #[test]
    fn test_parse_case_insensitive_names_keep_domain_case() {
        let record = SpfRecord::parse("V=SPF1 INCLUDE:_SPF.Example.COM IP4:192.0.2.1 -ALL").unwrap();
        assert_eq!(
            record.directives[0].mechanism,
            Mechanism::Include {
                domain: "_SPF.Example.COM".into()
            }
        );
        assert_eq!(record.directives.len(), 3);
    }

    #[test]
    fn test_modifiers() {
        let record = SpfRecord::parse("v=spf1 mx redirect=_spf.example.com exp=explain.%{d} foo=bar").unwrap();
        assert_eq!(record.redirect.as_deref(), Some("_spf.example.com"));
        assert_eq!(record.exp.as_deref(), Some("explain.%{d}"));
        assert_eq!(record.directives.len(), 1);
    }

    #[test]
    fn test_redirect_errors() {
        assert!(SpfRecord::parse("v=spf1 redirect=a.example redirect=b.example").is_err());
        assert!(SpfRecord::parse("v=spf1 exp=a.example exp=b.example").is_err());
        assert!(SpfRecord::parse("v=spf1 -all redirect=a.example").is_err());
        assert!(SpfRecord::parse("v=spf1 redirect=").is_err());
    }

    #[test]
    fn test_malformed_terms() {
        for bad in [
            "v=spf1 foo",
            "v=spf1 ip4:1.2.3.4/33",
            "v=spf1 ip4:1.2.3.4/024",
            "v=spf1 ip6:2001:db8::/129",
            "v=spf1 ip4:not-an-ip",
            "v=spf1 include",
            "v=spf1 include:",
            "v=spf1 allx",
            "v=spf1 a/",
            "v=spf1 exists:%{q}",
            "v=spf1 -+all",
            "v=spf1 include:other.example/24",
            "v=spf1 exists:x/24",
            "v=spf1 ptr:example.com/24",
            "v=spf1 redirect=next.example/24",
            "v=spf1 exp=explain.example/8",
            "v=spf1 include:localhost",
            "v=spf1 exists:foo.123",
            "v=spf1 a:example.-bad",
        ] {
            assert!(SpfRecord::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_domain_end_forms() {
        for good in [
            "v=spf1 include:_spf.example.com",
            "v=spf1 include:example.com.",
            "v=spf1 exists:%{ir}.%{d}",
            "v=spf1 exists:%{l}._spf.example.com",
        ] {
            assert!(SpfRecord::parse(good).is_ok(), "{good} should parse");
        }
    }

    #[test]
    fn test_version_detection() {
        assert!(is_spf_record("v=spf1"));
        assert!(is_spf_record("V=SPF1 -all"));
        assert!(!is_spf_record("v=spf10 -all"));
        assert!(!is_spf_record("spf2.0/pra -all"));
        assert!(SpfRecord::parse("v=spf2 -all").is_err());
    }
}
