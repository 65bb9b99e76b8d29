//! `_dmarc` TXT record syntax (RFC 7489 §6.3).

use super::DmarcError;
use crate::dkim::parse_tag_list;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_REPORT_INTERVAL: u32 = 86400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    None,
    Quarantine,
    Reject,
}

impl FromStr for Policy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Policy::None),
            "quarantine" => Ok(Policy::Quarantine),
            "reject" => Ok(Policy::Reject),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Policy::None => "none",
            Policy::Quarantine => "quarantine",
            Policy::Reject => "reject",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignmentMode {
    #[default]
    Relaxed,
    Strict,
}

impl AlignmentMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "r" | "R" => Some(AlignmentMode::Relaxed),
            "s" | "S" => Some(AlignmentMode::Strict),
            _ => None,
        }
    }

    fn as_tag(self) -> &'static str {
        match self {
            AlignmentMode::Relaxed => "r",
            AlignmentMode::Strict => "s",
        }
    }
}

/// `fo=` failure reporting options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureOption {
    #[serde(rename = "0")]
    AllFail,
    #[serde(rename = "1")]
    AnyFail,
    #[serde(rename = "d")]
    DkimFail,
    #[serde(rename = "s")]
    SpfFail,
}

impl FailureOption {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "0" => Some(FailureOption::AllFail),
            "1" => Some(FailureOption::AnyFail),
            "d" | "D" => Some(FailureOption::DkimFail),
            "s" | "S" => Some(FailureOption::SpfFail),
            _ => None,
        }
    }

    fn as_tag(self) -> &'static str {
        match self {
            FailureOption::AllFail => "0",
            FailureOption::AnyFail => "1",
            FailureOption::DkimFail => "d",
            FailureOption::SpfFail => "s",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DmarcRecord {
    pub policy: Policy,
    /// `sp=`; `None` inherits `policy`.
    pub subdomain_policy: Option<Policy>,
    /// `np=` (RFC 9091) for non-existent subdomains.
    pub np: Option<Policy>,
    pub pct: u8,
    pub adkim: AlignmentMode,
    pub aspf: AlignmentMode,
    pub rua: Vec<String>,
    pub ruf: Vec<String>,
    pub fo: Vec<FailureOption>,
    pub rf: Vec<String>,
    pub ri: u32,
}

impl DmarcRecord {
    pub fn effective_subdomain_policy(&self) -> Policy {
        self.subdomain_policy.unwrap_or(self.policy)
    }

    /// Parses a record, returning the notes for each optional tag whose
    /// value was unusable and replaced by its default.
    pub fn parse(s: &str) -> Result<(Self, Vec<String>), DmarcError> {
        let tags = parse_tag_list(s).ok_or_else(|| DmarcError::Malformed("tag syntax".to_string()))?;
        match tags.first() {
            Some(&("v", "DMARC1")) => {}
            Some(&("v", other)) => {
                return Err(DmarcError::Malformed(format!("unsupported version `{other}`")));
            }
            _ => return Err(DmarcError::Malformed("v=DMARC1 must be the first tag".to_string())),
        }

        let mut warnings = Vec::new();
        let mut policy = None;
        let mut record = DmarcRecord {
            policy: Policy::None,
            subdomain_policy: None,
            np: None,
            pct: 100,
            adkim: AlignmentMode::Relaxed,
            aspf: AlignmentMode::Relaxed,
            rua: Vec::new(),
            ruf: Vec::new(),
            fo: vec![FailureOption::AllFail],
            rf: vec!["afrf".to_string()],
            ri: DEFAULT_REPORT_INTERVAL,
        };

        for &(name, value) in &tags[1..] {
            let ignored = format!("{name}={value} ignored, using default");
            match name {
                "p" => {
                    policy = Some(
                        value
                            .parse::<Policy>()
                            .map_err(|_| DmarcError::Malformed(format!("invalid p=`{value}`")))?,
                    )
                }
                "sp" => match value.parse() {
                    Ok(p) => record.subdomain_policy = Some(p),
                    Err(_) => warnings.push(ignored),
                },
                "np" => match value.parse() {
                    Ok(p) => record.np = Some(p),
                    Err(_) => warnings.push(ignored),
                },
                "pct" => match value.parse::<i64>() {
                    Ok(n) => {
                        if !(0..=100).contains(&n) {
                            warnings.push(format!("pct={value} clamped"));
                        }
                        record.pct = n.clamp(0, 100) as u8;
                    }
                    Err(_) => warnings.push(ignored),
                },
                "adkim" => match AlignmentMode::parse(value) {
                    Some(mode) => record.adkim = mode,
                    None => warnings.push(ignored),
                },
                "aspf" => match AlignmentMode::parse(value) {
                    Some(mode) => record.aspf = mode,
                    None => warnings.push(ignored),
                },
                "rua" => record.rua = uri_list(value),
                "ruf" => record.ruf = uri_list(value),
                "fo" => {
                    let options: Option<Vec<_>> = value.split(':').map(|o| FailureOption::parse(o.trim())).collect();
                    match options {
                        Some(options) if !options.is_empty() => record.fo = options,
                        _ => warnings.push(ignored),
                    }
                }
                "rf" => {
                    let formats: Vec<String> = value
                        .split(':')
                        .map(|f| f.trim().to_ascii_lowercase())
                        .filter(|f| !f.is_empty())
                        .collect();
                    if formats.is_empty() {
                        warnings.push(ignored);
                    } else {
                        record.rf = formats;
                    }
                }
                "ri" => match value.parse() {
                    Ok(ri) => record.ri = ri,
                    Err(_) => warnings.push(ignored),
                },
                _ => {}
            }
        }

        record.policy = policy.ok_or_else(|| DmarcError::Malformed("missing p=".to_string()))?;
        Ok((record, warnings))
    }
}

fn uri_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect()
}

/// True when the first tag is exactly `v=DMARC1`.
pub fn is_dmarc_record(txt: &str) -> bool {
    txt.split(';')
        .next()
        .and_then(|tag| tag.split_once('='))
        .is_some_and(|(name, value)| name.trim() == "v" && value.trim() == "DMARC1")
}

impl FromStr for DmarcRecord {
    type Err = DmarcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DmarcRecord::parse(s).map(|(record, _)| record)
    }
}

/// Canonical text: `v` and `p` first, then only tags that differ from their defaults.
impl fmt::Display for DmarcRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=DMARC1; p={}", self.policy)?;
        if let Some(sp) = self.subdomain_policy {
            write!(f, "; sp={sp}")?;
        }
        if let Some(np) = self.np {
            write!(f, "; np={np}")?;
        }
        if self.adkim != AlignmentMode::Relaxed {
            write!(f, "; adkim={}", self.adkim.as_tag())?;
        }
        if self.aspf != AlignmentMode::Relaxed {
            write!(f, "; aspf={}", self.aspf.as_tag())?;
        }
        if self.pct != 100 {
            write!(f, "; pct={}", self.pct)?;
        }
        if self.fo != [FailureOption::AllFail] {
            let fo: Vec<&str> = self.fo.iter().map(|o| o.as_tag()).collect();
            write!(f, "; fo={}", fo.join(":"))?;
        }
        if self.rf != ["afrf"] {
            write!(f, "; rf={}", self.rf.join(":"))?;
        }
        if self.ri != DEFAULT_REPORT_INTERVAL {
            write!(f, "; ri={}", self.ri)?;
        }
        if !self.rua.is_empty() {
            write!(f, "; rua={}", self.rua.join(","))?;
        }
        if !self.ruf.is_empty() {
            write!(f, "; ruf={}", self.ruf.join(","))?;
        }
        Ok(())
    }
}
