//! DKIM public key record (RFC 6376 §3.6.1), syntactic layer only.

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Why a key record (or the answer holding it) cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DkimInvalid {
    #[error("multiple-records")]
    MultipleRecords,
    #[error("malformed-key")]
    MalformedKey,
    #[error("unsupported-version")]
    UnsupportedVersion,
    #[error("misplaced-version")]
    MisplacedVersion,
    #[error("tag-syntax")]
    TagSyntax,
    #[error("missing-key")]
    MissingKey,
    #[error("invalid-selector")]
    InvalidSelector,
    /// The TXT data was not valid UTF-8.
    #[error("non-utf8")]
    NonUtf8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Rsa,
    Ed25519,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFlag {
    /// `t=y`: the domain is testing DKIM.
    Testing,
    /// `t=s`: `i=` must not be a subdomain of `d=`.
    NoSubdomains,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DkimKeyRecord {
    pub version: Option<String>,
    pub key_type: KeyType,
    /// Empty means every hash algorithm is acceptable.
    pub hash_algorithms: Vec<String>,
    pub service_types: Vec<String>,
    pub flags: Vec<KeyFlag>,
    pub notes: Option<String>,
    /// Base64 text of `p=` with whitespace removed; empty for a revoked key.
    pub public_key_base64: String,
    /// Decoded key length in bytes.
    pub key_len: usize,
    pub unknown_tags: Vec<(String, String)>,
}

impl DkimKeyRecord {
    pub fn is_revoked(&self) -> bool {
        self.public_key_base64.is_empty()
    }

    pub fn is_testing(&self) -> bool {
        self.flags.contains(&KeyFlag::Testing)
    }
}

/// Splits `tag=value;` pairs. Names must be unique.
pub(crate) fn parse_tag_list(s: &str) -> Option<Vec<(&str, &str)>> {
    let mut tags = Vec::new();
    let mut seen = HashSet::new();
    for spec in s.split(';') {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        let (name, value) = spec.split_once('=')?;
        let name = name.trim();
        let valid = name.starts_with(|c: char| c.is_ascii_alphabetic())
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid || !seen.insert(name) {
            return None;
        }
        tags.push((name, value.trim()));
    }
    Some(tags)
}

fn colon_list(value: &str) -> Vec<String> {
    value
        .split(':')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl FromStr for DkimKeyRecord {
    type Err = DkimInvalid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tags = parse_tag_list(s).ok_or(DkimInvalid::TagSyntax)?;

        let mut record = DkimKeyRecord {
            version: None,
            key_type: KeyType::Rsa,
            hash_algorithms: Vec::new(),
            service_types: vec!["*".to_string()],
            flags: Vec::new(),
            notes: None,
            public_key_base64: String::new(),
            key_len: 0,
            unknown_tags: Vec::new(),
        };
        let mut key = None;

        for (i, (name, value)) in tags.into_iter().enumerate() {
            match name {
                "v" => {
                    if i != 0 {
                        return Err(DkimInvalid::MisplacedVersion);
                    }
                    if value != "DKIM1" {
                        return Err(DkimInvalid::UnsupportedVersion);
                    }
                    record.version = Some(value.to_string());
                }
                "k" => {
                    record.key_type = match value.to_ascii_lowercase().as_str() {
                        "rsa" => KeyType::Rsa,
                        "ed25519" => KeyType::Ed25519,
                        other => KeyType::Other(other.to_string()),
                    }
                }
                "h" => record.hash_algorithms = colon_list(value),
                "s" => record.service_types = colon_list(value),
                "t" => {
                    record.flags = colon_list(value)
                        .into_iter()
                        .map(|f| match f.as_str() {
                            "y" => KeyFlag::Testing,
                            "s" => KeyFlag::NoSubdomains,
                            _ => KeyFlag::Other(f),
                        })
                        .collect()
                }
                "n" => record.notes = Some(value.to_string()),
                "p" => key = Some(value.split_whitespace().collect::<String>()),
                _ => record
                    .unknown_tags
                    .push((name.to_string(), value.to_string())),
            }
        }

        let key = key.ok_or(DkimInvalid::MissingKey)?;
        if !key.is_empty() {
            record.key_len = STANDARD
                .decode(&key)
                .map_err(|_| DkimInvalid::MalformedKey)?
                .len();
        }
        record.public_key_base64 = key;
        Ok(record)
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Rsa => write!(f, "rsa"),
            KeyType::Ed25519 => write!(f, "ed25519"),
            KeyType::Other(s) => write!(f, "{s}"),
        }
    }
}
