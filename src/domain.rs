use std::fmt;

use idna::domain_to_ascii;
use serde::{Serialize, Serializer};
use thiserror::Error;

const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum DomainError {
    #[error("empty domain name")]
    Empty,
    #[error("domain name longer than 253 octets")]
    TooLong,
    #[error("label `{0}` is empty or longer than 63 octets")]
    BadLabel(String),
    #[error("invalid internationalized name `{0}`")]
    Idna(String),
}

/// Normalized, lower-cased, A-label FQDN without the trailing dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainName(String);

impl DomainName {
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let trimmed = input.trim();
        let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(DomainError::Empty);
        }

        let ascii = if trimmed.is_ascii() {
            trimmed.to_ascii_lowercase()
        } else {
            domain_to_ascii(trimmed).map_err(|_| DomainError::Idna(trimmed.to_string()))?
        };

        if ascii.len() > MAX_NAME_LEN {
            return Err(DomainError::TooLong);
        }
        if let Some(label) = ascii
            .split('.')
            .find(|l| l.is_empty() || l.len() > MAX_LABEL_LEN)
        {
            return Err(DomainError::BadLabel(label.to_string()));
        }

        Ok(Self(ascii))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prepends `prefix` as one or more labels, e.g. `_dmarc` or `sel._domainkey`.
    pub fn prepend(&self, prefix: &str) -> Result<Self, DomainError> {
        Self::parse(&format!("{}.{}", prefix, self.0))
    }

    /// True when `self` is `parent` or lies below it.
    pub fn is_within(&self, parent: &DomainName) -> bool {
        self == parent || self.is_subdomain_of(parent)
    }

    /// Strict subdomain test; a name is not a subdomain of itself.
    pub fn is_subdomain_of(&self, parent: &DomainName) -> bool {
        self.0.len() > parent.0.len()
            && self.0.ends_with(parent.as_str())
            && self.0.as_bytes()[self.0.len() - parent.0.len() - 1] == b'.'
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for DomainName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for DomainName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for DomainName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Extracts the domain part of a mailbox, tolerating angle brackets.
pub fn domain_of_address(address: &str) -> Option<DomainName> {
    let (_, domain) = address.rsplit_once('@')?;
    DomainName::parse(domain.trim().trim_end_matches('>').trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_case_and_trailing_dot() {
        let name = DomainName::parse("Mail.EXAMPLE.com.").unwrap();
        assert_eq!(name.as_str(), "mail.example.com");
    }

    #[test]
    fn test_idn_becomes_a_label() {
        let name = DomainName::parse("bücher.example").unwrap();
        assert_eq!(name.as_str(), "xn--bcher-kva.example");
    }

    #[test]
    fn test_rejects_empty_and_oversized() {
        assert_eq!(DomainName::parse(" . "), Err(DomainError::Empty));
        let label = "a".repeat(64);
        assert!(matches!(
            DomainName::parse(&format!("{label}.com")),
            Err(DomainError::BadLabel(_))
        ));
        let long = vec!["abcdefghi"; 26].join(".");
        assert_eq!(DomainName::parse(&long), Err(DomainError::TooLong));
        assert!(DomainName::parse("a..b").is_err());
    }

    #[test]
    fn test_underscore_labels_allowed() {
        let name = DomainName::parse("_spf.google.com").unwrap();
        assert_eq!(name.prepend("_dmarc").unwrap().as_str(), "_dmarc._spf.google.com");
    }

    #[test]
    fn test_subdomain_relations() {
        let parent = DomainName::parse("example.com").unwrap();
        let child = DomainName::parse("mail.example.com").unwrap();
        let lookalike = DomainName::parse("badexample.com").unwrap();
        assert!(child.is_subdomain_of(&parent));
        assert!(!parent.is_subdomain_of(&parent));
        assert!(parent.is_within(&parent));
        assert!(!lookalike.is_within(&parent));
    }

    #[test]
    fn test_domain_of_address() {
        assert_eq!(
            domain_of_address("<user@Sub.Example.org>").unwrap().as_str(),
            "sub.example.org"
        );
        assert_eq!(domain_of_address("no-at-sign"), None);
    }
}
