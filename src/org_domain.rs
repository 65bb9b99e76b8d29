use crate::domain::DomainName;

/// Organizational-domain resolver, backed by some version of the public suffix list.
pub trait OrgDomainResolver: Send + Sync {
    fn organizational_domain(&self, domain: &DomainName) -> DomainName;
}

/// Uses the suffix list compiled into the `psl` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct PslOrgDomain;

impl OrgDomainResolver for PslOrgDomain {
    fn organizational_domain(&self, domain: &DomainName) -> DomainName {
        psl::domain_str(domain.as_str())
            .and_then(|org| DomainName::parse(org).ok())
            .unwrap_or_else(|| domain.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org(name: &str) -> String {
        PslOrgDomain
            .organizational_domain(&DomainName::parse(name).unwrap())
            .to_string()
    }

    #[test]
    fn test_org_domain() {
        assert_eq!(org("example.com"), "example.com");
        assert_eq!(org("mail.example.com"), "example.com");
        assert_eq!(org("a.b.c.example.com"), "example.com");
    }

    #[test]
    fn test_org_domain_multi_label_suffix() {
        assert_eq!(org("mail.example.co.uk"), "example.co.uk");
        assert_eq!(org("foo.bar.co.uk"), "bar.co.uk");
    }

    #[test]
    fn test_bare_suffix_is_returned_unchanged() {
        assert_eq!(org("co.uk"), "co.uk");
    }
}
