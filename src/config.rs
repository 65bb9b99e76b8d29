use crate::dkim::DEFAULT_PROBE_SELECTORS;
use anyhow::{Context, bail};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Engine settings shared by the CLI and the web service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Empty means the resolver library's default upstreams.
    pub nameservers: Vec<IpAddr>,
    pub query_timeout_secs: u64,
    /// Budget for each top-level SPF, DKIM or DMARC evaluation.
    pub deadline_secs: u64,
    pub probe_selectors: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nameservers: vec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            ],
            query_timeout_secs: 5,
            deadline_secs: 20,
            probe_selectors: DEFAULT_PROBE_SELECTORS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `MAILAUTH_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(list) = var("MAILAUTH_NAMESERVERS") {
            config.nameservers = comma_list(&list)
                .map(|ns| {
                    ns.parse::<IpAddr>()
                        .with_context(|| format!("MAILAUTH_NAMESERVERS: bad address `{ns}`"))
                })
                .collect::<anyhow::Result<_>>()?;
        }
        if let Some(secs) = var("MAILAUTH_QUERY_TIMEOUT_SECS") {
            config.query_timeout_secs = parse_secs("MAILAUTH_QUERY_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = var("MAILAUTH_DEADLINE_SECS") {
            config.deadline_secs = parse_secs("MAILAUTH_DEADLINE_SECS", &secs)?;
        }
        if let Some(list) = var("MAILAUTH_PROBE_SELECTORS") {
            config.probe_selectors = comma_list(&list).map(str::to_string).collect();
        }
        Ok(config)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

fn comma_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_secs(key: &str, value: &str) -> anyhow::Result<u64> {
    let secs: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("{key}: expected whole seconds, got `{value}`"))?;
    if secs == 0 {
        bail!("{key} must be positive");
    }
    Ok(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<EngineConfig> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.nameservers.len(), 2);
        assert_eq!(config.deadline(), Duration::from_secs(20));
        assert_eq!(config.probe_selectors[0], "default");
    }

    #[test]
    fn test_env_overrides() {
        let config = load(&[
            ("MAILAUTH_NAMESERVERS", "9.9.9.9, 2620:fe::fe"),
            ("MAILAUTH_QUERY_TIMEOUT_SECS", "2"),
            ("MAILAUTH_PROBE_SELECTORS", "s1,s2"),
        ])
        .unwrap();
        assert_eq!(config.nameservers.len(), 2);
        assert_eq!(config.query_timeout(), Duration::from_secs(2));
        assert_eq!(config.probe_selectors, ["s1", "s2"]);
    }

    #[test]
    fn test_bad_values_are_rejected() {
        assert!(load(&[("MAILAUTH_NAMESERVERS", "not-an-ip")]).is_err());
        assert!(load(&[("MAILAUTH_DEADLINE_SECS", "0")]).is_err());
        assert!(load(&[("MAILAUTH_DEADLINE_SECS", "soon")]).is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EngineConfig = serde_json::from_str(r#"{"deadline_secs": 3}"#).unwrap();
        assert_eq!(config.deadline_secs, 3);
        assert_eq!(config.query_timeout_secs, 5);
    }
}
