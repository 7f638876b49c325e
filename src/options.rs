use crate::dicts::read_domain_list;
use crate::dns::is_valid_hostname;
use crate::error::{Result, ScanError};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DNS_PORT: u16 = 53;

/// Everything a scan needs besides the wordlist contents and the DNS client.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub domain: String,
    /// `None` falls back to the embedded wordlist.
    pub wordlist_source: Option<PathBuf>,
    pub concurrency: usize,
    pub query_timeout: Duration,
    /// Extra attempts after the first one, each against a different nameserver when possible.
    pub retries: u32,
    /// `IP` or `IP:port`. Empty means the built-in public resolvers.
    pub nameservers: Vec<String>,
    pub overall_deadline: Option<Duration>,
    pub wildcard_probes: usize,
    /// Consecutive failures before a nameserver is marked unhealthy.
    pub failure_threshold: u32,
    /// Consecutive failed candidates before the scan gives up. 0 disables.
    pub abort_after_failures: u64,
    pub progress_interval: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            wordlist_source: None,
            concurrency: 100,
            query_timeout: Duration::from_secs(3),
            retries: 2,
            nameservers: Vec::new(),
            overall_deadline: None,
            wildcard_probes: 3,
            failure_threshold: 3,
            abort_after_failures: 1000,
            progress_interval: Duration::from_secs(1),
        }
    }
}

impl ScanConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self { domain: domain.into(), ..Self::default() }
    }

    /// Normalizes the domain in place and rejects anything that would make the
    /// scan meaningless. Runs before any worker starts.
    pub fn validate(&mut self) -> Result<()> {
        self.domain = normalize_domain(&self.domain);
        if self.domain.is_empty() {
            return Err(ScanError::EmptyDomain);
        }
        if !is_valid_hostname(&self.domain) {
            return Err(ScanError::InvalidDomain(self.domain.clone()));
        }
        if self.concurrency == 0 {
            return Err(ScanError::ZeroConcurrency);
        }
        if self.wildcard_probes < 2 {
            return Err(ScanError::InvalidProbeCount(self.wildcard_probes));
        }
        self.resolved_nameservers()?;
        Ok(())
    }

    pub fn resolved_nameservers(&self) -> Result<Vec<SocketAddr>> {
        let list = get_resolvers(&self.nameservers);
        let parsed = list.iter().map(|s| parse_nameserver(s)).collect::<Result<Vec<_>>>()?;
        if parsed.is_empty() {
            return Err(ScanError::NoNameservers);
        }
        Ok(parsed)
    }
}

pub fn normalize_domain(raw: &str) -> String {
    raw.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Merges inline targets with the ones read from a domain list, normalized and
/// deduplicated in first-seen order.
pub fn collect_targets(inline: &[String], list: Option<&Path>) -> Result<Vec<String>> {
    let mut raw: Vec<String> = inline.to_vec();
    if let Some(p) = list {
        raw.extend(read_domain_list(p)?);
    }
    let mut seen = HashSet::new();
    let targets: Vec<String> = raw
        .iter()
        .map(|d| normalize_domain(d))
        .filter(|d| !d.is_empty() && seen.insert(d.clone()))
        .collect();
    if targets.is_empty() {
        return Err(ScanError::NoTargets);
    }
    Ok(targets)
}

pub fn get_resolvers(input: &[String]) -> Vec<String> {
    if !input.is_empty() {
        return input.to_vec();
    }
    vec![
        "1.1.1.1".to_string(),
        "8.8.8.8".to_string(),
        "9.9.9.9".to_string(),
        "1.0.0.1".to_string(),
        "8.8.4.4".to_string(),
    ]
}

/// Accepts `1.1.1.1`, `1.1.1.1:5353`, `2606:4700::1111` and `[2606:4700::1111]:53`.
pub fn parse_nameserver(raw: &str) -> Result<SocketAddr> {
    let s = raw.trim();
    if let Ok(sa) = s.parse::<SocketAddr>() {
        return Ok(sa);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_DNS_PORT))
        .map_err(|_| ScanError::InvalidNameserver(raw.to_string()))
}
