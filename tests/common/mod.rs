use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use subsweep::{CancelHandle, DnsClient, ResolutionResult};

pub fn ips(list: &[&str]) -> BTreeSet<IpAddr> {
    list.iter().map(|s| s.parse().unwrap()).collect()
}

/// In-memory zone: exact records first, then the first matching catch-all, else NXDOMAIN.
#[derive(Default)]
pub struct Zone {
    pub records: HashMap<String, BTreeSet<IpAddr>>,
    /// (suffix, answer); an empty suffix catches every name.
    pub wildcards: Vec<(String, BTreeSet<IpAddr>)>,
    pub delay: Duration,
    pub calls: AtomicUsize,
    /// Cancel the scan from inside the Nth lookup.
    pub cancel_at: Mutex<Option<(usize, CancelHandle)>>,
}

impl Zone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(mut self, host: &str, addrs: &[&str]) -> Self {
        self.records.insert(host.to_string(), ips(addrs));
        self
    }

    pub fn wildcard(mut self, addrs: &[&str]) -> Self {
        self.wildcards.push((String::new(), ips(addrs)));
        self
    }

    pub fn wildcard_under(mut self, domain: &str, addrs: &[&str]) -> Self {
        self.wildcards.push((domain.to_string(), ips(addrs)));
        self
    }

    fn catch_all(&self, hostname: &str) -> Option<BTreeSet<IpAddr>> {
        self.wildcards
            .iter()
            .find(|(suffix, _)| suffix.is_empty() || hostname.ends_with(&format!(".{}", suffix)))
            .map(|(_, set)| set.clone())
    }

    pub fn delay(mut self, d: Duration) -> Self {
        self.delay = d;
        self
    }

    pub fn arm_cancel(&self, at: usize, handle: CancelHandle) {
        *self.cancel_at.lock().unwrap() = Some((at, handle));
    }
}

#[async_trait]
impl DnsClient for Zone {
    async fn resolve(&self, hostname: &str, _server: SocketAddr, _timeout: Duration) -> ResolutionResult {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((at, handle)) = self.cancel_at.lock().unwrap().as_ref() {
            if n == *at {
                handle.cancel();
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let answer = self.records.get(hostname).cloned().or_else(|| self.catch_all(hostname));
        match answer {
            Some(set) => ResolutionResult::resolved(hostname, set, Duration::ZERO),
            None => ResolutionResult::not_found(hostname, Duration::ZERO),
        }
    }
}
