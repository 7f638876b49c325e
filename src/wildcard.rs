use crate::dns::{is_valid_hostname, DnsClient, Outcome};
use crate::resolver_pool::ResolverPool;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const PROBE_LABEL_LEN: usize = 12;

/// Result of probing the target with labels that cannot exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WildcardSignature {
    pub ips: BTreeSet<IpAddr>,
    /// Probes never agreed or never got through; the run proceeds as non-wildcarded.
    pub uncertain: bool,
}

impl WildcardSignature {
    pub fn is_wildcard(&self) -> bool {
        !self.ips.is_empty()
    }

    /// True when `answers` cannot be told apart from the catch-all.
    pub fn filters(&self, answers: &BTreeSet<IpAddr>) -> bool {
        is_wildcard(answers, &self.ips)
    }
}

/// A non-empty answer set that is entirely covered by the wildcard set.
pub fn is_wildcard(answers: &BTreeSet<IpAddr>, wild_ips: &BTreeSet<IpAddr>) -> bool {
    if wild_ips.is_empty() || answers.is_empty() {
        return false;
    }
    answers.is_subset(wild_ips)
}

pub fn random_label(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len.max(10))
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

/// Two or more probe answers share at least one address.
fn answers_agree(sets: &[BTreeSet<IpAddr>]) -> bool {
    sets.iter()
        .enumerate()
        .any(|(i, a)| sets[i + 1..].iter().any(|b| !a.is_disjoint(b)))
}

enum Probe {
    Answered(BTreeSet<IpAddr>),
    Negative,
    Failed,
}

enum Round {
    /// At least one authoritative negative and no answers.
    Empty,
    Agreed(BTreeSet<IpAddr>),
    Inconclusive,
    /// Every probe failed; the zone was never observed.
    Unobserved,
}

pub struct WildcardDetector<'a, C: DnsClient + ?Sized> {
    client: &'a C,
    pool: &'a ResolverPool,
    probes: usize,
    timeout: Duration,
}

impl<'a, C: DnsClient + ?Sized> WildcardDetector<'a, C> {
    pub fn new(client: &'a C, pool: &'a ResolverPool, probes: usize, timeout: Duration) -> Self {
        Self { client, pool, probes: probes.max(2), timeout }
    }

    /// Runs one probe round and, if it is inconclusive, exactly one more.
    pub async fn detect(&self, domain: &str) -> WildcardSignature {
        let mut unobserved = false;
        for round in 0..2 {
            match self.probe_round(domain).await {
                Round::Empty if round == 0 || unobserved => {
                    debug!(domain, "no wildcard answers");
                    return WildcardSignature::default();
                }
                Round::Agreed(ips) => {
                    info!(domain, ips = ?ips, "wildcard DNS detected");
                    return WildcardSignature { ips, uncertain: false };
                }
                Round::Unobserved => {
                    debug!(domain, round, "every wildcard probe failed");
                    unobserved = true;
                }
                Round::Empty | Round::Inconclusive => {
                    debug!(domain, round, "wildcard probe round inconclusive");
                    unobserved = false;
                }
            }
        }
        warn!(domain, "wildcard detection uncertain, continuing without a signature");
        WildcardSignature { ips: BTreeSet::new(), uncertain: true }
    }

    async fn probe_round(&self, domain: &str) -> Round {
        let mut answered: Vec<BTreeSet<IpAddr>> = Vec::with_capacity(self.probes);
        let mut negatives = 0usize;
        for _ in 0..self.probes {
            let host = format!("{}.{}", random_label(PROBE_LABEL_LEN), domain);
            match self.probe(&host).await {
                Probe::Answered(ips) => answered.push(ips),
                Probe::Negative => negatives += 1,
                Probe::Failed => {}
            }
        }
        if answered.is_empty() && negatives == 0 {
            Round::Unobserved
        } else if answered.is_empty() {
            Round::Empty
        } else if answers_agree(&answered) {
            Round::Agreed(answered.into_iter().flatten().collect())
        } else {
            Round::Inconclusive
        }
    }

    /// One probe, with a single retry on another nameserver for transient failures.
    async fn probe(&self, host: &str) -> Probe {
        if !is_valid_hostname(host) {
            debug!(host, "wildcard probe name is not a valid hostname");
            return Probe::Failed;
        }
        let mut tried = Vec::with_capacity(2);
        for _ in 0..2 {
            let server = match self.pool.acquire_excluding(&tried) {
                Some(s) => s,
                None => return Probe::Failed,
            };
            tried.push(server);
            let res = self.client.resolve(host, server, self.timeout).await;
            self.pool.report(server, !res.outcome.is_transient());
            match res.outcome {
                Outcome::Resolved => return Probe::Answered(res.ips),
                Outcome::NotFound => return Probe::Negative,
                Outcome::Error | Outcome::Timeout => {
                    debug!(host, %server, outcome = ?res.outcome, "wildcard probe failed");
                }
            }
        }
        Probe::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::ResolutionResult;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn set(ips: &[&str]) -> BTreeSet<IpAddr> {
        ips.iter().map(|s| s.parse().unwrap()).collect()
    }

    /// Answers probes from a fixed script, one entry per call.
    struct Scripted {
        answers: Mutex<Vec<Option<BTreeSet<IpAddr>>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(answers: Vec<Option<BTreeSet<IpAddr>>>) -> Self {
            Self { answers: Mutex::new(answers), calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl DnsClient for Scripted {
        async fn resolve(&self, hostname: &str, _server: SocketAddr, _timeout: Duration) -> ResolutionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut a = self.answers.lock().unwrap();
                if a.is_empty() { None } else { a.remove(0) }
            };
            match next {
                Some(ips) => ResolutionResult::resolved(hostname, ips, Duration::ZERO),
                None => ResolutionResult::not_found(hostname, Duration::ZERO),
            }
        }
    }

    /// Every lookup times out.
    struct Unreachable {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DnsClient for Unreachable {
        async fn resolve(&self, hostname: &str, _server: SocketAddr, _timeout: Duration) -> ResolutionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ResolutionResult::timeout(hostname, Duration::ZERO)
        }
    }

    fn pool() -> std::sync::Arc<ResolverPool> {
        ResolverPool::new(vec!["127.0.0.1:53".parse().unwrap()], 3)
    }

    #[test]
    fn subset_logic() {
        let wild = set(&["1.2.3.4"]);
        assert!(is_wildcard(&set(&["1.2.3.4"]), &wild));
        assert!(!is_wildcard(&set(&["5.6.7.8"]), &wild));
        assert!(!is_wildcard(&set(&["1.2.3.4", "5.6.7.8"]), &wild));
        assert!(!is_wildcard(&BTreeSet::new(), &wild));
        assert!(!is_wildcard(&set(&["1.2.3.4"]), &BTreeSet::new()));
    }

    #[test]
    fn labels_are_long_and_dns_safe() {
        let l = random_label(PROBE_LABEL_LEN);
        assert_eq!(l.len(), PROBE_LABEL_LEN);
        assert!(l.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        assert_eq!(random_label(3).len(), 10);
    }

    #[test]
    fn agreement_needs_a_shared_ip() {
        assert!(answers_agree(&[set(&["1.1.1.1"]), set(&["1.1.1.1", "2.2.2.2"])]));
        assert!(!answers_agree(&[set(&["1.1.1.1"]), set(&["2.2.2.2"])]));
        assert!(!answers_agree(&[set(&["1.1.1.1"])]));
    }

    #[tokio::test]
    async fn no_answers_means_no_wildcard() {
        let client = Scripted::new(vec![]);
        let pool = pool();
        let sig = WildcardDetector::new(&client, &pool, 3, Duration::from_secs(1)).detect("example.com").await;
        assert!(!sig.is_wildcard());
        assert!(!sig.uncertain);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn agreeing_probes_union_into_signature() {
        let client = Scripted::new(vec![
            Some(set(&["1.2.3.4"])),
            Some(set(&["1.2.3.4", "1.2.3.5"])),
            None,
        ]);
        let pool = pool();
        let sig = WildcardDetector::new(&client, &pool, 3, Duration::from_secs(1)).detect("example.com").await;
        assert_eq!(sig.ips, set(&["1.2.3.4", "1.2.3.5"]));
        assert!(!sig.uncertain);
    }

    #[tokio::test]
    async fn single_flaky_answer_retries_then_flags_uncertain() {
        let client = Scripted::new(vec![
            Some(set(&["6.6.6.6"])), None, None,
            None, Some(set(&["7.7.7.7"])), None,
        ]);
        let pool = pool();
        let sig = WildcardDetector::new(&client, &pool, 3, Duration::from_secs(1)).detect("example.com").await;
        assert!(sig.ips.is_empty());
        assert!(sig.uncertain);
        assert_eq!(client.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn retry_round_can_confirm_wildcard() {
        let client = Scripted::new(vec![
            Some(set(&["6.6.6.6"])), Some(set(&["7.7.7.7"])), None,
            Some(set(&["1.2.3.4"])), Some(set(&["1.2.3.4"])), Some(set(&["1.2.3.4"])),
        ]);
        let pool = pool();
        let sig = WildcardDetector::new(&client, &pool, 3, Duration::from_secs(1)).detect("example.com").await;
        assert_eq!(sig.ips, set(&["1.2.3.4"]));
        assert!(!sig.uncertain);
    }

    #[tokio::test]
    async fn unreachable_nameservers_flag_uncertain() {
        let client = Unreachable { calls: AtomicUsize::new(0) };
        let pool = ResolverPool::new(vec!["127.0.0.1:5301".parse().unwrap(), "127.0.0.1:5302".parse().unwrap()], 100);
        let sig = WildcardDetector::new(&client, &pool, 3, Duration::from_millis(10)).detect("example.com").await;
        assert!(sig.ips.is_empty());
        assert!(sig.uncertain);
        // two rounds of three probes, each retried once on the other server
        assert_eq!(client.calls.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn unprobeable_domain_flags_uncertain() {
        // any 12-char label pushes this past 253 characters
        let domain = ["a".repeat(60), "b".repeat(60), "c".repeat(60), "d".repeat(60)].join(".");
        assert!(is_valid_hostname(&domain));
        let client = Scripted::new(vec![]);
        let pool = pool();
        let sig = WildcardDetector::new(&client, &pool, 3, Duration::from_secs(1)).detect(&domain).await;
        assert!(sig.uncertain);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }
}
