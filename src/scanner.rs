//! Scan scheduler.
//!
//! A producer task pulls candidates lazily from the generator into a bounded
//! queue of `concurrency` slots; `concurrency` workers share the receiving end.
//! Each worker resolves one candidate at a time, retrying transient failures on
//! other nameservers, and pushes accepted findings to a single collector task
//! that owns the [`Aggregator`]. Memory stays proportional to `concurrency`,
//! not to the wordlist.

use crate::dicts::{Candidate, CandidateGenerator};
use crate::dns::{DnsClient, Outcome, ResolutionResult};
use crate::error::{Result, ScanError};
use crate::metrics::{spawn_reporter, ProgressSnapshot, ScanState};
use crate::options::ScanConfig;
use crate::output::{Aggregator, ExportSummary, Exporter, Finding};
use crate::resolver_pool::{ResolverPool, ResolverStat};
use crate::wildcard::{WildcardDetector, WildcardSignature};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

/// Cloneable handle that stops a running scan. In-flight queries finish; no new
/// candidates are dispatched. One handle can be shared by several scanners.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    Cancelled,
    Deadline,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanSummary {
    pub found: u64,
    pub filtered: u64,
    pub not_found: u64,
    pub failed: u64,
    pub retries: u64,
    pub completed: u64,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct ScanReport {
    pub domain: String,
    pub findings: Aggregator,
    pub wildcard: WildcardSignature,
    pub summary: ScanSummary,
    pub stop: StopReason,
    pub abort_reason: Option<String>,
    pub resolvers: Vec<ResolverStat>,
}

impl ScanReport {
    /// `Some` when the scan gave up on its own, e.g. every nameserver kept failing.
    pub fn fatal_error(&self) -> Option<ScanError> {
        self.abort_reason.clone().map(ScanError::Fatal)
    }
}

pub struct Scanner<C: DnsClient + 'static> {
    config: ScanConfig,
    client: Arc<C>,
    pool: Arc<ResolverPool>,
    cancel: Arc<watch::Sender<bool>>,
}

impl<C: DnsClient + 'static> Scanner<C> {
    /// Validates `config`; nothing touches the network until [`run`](Self::run).
    pub fn new(config: ScanConfig, client: C) -> Result<Self> {
        Self::with_client(config, Arc::new(client))
    }

    pub fn with_client(mut config: ScanConfig, client: Arc<C>) -> Result<Self> {
        config.validate()?;
        let nameservers = config.resolved_nameservers()?;
        let pool = ResolverPool::new(nameservers, config.failure_threshold);
        Ok(Self { config, client, pool, cancel: CancelHandle::new().tx })
    }

    /// Stops this scanner through `handle`.
    pub fn with_cancel(mut self, handle: &CancelHandle) -> Self {
        self.cancel = handle.tx.clone();
        self
    }

    /// Shares nameserver health with other scanners.
    pub fn with_pool(mut self, pool: Arc<ResolverPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { tx: self.cancel.clone() }
    }

    pub async fn detect_wildcard(&self) -> WildcardSignature {
        WildcardDetector::new(
            self.client.as_ref(),
            &self.pool,
            self.config.wildcard_probes,
            self.config.query_timeout,
        )
        .detect(&self.config.domain)
        .await
    }

    /// Detects the wildcard signature once, then resolves every candidate.
    pub async fn run(
        &self,
        candidates: CandidateGenerator,
        progress: Option<mpsc::Sender<ProgressSnapshot>>,
    ) -> ScanReport {
        let signature = self.detect_wildcard().await;
        self.run_with_signature(candidates, signature, progress).await
    }

    /// [`run`](Self::run) followed by an export of whatever was collected, even
    /// after cancellation or an abort. Only an export failure is an `Err`; check
    /// [`ScanReport::fatal_error`] for aborted scans.
    pub async fn run_and_export(
        &self,
        candidates: CandidateGenerator,
        exporter: &Exporter,
        progress: Option<mpsc::Sender<ProgressSnapshot>>,
    ) -> Result<(ScanReport, ExportSummary)> {
        let report = self.run(candidates, progress).await;
        let exported = exporter.export(&report.findings)?;
        Ok((report, exported))
    }

    #[instrument(name = "scan", level = "info", skip_all, fields(domain = %self.config.domain))]
    pub async fn run_with_signature(
        &self,
        candidates: CandidateGenerator,
        signature: WildcardSignature,
        progress: Option<mpsc::Sender<ProgressSnapshot>>,
    ) -> ScanReport {
        let start = Instant::now();
        let concurrency = self.config.concurrency;
        let state = ScanState::new();
        state.total.store(candidates.upper_bound() as u64, Ordering::Relaxed);
        let signature = Arc::new(signature);
        info!(
            concurrency,
            retries = self.config.retries,
            wildcard = signature.is_wildcard(),
            "starting resolution"
        );

        let (done_tx, done_rx) = watch::channel(false);
        let reporter = progress.map(|tx| {
            spawn_reporter(state.clone(), start, self.config.progress_interval, tx, done_rx.clone())
        });

        let deadline_hit = Arc::new(AtomicBool::new(false));
        let deadline_task = self.config.overall_deadline.map(|limit| {
            let cancel = self.cancel.clone();
            let hit = deadline_hit.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                hit.store(true, Ordering::Relaxed);
                warn!(?limit, "scan deadline reached, stopping dispatch");
                cancel.send_replace(true);
            })
        });

        let (cand_tx, cand_rx) = mpsc::channel::<Candidate>(concurrency);
        let producer = spawn_producer(candidates, cand_tx, state.clone(), self.cancel.subscribe());

        let (find_tx, mut find_rx) = mpsc::unbounded_channel::<Finding>();
        let collector = tokio::spawn(async move {
            let mut agg = Aggregator::new();
            while let Some(f) = find_rx.recv().await {
                debug!(host = %f.hostname, ips = ?f.ips, "finding accepted");
                agg.accept(f);
            }
            agg
        });

        let shared = Arc::new(WorkerShared {
            client: self.client.clone(),
            pool: self.pool.clone(),
            state: state.clone(),
            signature: signature.clone(),
            queue: Mutex::new(cand_rx),
            findings: find_tx,
            cancel: self.cancel.clone(),
            timeout: self.config.query_timeout,
            retries: self.config.retries,
            abort_after: self.config.abort_after_failures,
            failure_streak: AtomicU64::new(0),
            abort_reason: StdMutex::new(None),
        });

        let workers: Vec<JoinHandle<()>> = (0..concurrency)
            .map(|_| {
                let shared = shared.clone();
                tokio::spawn(async move { shared.work().await })
            })
            .collect();
        for res in futures::future::join_all(workers).await {
            if let Err(e) = res {
                error!("worker join error: {}", e);
            }
        }
        if let Err(e) = producer.await {
            error!("producer join error: {}", e);
        }

        let abort_reason = shared.abort_reason.lock().unwrap_or_else(|e| e.into_inner()).clone();
        // last sender lives in `shared`; dropping it lets the collector finish
        drop(shared);
        let findings = match collector.await {
            Ok(agg) => agg,
            Err(e) => {
                error!("collector join error: {}", e);
                Aggregator::new()
            }
        };

        if let Some(t) = deadline_task {
            t.abort();
        }
        done_tx.send_replace(true);
        if let Some(r) = reporter {
            let _ = r.await;
        }

        let stop = if abort_reason.is_some() {
            StopReason::Aborted
        } else if deadline_hit.load(Ordering::Relaxed) {
            StopReason::Deadline
        } else if *self.cancel.borrow() {
            StopReason::Cancelled
        } else {
            StopReason::Completed
        };

        let snap = state.snapshot(start.elapsed());
        let summary = ScanSummary {
            found: snap.succeeded,
            filtered: snap.filtered,
            not_found: snap.not_found,
            failed: snap.failed,
            retries: snap.retries,
            completed: snap.completed,
            elapsed: start.elapsed(),
        };
        info!(
            found = summary.found,
            filtered = summary.filtered,
            not_found = summary.not_found,
            failed = summary.failed,
            ?stop,
            "scan finished"
        );

        ScanReport {
            domain: self.config.domain.clone(),
            findings,
            wildcard: (*signature).clone(),
            summary,
            stop,
            abort_reason,
            resolvers: self.pool.snapshot(),
        }
    }
}

/// Findings of a multi-target run, merged across every target scanned.
#[derive(Debug)]
pub struct TargetsReport {
    pub findings: Aggregator,
    /// One report per target actually scanned, in order.
    pub scans: Vec<ScanReport>,
    pub resolvers: Vec<ResolverStat>,
}

impl TargetsReport {
    pub fn fatal_error(&self) -> Option<ScanError> {
        self.scans.iter().find_map(ScanReport::fatal_error)
    }
}

/// Scans each target in turn with its own wildcard signature and merges the
/// findings. Every target is validated before the first query goes out. The
/// nameserver pool and `cancel` are shared; remaining targets are skipped once
/// the scan is cancelled or aborts.
pub async fn scan_targets<C: DnsClient + 'static>(
    base: &ScanConfig,
    targets: &[String],
    words: &CandidateGenerator,
    client: Arc<C>,
    cancel: &CancelHandle,
    progress: Option<mpsc::Sender<ProgressSnapshot>>,
) -> Result<TargetsReport> {
    let mut scanners = Vec::with_capacity(targets.len());
    let mut pool: Option<Arc<ResolverPool>> = None;
    for domain in targets {
        let config = ScanConfig { domain: domain.clone(), ..base.clone() };
        let mut scanner = Scanner::with_client(config, client.clone())?.with_cancel(cancel);
        match &pool {
            Some(p) => scanner = scanner.with_pool(p.clone()),
            None => pool = Some(scanner.pool.clone()),
        }
        scanners.push(scanner);
    }

    let mut findings = Aggregator::new();
    let mut scans = Vec::with_capacity(scanners.len());
    for scanner in scanners {
        if cancel.is_cancelled() {
            info!(domain = %scanner.config.domain, "skipping remaining targets");
            break;
        }
        let candidates = words.with_domain(&scanner.config.domain);
        let report = scanner.run(candidates, progress.clone()).await;
        let added = findings.merge(report.findings.clone());
        debug!(domain = %report.domain, added, "target merged");
        scans.push(report);
    }

    let resolvers = pool.map(|p| p.snapshot()).unwrap_or_default();
    Ok(TargetsReport { findings, scans, resolvers })
}

fn spawn_producer(
    candidates: CandidateGenerator,
    tx: mpsc::Sender<Candidate>,
    state: Arc<ScanState>,
    mut cancel: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for c in candidates.iter() {
            if *cancel.borrow() {
                return;
            }
            tokio::select! {
                biased;
                _ = cancel.changed() => return,
                sent = tx.send(c) => {
                    if sent.is_err() {
                        return;
                    }
                    ScanState::incr(&state.queued);
                }
            }
        }
        let queued = state.queued.load(Ordering::Relaxed);
        state.total.store(queued, Ordering::Relaxed);
    })
}

enum Disposition {
    Found(Finding),
    Filtered,
    NotFound,
    Failed,
}

struct WorkerShared<C: DnsClient + 'static> {
    client: Arc<C>,
    pool: Arc<ResolverPool>,
    state: Arc<ScanState>,
    signature: Arc<WildcardSignature>,
    queue: Mutex<mpsc::Receiver<Candidate>>,
    findings: mpsc::UnboundedSender<Finding>,
    cancel: Arc<watch::Sender<bool>>,
    timeout: Duration,
    retries: u32,
    abort_after: u64,
    failure_streak: AtomicU64,
    abort_reason: StdMutex<Option<String>>,
}

impl<C: DnsClient + 'static> WorkerShared<C> {
    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn work(&self) {
        loop {
            if self.cancelled() {
                break;
            }
            let next = self.queue.lock().await.recv().await;
            let candidate = match next {
                Some(c) => c,
                None => break,
            };
            ScanState::incr(&self.state.in_flight);
            let disposition = self.process(&candidate).await;
            self.record(candidate, disposition);
        }
    }

    async fn process(&self, candidate: &Candidate) -> Disposition {
        let last = match self.resolve_with_retries(candidate).await {
            Some(res) => res,
            None => return Disposition::Failed,
        };
        match last.outcome {
            Outcome::Resolved if self.signature.filters(&last.ips) => {
                trace!(host = %candidate, "matches wildcard signature");
                Disposition::Filtered
            }
            Outcome::Resolved => Disposition::Found(Finding::new(candidate.as_str(), last.ips)),
            Outcome::NotFound => Disposition::NotFound,
            Outcome::Error | Outcome::Timeout => {
                debug!(host = %candidate, outcome = ?last.outcome, detail = ?last.detail, "giving up");
                Disposition::Failed
            }
        }
    }

    /// First attempt plus up to `retries` more, each on a nameserver not yet
    /// tried for this candidate when one is available. Stops early on any
    /// definitive answer or on cancellation.
    async fn resolve_with_retries(&self, candidate: &Candidate) -> Option<ResolutionResult> {
        let mut tried: Vec<SocketAddr> = Vec::with_capacity(self.retries as usize + 1);
        let mut last = None;
        for attempt in 0..=self.retries {
            if attempt > 0 {
                if self.cancelled() {
                    break;
                }
                ScanState::incr(&self.state.retries);
            }
            let server = self.pool.acquire_excluding(&tried)?;
            tried.push(server);
            let res = self.client.resolve(candidate.as_str(), server, self.timeout).await;
            let transient = res.outcome.is_transient();
            self.pool.report(server, !transient);
            if !transient {
                return Some(res);
            }
            trace!(host = %candidate, %server, attempt, outcome = ?res.outcome, "transient failure");
            last = Some(res);
        }
        last
    }

    fn record(&self, candidate: Candidate, disposition: Disposition) {
        let st = &self.state;
        let failed = matches!(disposition, Disposition::Failed);
        match disposition {
            Disposition::Found(f) => {
                if self.findings.send(f).is_err() {
                    error!(host = %candidate, "finding collector gone");
                }
                ScanState::incr(&st.succeeded);
            }
            Disposition::Filtered => ScanState::incr(&st.filtered),
            Disposition::NotFound => ScanState::incr(&st.not_found),
            Disposition::Failed => ScanState::incr(&st.failed),
        }
        ScanState::decr(&st.in_flight);
        ScanState::incr(&st.completed);

        if !failed {
            self.failure_streak.store(0, Ordering::Relaxed);
            return;
        }
        let streak = self.failure_streak.fetch_add(1, Ordering::Relaxed) + 1;
        if self.abort_after > 0 && streak >= self.abort_after {
            let mut reason = self.abort_reason.lock().unwrap_or_else(|e| e.into_inner());
            if reason.is_none() {
                let (healthy, total) = self.pool.counts();
                let msg = format!(
                    "{} consecutive candidates failed to resolve ({}/{} nameservers healthy, {} pool resets)",
                    streak,
                    healthy,
                    total,
                    self.pool.resets()
                );
                error!("{}", msg);
                *reason = Some(msg);
                self.cancel.send_replace(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{BTreeSet, HashMap};
    use std::net::IpAddr;

    fn ips(list: &[&str]) -> BTreeSet<IpAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    /// Fixed answers per hostname; anything unknown is NXDOMAIN.
    struct Zone {
        records: HashMap<String, BTreeSet<IpAddr>>,
        flaky: HashMap<String, AtomicU64>,
        asked: StdMutex<Vec<SocketAddr>>,
    }

    impl Zone {
        fn new(records: HashMap<String, BTreeSet<IpAddr>>, flaky: HashMap<String, AtomicU64>) -> Self {
            Self { records, flaky, asked: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl DnsClient for Zone {
        async fn resolve(&self, hostname: &str, server: SocketAddr, _timeout: Duration) -> ResolutionResult {
            self.asked.lock().unwrap().push(server);
            if let Some(left) = self.flaky.get(hostname) {
                let before = left.load(Ordering::SeqCst);
                if before > 0 {
                    left.store(before - 1, Ordering::SeqCst);
                    return ResolutionResult::timeout(hostname, Duration::ZERO);
                }
            }
            match self.records.get(hostname) {
                Some(set) => ResolutionResult::resolved(hostname, set.clone(), Duration::ZERO),
                None => ResolutionResult::not_found(hostname, Duration::ZERO),
            }
        }
    }

    fn config() -> ScanConfig {
        ScanConfig {
            concurrency: 4,
            nameservers: vec!["127.0.0.1:5301".into(), "127.0.0.1:5302".into()],
            progress_interval: Duration::from_millis(10),
            ..ScanConfig::new("example.com")
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_on_other_servers() {
        let zone = Zone::new(
            HashMap::from([("www.example.com".to_string(), ips(&["93.184.216.34"]))]),
            HashMap::from([("www.example.com".to_string(), AtomicU64::new(2))]),
        );
        let zone = Arc::new(zone);
        let scanner = Scanner::with_client(config(), zone.clone()).unwrap();
        let gen = CandidateGenerator::new(["www"], "example.com");
        let report = scanner.run_with_signature(gen, WildcardSignature::default(), None).await;
        assert_eq!(report.summary.found, 1);
        assert_eq!(report.summary.retries, 2);
        assert_eq!(report.summary.failed, 0);
        assert_eq!(report.stop, StopReason::Completed);

        let asked = zone.asked.lock().unwrap().clone();
        assert_eq!(asked.len(), 3);
        assert_ne!(asked[0], asked[1], "first retry must go to the other nameserver");
        let stats = report.resolvers;
        assert_eq!(stats.iter().map(|s| s.fail).sum::<u64>(), 2);
        assert!(stats.iter().all(|s| s.fail == 1), "each server failed once before the answer");
    }

    #[tokio::test]
    async fn exhausted_retries_count_as_failed_not_fatal() {
        let zone = Zone::new(
            HashMap::from([("www.example.com".to_string(), ips(&["93.184.216.34"]))]),
            HashMap::from([("api.example.com".to_string(), AtomicU64::new(100))]),
        );
        let scanner = Scanner::new(config(), zone).unwrap();
        let gen = CandidateGenerator::new(["api", "www"], "example.com");
        let report = scanner.run_with_signature(gen, WildcardSignature::default(), None).await;
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.found, 1);
        assert_eq!(report.summary.completed, 2);
        assert_eq!(report.summary.retries, 2);
        assert!(report.fatal_error().is_none());
    }

    #[tokio::test]
    async fn failure_streak_aborts_with_partial_results() {
        let mut flaky = HashMap::new();
        for w in ["a", "b", "c", "d", "e", "f"] {
            flaky.insert(format!("{}.example.com", w), AtomicU64::new(100));
        }
        let zone = Zone::new(
            HashMap::from([("www.example.com".to_string(), ips(&["93.184.216.34"]))]),
            flaky,
        );
        let cfg = ScanConfig { concurrency: 1, retries: 0, abort_after_failures: 3, ..config() };
        let scanner = Scanner::new(cfg, zone).unwrap();
        let gen = CandidateGenerator::new(["www", "a", "b", "c", "d", "e", "f"], "example.com");
        let report = scanner.run_with_signature(gen, WildcardSignature::default(), None).await;
        assert_eq!(report.stop, StopReason::Aborted);
        assert!(matches!(report.fatal_error(), Some(ScanError::Fatal(_))));
        assert!(report.findings.contains("www.example.com"));
        assert_eq!(report.summary.failed, 3);
    }

    #[tokio::test]
    async fn progress_stream_ends_with_accurate_totals() {
        let zone = Zone::new(
            HashMap::from([("www.example.com".to_string(), ips(&["93.184.216.34"]))]),
            HashMap::new(),
        );
        let scanner = Scanner::new(config(), zone).unwrap();
        let gen = CandidateGenerator::new(["www", "mail", "ftp"], "example.com");
        let (tx, mut rx) = mpsc::channel(64);
        let report = scanner.run_with_signature(gen, WildcardSignature::default(), Some(tx)).await;
        let mut last = None;
        while let Some(s) = rx.recv().await {
            last = Some(s);
        }
        let last = last.unwrap();
        assert!(last.done);
        assert_eq!(last.completed, 3);
        assert_eq!(last.queued, 3);
        assert_eq!(last.total, 3);
        assert_eq!(last.in_flight, 0);
        assert_eq!(last.succeeded, 1);
        assert_eq!(last.not_found, 2);
        assert_eq!(report.summary.completed, 3);
    }

    #[tokio::test]
    async fn cancelled_before_start_dispatches_nothing() {
        let zone = Zone::new(HashMap::new(), HashMap::new());
        let scanner = Scanner::new(config(), zone).unwrap();
        scanner.cancel_handle().cancel();
        let gen = CandidateGenerator::new(["www", "mail"], "example.com");
        let report = scanner.run_with_signature(gen, WildcardSignature::default(), None).await;
        assert_eq!(report.summary.completed, 0);
        assert_eq!(report.stop, StopReason::Cancelled);
    }

    #[test]
    fn invalid_config_fails_fast() {
        let zone = Zone::new(HashMap::new(), HashMap::new());
        let cfg = ScanConfig { concurrency: 0, ..config() };
        assert!(matches!(Scanner::new(cfg, zone), Err(ScanError::ZeroConcurrency)));
    }
}
