use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct NameserverEntry {
    addr: SocketAddr,
    ok: u64,
    fail: u64,
    consecutive_failures: u32,
    healthy: bool,
}

impl NameserverEntry {
    fn new(addr: SocketAddr) -> Self {
        Self { addr, ok: 0, fail: 0, consecutive_failures: 0, healthy: true }
    }
}

struct PoolInner {
    entries: Vec<NameserverEntry>,
    cursor: usize,
}

/// Round-robin nameserver rotation with consecutive-failure health tracking.
///
/// Unhealthy servers are skipped but kept; when every server is unhealthy the
/// whole table is reset instead of locking the scan out.
pub struct ResolverPool {
    inner: Mutex<PoolInner>,
    failure_threshold: u32,
    resets: AtomicU64,
}

impl ResolverPool {
    pub fn new(list: Vec<SocketAddr>, failure_threshold: u32) -> Arc<Self> {
        let entries = list.into_iter().map(NameserverEntry::new).collect();
        Arc::new(Self {
            inner: Mutex::new(PoolInner { entries, cursor: 0 }),
            failure_threshold: failure_threshold.max(1),
            resets: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Next healthy nameserver in rotation. `None` only for an empty pool.
    pub fn acquire(&self) -> Option<SocketAddr> {
        self.acquire_excluding(&[])
    }

    /// Like [`acquire`](Self::acquire) but avoids servers already tried for the
    /// current candidate. Falls back to any healthy server when all were tried.
    pub fn acquire_excluding(&self, tried: &[SocketAddr]) -> Option<SocketAddr> {
        let mut inner = self.lock();
        let n = inner.entries.len();
        if n == 0 {
            return None;
        }
        if inner.entries.iter().all(|e| !e.healthy) {
            for e in inner.entries.iter_mut() {
                e.healthy = true;
                e.consecutive_failures = 0;
            }
            self.resets.fetch_add(1, Ordering::Relaxed);
            warn!(nameservers = n, "all nameservers unhealthy, resetting health table");
        }

        let start = inner.cursor;
        let mut fallback = None;
        for step in 0..n {
            let idx = (start + step) % n;
            let e = &inner.entries[idx];
            if !e.healthy {
                continue;
            }
            if !tried.contains(&e.addr) {
                inner.cursor = (idx + 1) % n;
                return Some(inner.entries[idx].addr);
            }
            if fallback.is_none() {
                fallback = Some(idx);
            }
        }
        fallback.map(|idx| {
            inner.cursor = (idx + 1) % n;
            inner.entries[idx].addr
        })
    }

    pub fn report(&self, addr: SocketAddr, success: bool) {
        let mut inner = self.lock();
        let threshold = self.failure_threshold;
        if let Some(e) = inner.entries.iter_mut().find(|e| e.addr == addr) {
            if success {
                e.ok += 1;
                e.consecutive_failures = 0;
                if !e.healthy {
                    info!(%addr, "nameserver recovered");
                    e.healthy = true;
                }
            } else {
                e.fail += 1;
                e.consecutive_failures += 1;
                if e.healthy && e.consecutive_failures >= threshold {
                    e.healthy = false;
                    warn!(%addr, failures = e.consecutive_failures, "nameserver marked unhealthy");
                }
            }
        }
    }

    pub fn report_ok(&self, addr: SocketAddr) {
        self.report(addr, true)
    }

    pub fn report_fail(&self, addr: SocketAddr) {
        self.report(addr, false)
    }

    /// (healthy, total)
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.lock();
        let healthy = inner.entries.iter().filter(|e| e.healthy).count();
        (healthy, inner.entries.len())
    }

    /// How many times the table was reset because everything was unhealthy.
    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<ResolverStat> {
        self.lock()
            .entries
            .iter()
            .map(|e| ResolverStat {
                addr: e.addr.to_string(),
                ok: e.ok,
                fail: e.fail,
                consecutive_failures: e.consecutive_failures,
                healthy: e.healthy,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolverStat {
    pub addr: String,
    pub ok: u64,
    pub fail: u64,
    pub consecutive_failures: u32,
    pub healthy: bool,
}
