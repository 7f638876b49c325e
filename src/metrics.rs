use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

/// Scan-lifetime counters. Written by workers with relaxed atomics, read by the
/// reporter; nothing on the query path takes a lock for these.
#[derive(Debug, Default)]
pub struct ScanState {
    /// Expected candidates: the raw wordlist size until the producer finishes,
    /// then the exact number queued.
    pub total: AtomicU64,
    pub queued: AtomicU64,
    pub in_flight: AtomicU64,
    pub completed: AtomicU64,
    pub succeeded: AtomicU64,
    pub filtered: AtomicU64,
    pub not_found: AtomicU64,
    pub failed: AtomicU64,
    pub retries: AtomicU64,
}

impl ScanState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, elapsed: Duration) -> ProgressSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let completed = load(&self.completed);
        let secs = elapsed.as_secs_f64();
        ProgressSnapshot {
            total: load(&self.total),
            queued: load(&self.queued),
            in_flight: load(&self.in_flight),
            completed,
            succeeded: load(&self.succeeded),
            filtered: load(&self.filtered),
            not_found: load(&self.not_found),
            failed: load(&self.failed),
            retries: load(&self.retries),
            elapsed_ms: elapsed.as_millis() as u64,
            rate: if secs > 0.0 { completed as f64 / secs } else { 0.0 },
            done: false,
        }
    }
}

/// Point-in-time copy of [`ScanState`] handed to progress consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub queued: u64,
    pub in_flight: u64,
    pub completed: u64,
    pub succeeded: u64,
    pub filtered: u64,
    pub not_found: u64,
    pub failed: u64,
    pub retries: u64,
    pub elapsed_ms: u64,
    /// completions per second since scan start
    pub rate: f64,
    /// Set on the final snapshot only.
    pub done: bool,
}

/// Emits a snapshot every `every` until `stop` flips, then one final snapshot
/// with `done = true`. A slow consumer misses ticks rather than stalling the scan.
pub fn spawn_reporter(
    state: Arc<ScanState>,
    start: Instant,
    every: Duration,
    tx: mpsc::Sender<ProgressSnapshot>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(every.max(Duration::from_millis(10)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let _ = tx.try_send(state.snapshot(start.elapsed()));
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        let mut last = state.snapshot(start.elapsed());
        last.done = true;
        let _ = tx.send(last).await;
    })
}
