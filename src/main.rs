use anyhow::Result;
use clap::Parser;
use std::io::{stderr, Write};
use subsweep::cli::Cli;
use std::sync::Arc;
use subsweep::dicts::{load_words, CandidateGenerator};
use subsweep::metrics::ProgressSnapshot;
use subsweep::output::Exporter;
use subsweep::scanner::{scan_targets, CancelHandle, ScanReport, StopReason};
use subsweep::{ScanError, UdpClient};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.tracing_level());

    let targets = cli.targets()?;
    let base = cli.scan_config();
    let words = load_words(base.wordlist_source.as_deref())?;
    if words.is_empty() {
        return Err(ScanError::EmptyWordlist.into());
    }
    let words = CandidateGenerator::new(words, &targets[0]);
    info!(targets = targets.len(), words = words.upper_bound(), "wordlist loaded");

    let cancel = CancelHandle::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, letting in-flight queries finish");
            on_interrupt.cancel();
        }
    });

    let (progress_tx, renderer) = if cli.no_progress || cli.silent {
        (None, None)
    } else {
        let (tx, rx) = mpsc::channel(16);
        (Some(tx), Some(tokio::spawn(render_progress(rx))))
    };

    let client = Arc::new(UdpClient::new(!cli.no_aaaa));
    let report = scan_targets(&base, &targets, &words, client, &cancel, progress_tx).await?;
    if let Some(r) = renderer {
        let _ = r.await;
    }

    let mut exporter = Exporter::new(&cli.output, &cli.ips_output);
    if let Some(p) = &cli.json {
        exporter = exporter.with_json(p);
    }
    let exported = exporter.export(&report.findings)?;

    for f in report.findings.findings() {
        if cli.silent {
            println!("{}", f.hostname);
        } else {
            println!("{} {}", f.hostname, f.ip_list());
        }
    }

    if let Some(path) = &cli.resolver_stats_file {
        std::fs::write(path, serde_json::to_vec_pretty(&report.resolvers)?)?;
    }

    if !cli.silent {
        for scan in &report.scans {
            print_summary(scan);
        }
        if report.scans.len() < targets.len() {
            eprintln!("skipped {} target(s) after stop", targets.len() - report.scans.len());
        }
        eprintln!("exported {} rows, {} unique IPs", exported.rows, exported.unique_ips);
    }

    if let Some(e) = report.fatal_error() {
        return Err(e.into());
    }
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn render_progress(mut rx: mpsc::Receiver<ProgressSnapshot>) {
    let mut err = stderr();
    while let Some(s) = rx.recv().await {
        let total = s.total;
        let percent = if total > 0 { (s.completed as f64 / total as f64) * 100.0 } else { 0.0 };
        let _ = write!(
            err,
            "\r[stat] {:>5.1}% | total={} fin={} inflight={} ok={} filt={} nx={} fail={} retry={} rate/s={:.0}",
            percent, total, s.completed, s.in_flight, s.succeeded, s.filtered, s.not_found, s.failed, s.retries, s.rate
        );
        if s.done {
            let _ = writeln!(err);
        }
        let _ = err.flush();
    }
}

fn print_summary(report: &ScanReport) {
    let s = &report.summary;
    let stop = match report.stop {
        StopReason::Completed => "completed",
        StopReason::Cancelled => "cancelled (partial results)",
        StopReason::Deadline => "deadline reached (partial results)",
        StopReason::Aborted => "aborted (partial results)",
    };
    eprintln!(
        "{} {}: found={} filtered-as-wildcard={} not-found={} failed={} retries={} in {:.1}s",
        report.domain,
        stop,
        s.found,
        s.filtered,
        s.not_found,
        s.failed,
        s.retries,
        s.elapsed.as_secs_f64()
    );
    if report.wildcard.is_wildcard() {
        let ips: Vec<String> = report.wildcard.ips.iter().map(|ip| ip.to_string()).collect();
        eprintln!("wildcard signature: {}", ips.join(", "));
    }
    if report.wildcard.uncertain {
        eprintln!("warning: wildcard detection uncertain, results may contain catch-all answers");
    }
}
