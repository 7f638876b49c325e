use crate::error::Result;
use crate::options::{collect_targets, ScanConfig};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "subsweep - concurrent wordlist subdomain enumeration with wildcard filtering",
    after_help = "Examples:\n  subsweep example.com -f wordlists/small.txt -c 200\n  subsweep -d example.com -d example.org --domain-list targets.txt\n  subsweep example.com -r 1.1.1.1 -r 8.8.8.8:53 --retry 3 --timeout 2\n  subsweep example.com --deadline 300 -o out/results.csv --ips-output out/ips.txt --json out/findings.json"
)]
pub struct Cli {
    /// Target domains
    #[arg(value_name = "DOMAIN")]
    pub positional_domains: Vec<String>,

    /// Target domain (repeatable)
    #[arg(short = 'd', long = "domain")]
    pub domains: Vec<String>,

    /// File with one target domain per line
    #[arg(long = "domain-list", alias = "ds")]
    pub domain_list: Option<PathBuf>,

    /// Wordlist file (one label per line, `#` comments allowed). Defaults to the embedded list
    #[arg(short = 'f', long = "filename", alias = "wordlist")]
    pub filename: Option<PathBuf>,

    /// Nameserver, `IP` or `IP:port`, repeatable. Defaults to a built-in public list
    #[arg(short = 'r', long = "resolvers")]
    pub resolvers: Vec<String>,

    /// Concurrent workers
    #[arg(short = 'c', long = "concurrency", default_value_t = 100)]
    pub concurrency: usize,

    /// Per-query timeout (seconds)
    #[arg(long = "timeout", default_value_t = 3)]
    pub timeout: u64,

    /// Extra attempts on other nameservers after a timeout/SERVFAIL
    #[arg(long = "retry", default_value_t = 2)]
    pub retry: u32,

    /// Stop dispatching after this many seconds and export what was found
    #[arg(long = "deadline")]
    pub deadline: Option<u64>,

    /// Random labels probed per wildcard detection round
    #[arg(long = "wildcard-probes", default_value_t = 3)]
    pub wildcard_probes: usize,

    /// Consecutive failures before a nameserver is deprioritized
    #[arg(long = "failure-threshold", default_value_t = 3)]
    pub failure_threshold: u32,

    /// Abort after this many consecutive failed candidates (0 = never)
    #[arg(long = "abort-after", default_value_t = 1000)]
    pub abort_after: u64,

    /// Only query A records
    #[arg(long = "no-aaaa")]
    pub no_aaaa: bool,

    /// CSV output (hostname,ips)
    #[arg(short = 'o', long = "output", default_value = "output.csv")]
    pub output: PathBuf,

    /// Unique IP list output, one per line
    #[arg(long = "ips-output", default_value = "unique_ips.txt")]
    pub ips_output: PathBuf,

    /// Also dump findings as JSON
    #[arg(long = "json")]
    pub json: Option<PathBuf>,

    /// Write per-nameserver health counters as JSON after the scan
    #[arg(long = "resolver-stats-file")]
    pub resolver_stats_file: Option<PathBuf>,

    /// Disable the progress line
    #[arg(long = "no-progress")]
    pub no_progress: bool,

    /// Progress refresh interval (milliseconds)
    #[arg(long = "progress-interval", default_value_t = 1000)]
    pub progress_interval: u64,

    /// Print hostnames only
    #[arg(long = "silent")]
    pub silent: bool,

    /// Log level: error|warn|info|debug|trace|silent (RUST_LOG overrides)
    #[arg(long = "log-level", default_value = "info", value_parser = ["error", "warn", "info", "debug", "trace", "silent"])]
    pub log_level: String,
}

impl Cli {
    /// `-d` and positional domains first, then the domain list; normalized and deduplicated.
    pub fn targets(&self) -> Result<Vec<String>> {
        let inline: Vec<String> = self.domains.iter().chain(self.positional_domains.iter()).cloned().collect();
        collect_targets(&inline, self.domain_list.as_deref())
    }

    /// Settings shared by every target; the domain is filled in per target.
    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            domain: String::new(),
            wordlist_source: self.filename.clone(),
            concurrency: self.concurrency,
            query_timeout: Duration::from_secs(self.timeout.max(1)),
            retries: self.retry,
            nameservers: self.resolvers.clone(),
            overall_deadline: self.deadline.map(Duration::from_secs),
            wildcard_probes: self.wildcard_probes,
            failure_threshold: self.failure_threshold,
            abort_after_failures: self.abort_after,
            progress_interval: Duration::from_millis(self.progress_interval),
        }
    }

    /// `silent` maps to tracing's `off`.
    pub fn tracing_level(&self) -> &str {
        if self.log_level == "silent" {
            "off"
        } else {
            &self.log_level
        }
    }
}
