use crate::error::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Separator between addresses inside the `ips` column.
pub const IP_LIST_SEPARATOR: &str = "|";

/// A confirmed, non-wildcard subdomain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub hostname: String,
    pub ips: BTreeSet<IpAddr>,
}

impl Finding {
    pub fn new(hostname: impl Into<String>, ips: BTreeSet<IpAddr>) -> Self {
        Self { hostname: hostname.into(), ips }
    }

    pub fn ip_list(&self) -> String {
        self.ips.iter().map(IpAddr::to_string).collect::<Vec<_>>().join(IP_LIST_SEPARATOR)
    }
}

/// Deduplicating sink for findings. The first IP set accepted for a hostname wins.
#[derive(Debug, Default, Clone)]
pub struct Aggregator {
    findings: BTreeMap<String, BTreeSet<IpAddr>>,
    unique_ips: BTreeSet<IpAddr>,
    duplicates: u64,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the hostname was already present.
    pub fn accept(&mut self, finding: Finding) -> bool {
        if self.findings.contains_key(&finding.hostname) {
            self.duplicates += 1;
            debug!(host = %finding.hostname, "duplicate finding ignored");
            return false;
        }
        self.unique_ips.extend(finding.ips.iter().copied());
        self.findings.insert(finding.hostname, finding.ips);
        true
    }

    /// Folds another aggregate in under the same first-wins rule. Returns how
    /// many hostnames were new.
    pub fn merge(&mut self, other: Aggregator) -> usize {
        let mut added = 0;
        for (hostname, ips) in other.findings {
            if self.accept(Finding { hostname, ips }) {
                added += 1;
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.findings.contains_key(hostname)
    }

    /// Sorted by hostname.
    pub fn findings(&self) -> Vec<Finding> {
        self.findings.iter().map(|(h, ips)| Finding::new(h.clone(), ips.clone())).collect()
    }

    /// IPv4 before IPv6, numeric order within each family.
    pub fn unique_ips(&self) -> &BTreeSet<IpAddr> {
        &self.unique_ips
    }
}

pub fn write_csv<W: Write>(agg: &Aggregator, w: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(w);
    wtr.write_record(["hostname", "ips"])?;
    for (host, ips) in agg.findings.iter() {
        let list = ips.iter().map(IpAddr::to_string).collect::<Vec<_>>().join(IP_LIST_SEPARATOR);
        wtr.write_record([host.as_str(), list.as_str()])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_ip_list<W: Write>(agg: &Aggregator, mut w: W) -> Result<()> {
    for ip in agg.unique_ips.iter() {
        writeln!(w, "{}", ip)?;
    }
    w.flush()?;
    Ok(())
}

pub fn write_json<W: Write>(agg: &Aggregator, w: W) -> Result<()> {
    serde_json::to_writer_pretty(w, &agg.findings())?;
    Ok(())
}

/// Paths written after a scan, complete or not.
#[derive(Debug, Clone)]
pub struct Exporter {
    pub csv_path: PathBuf,
    pub ips_path: PathBuf,
    pub json_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub rows: usize,
    pub unique_ips: usize,
}

impl Exporter {
    pub fn new(csv_path: impl Into<PathBuf>, ips_path: impl Into<PathBuf>) -> Self {
        Self { csv_path: csv_path.into(), ips_path: ips_path.into(), json_path: None }
    }

    pub fn with_json(mut self, path: impl Into<PathBuf>) -> Self {
        self.json_path = Some(path.into());
        self
    }

    /// Overwrites every artifact; running it twice on the same aggregate gives
    /// byte-identical files.
    pub fn export(&self, agg: &Aggregator) -> Result<ExportSummary> {
        write_csv(agg, create(&self.csv_path)?)?;
        write_ip_list(agg, create(&self.ips_path)?)?;
        if let Some(p) = &self.json_path {
            write_json(agg, create(p)?)?;
        }
        info!(
            csv = %self.csv_path.display(),
            ips = %self.ips_path.display(),
            rows = agg.len(),
            unique_ips = agg.unique_ips.len(),
            "results exported"
        );
        Ok(ExportSummary { rows: agg.len(), unique_ips: agg.unique_ips.len() })
    }
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(BufWriter::new(File::create(path)?))
}
