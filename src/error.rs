use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("target domain is empty")]
    EmptyDomain,

    #[error("invalid target domain: {0}")]
    InvalidDomain(String),

    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("invalid nameserver address: {0}")]
    InvalidNameserver(String),

    #[error("no nameservers configured")]
    NoNameservers,

    #[error("wildcard detection needs at least 2 probes, got {0}")]
    InvalidProbeCount(usize),

    #[error("cannot read wordlist {path}: {source}")]
    Wordlist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read domain list {path}: {source}")]
    DomainList {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no target domains given")]
    NoTargets,

    #[error("wordlist produced no usable candidates")]
    EmptyWordlist,

    #[error("export failed: {0}")]
    Export(String),

    #[error("scan aborted: {0}")]
    Fatal(String),
}

impl From<csv::Error> for ScanError {
    fn from(e: csv::Error) -> Self {
        ScanError::Export(e.to_string())
    }
}

impl From<std::io::Error> for ScanError {
    fn from(e: std::io::Error) -> Self {
        ScanError::Export(e.to_string())
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(e: serde_json::Error) -> Self {
        ScanError::Export(e.to_string())
    }
}
