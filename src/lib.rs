//! Wordlist-driven subdomain enumeration over raw UDP DNS.
//!
//! The pipeline is candidate generation ([`dicts`]), wildcard detection
//! ([`wildcard`]), bounded concurrent resolution ([`scanner`]) against a
//! health-tracked nameserver rotation ([`resolver_pool`]), and deduplicated
//! export ([`output`]).

pub mod cli;
pub mod dicts;
pub mod dns;
pub mod error;
pub mod metrics;
pub mod options;
pub mod output;
pub mod resolver_pool;
pub mod scanner;
pub mod wildcard;

pub use dicts::{Candidate, CandidateGenerator};
pub use dns::{DnsClient, Outcome, ResolutionResult, UdpClient};
pub use error::{Result, ScanError};
pub use metrics::{ProgressSnapshot, ScanState};
pub use options::ScanConfig;
pub use output::{Aggregator, Exporter, Finding};
pub use resolver_pool::ResolverPool;
pub use scanner::{scan_targets, CancelHandle, ScanReport, ScanSummary, Scanner, StopReason, TargetsReport};
pub use wildcard::WildcardSignature;
