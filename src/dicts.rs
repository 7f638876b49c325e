//! Wordlists and the candidate generator built on top of them.

use crate::dns::is_valid_hostname;
use crate::error::{Result, ScanError};
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Embedded subdomain wordlist from wordlists/subdomain.txt
const EMBEDDED_SUBDOMAIN_TXT: &str = include_str!("../wordlists/subdomain.txt");

/// Return the embedded wordlist as owned Strings (one per line).
pub fn default_wordlist() -> Vec<String> {
    EMBEDDED_SUBDOMAIN_TXT
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
        .collect()
}

/// Reads a wordlist file, skipping blank lines and `#` comments.
pub fn read_wordlist(path: &Path) -> Result<Vec<String>> {
    read_lines(path).map_err(|source| ScanError::Wordlist { path: path.to_path_buf(), source })
}

/// Reads target domains, one per line, with the same comment rules as wordlists.
pub fn read_domain_list(path: &Path) -> Result<Vec<String>> {
    read_lines(path).map_err(|source| ScanError::DomainList { path: path.to_path_buf(), source })
}

fn read_lines(path: &Path) -> io::Result<Vec<String>> {
    let f = File::open(path)?;
    let mut out = Vec::new();
    for line in BufReader::new(f).lines() {
        let line = line?;
        let s = line.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        out.push(s.to_string());
    }
    Ok(out)
}

pub fn load_words(source: Option<&Path>) -> Result<Vec<String>> {
    match source {
        Some(p) => read_wordlist(p),
        None => Ok(default_wordlist()),
    }
}

/// A hostname waiting to be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Candidate(String);

impl Candidate {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces `{word}.{domain}` for every distinct word, in wordlist order.
///
/// Cheap to clone; each call to [`iter`](Self::iter) starts over from the top.
#[derive(Debug, Clone)]
pub struct CandidateGenerator {
    words: Arc<[String]>,
    domain: Arc<str>,
}

impl CandidateGenerator {
    pub fn new<I, S>(words: I, domain: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words: Vec<String> = words.into_iter().map(Into::into).collect();
        Self { words: words.into(), domain: Arc::from(domain) }
    }

    /// Same words against another target; the word list itself is shared.
    pub fn with_domain(&self, domain: &str) -> Self {
        Self { words: self.words.clone(), domain: Arc::from(domain) }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Raw wordlist length, before blank/duplicate filtering.
    pub fn upper_bound(&self) -> usize {
        self.words.len()
    }

    pub fn iter(&self) -> Candidates {
        Candidates {
            words: self.words.clone(),
            domain: self.domain.clone(),
            pos: 0,
            seen: HashSet::new(),
        }
    }
}

impl IntoIterator for &CandidateGenerator {
    type Item = Candidate;
    type IntoIter = Candidates;

    fn into_iter(self) -> Candidates {
        self.iter()
    }
}

/// Lazy pass over a [`CandidateGenerator`]. Owns its state so it can be moved
/// into a producer task.
pub struct Candidates {
    words: Arc<[String]>,
    domain: Arc<str>,
    pos: usize,
    seen: HashSet<String>,
}

impl Iterator for Candidates {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        while let Some(raw) = self.words.get(self.pos) {
            self.pos += 1;
            let word = raw.trim().trim_end_matches('.');
            if word.is_empty() {
                continue;
            }
            if !self.seen.insert(word.to_ascii_lowercase()) {
                continue;
            }
            let host = format!("{}.{}", word, self.domain);
            if !is_valid_hostname(&host) {
                trace!(word, "skipping word that does not form a valid hostname");
                continue;
            }
            return Some(Candidate(host));
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.words.len().saturating_sub(self.pos)))
    }
}
