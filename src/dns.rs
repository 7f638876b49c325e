//! Single-query DNS client.
//!
//! Every lookup is one A query (plus an AAAA follow-up when A succeeds) sent over
//! UDP to an explicit nameserver. The answer is folded into a [`ResolutionResult`]
//! whose [`Outcome`] separates authoritative negatives from retryable failures.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::trace;
use trust_dns_proto::error::ProtoResult;
use trust_dns_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use trust_dns_proto::rr::{Name, RData, RecordType};
use trust_dns_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};

pub const MAX_HOSTNAME_LEN: usize = 253;
pub const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// At least one A/AAAA record came back.
    Resolved,
    /// NXDOMAIN, or a NOERROR answer without terminal address records.
    NotFound,
    /// SERVFAIL, REFUSED, socket or decode failure. Retryable.
    Error,
    Timeout,
}

impl Outcome {
    pub fn is_transient(self) -> bool {
        matches!(self, Outcome::Error | Outcome::Timeout)
    }
}

#[derive(Debug, Clone)]
pub struct ResolutionResult {
    pub candidate: String,
    pub ips: BTreeSet<IpAddr>,
    pub outcome: Outcome,
    pub latency: Duration,
    /// Short reason for `Error` outcomes, e.g. the rcode.
    pub detail: Option<String>,
}

impl ResolutionResult {
    pub fn resolved(candidate: impl Into<String>, ips: BTreeSet<IpAddr>, latency: Duration) -> Self {
        let outcome = if ips.is_empty() { Outcome::NotFound } else { Outcome::Resolved };
        Self { candidate: candidate.into(), ips, outcome, latency, detail: None }
    }

    pub fn not_found(candidate: impl Into<String>, latency: Duration) -> Self {
        Self { candidate: candidate.into(), ips: BTreeSet::new(), outcome: Outcome::NotFound, latency, detail: None }
    }

    pub fn error(candidate: impl Into<String>, detail: impl Into<String>, latency: Duration) -> Self {
        Self {
            candidate: candidate.into(),
            ips: BTreeSet::new(),
            outcome: Outcome::Error,
            latency,
            detail: Some(detail.into()),
        }
    }

    pub fn timeout(candidate: impl Into<String>, latency: Duration) -> Self {
        Self { candidate: candidate.into(), ips: BTreeSet::new(), outcome: Outcome::Timeout, latency, detail: None }
    }
}

/// The seam between the scheduler and the network.
#[async_trait]
pub trait DnsClient: Send + Sync {
    async fn resolve(&self, hostname: &str, server: SocketAddr, timeout: Duration) -> ResolutionResult;
}

/// Checks overall length and per-label length/charset. Underscores are allowed
/// since they show up in real zones (`_dmarc`, `_domainkey`).
pub fn is_valid_hostname(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

pub fn build_query(domain: &str, qtype: RecordType) -> ProtoResult<(u16, Vec<u8>)> {
    let id = rand::random::<u16>();
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let name = Name::from_utf8(domain)?;
    msg.add_query(Query::query(name, qtype));
    let mut buf: Vec<u8> = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut buf);
    msg.emit(&mut encoder)?;
    Ok((id, buf))
}

/// Pulls A/AAAA data out of the answer section. CNAMEs are skipped: a chain that
/// does not end in an address contributes nothing.
pub fn answer_addresses(msg: &Message) -> BTreeSet<IpAddr> {
    msg.answers()
        .iter()
        .filter_map(|rec| match rec.data() {
            Some(RData::A(ip)) => Some(IpAddr::V4(*ip)),
            Some(RData::AAAA(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        })
        .collect()
}

enum Exchange {
    Answer { rcode: ResponseCode, ips: BTreeSet<IpAddr> },
    Timeout,
    Failed(String),
}

/// Raw UDP client. Stateless: every query binds its own ephemeral socket.
#[derive(Debug, Clone, Default)]
pub struct UdpClient {
    /// Also ask for AAAA records once the A query came back NOERROR.
    pub query_aaaa: bool,
}

impl UdpClient {
    pub fn new(query_aaaa: bool) -> Self {
        Self { query_aaaa }
    }

    async fn exchange(&self, host: &str, server: SocketAddr, qtype: RecordType, timeout: Duration) -> Exchange {
        let (id, packet) = match build_query(host, qtype) {
            Ok(q) => q,
            Err(e) => return Exchange::Failed(format!("build query: {}", e)),
        };
        let bind: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let sock = match UdpSocket::bind(bind).await {
            Ok(s) => s,
            Err(e) => return Exchange::Failed(format!("bind: {}", e)),
        };
        if let Err(e) = sock.send_to(&packet, server).await {
            return Exchange::Failed(format!("send: {}", e));
        }
        match tokio::time::timeout(timeout, read_reply(&sock, server, id)).await {
            Err(_) => Exchange::Timeout,
            Ok(Err(e)) => Exchange::Failed(e.to_string()),
            Ok(Ok(msg)) => Exchange::Answer { rcode: msg.response_code(), ips: answer_addresses(&msg) },
        }
    }
}

async fn read_reply(sock: &UdpSocket, server: SocketAddr, id: u16) -> io::Result<Message> {
    let mut buf = [0u8; 4096];
    loop {
        let (n, from) = sock.recv_from(&mut buf).await?;
        if from != server {
            continue;
        }
        let msg = Message::from_bytes(&buf[..n]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        // late reply to someone else's id on a reused port
        if msg.id() != id {
            continue;
        }
        return Ok(msg);
    }
}

#[async_trait]
impl DnsClient for UdpClient {
    async fn resolve(&self, hostname: &str, server: SocketAddr, timeout: Duration) -> ResolutionResult {
        let start = Instant::now();
        if !is_valid_hostname(hostname) {
            return ResolutionResult::error(hostname, "invalid hostname", start.elapsed());
        }

        let mut ips = match self.exchange(hostname, server, RecordType::A, timeout).await {
            Exchange::Timeout => return ResolutionResult::timeout(hostname, start.elapsed()),
            Exchange::Failed(e) => return ResolutionResult::error(hostname, e, start.elapsed()),
            Exchange::Answer { rcode: ResponseCode::NXDomain, .. } => {
                return ResolutionResult::not_found(hostname, start.elapsed())
            }
            Exchange::Answer { rcode: ResponseCode::NoError, ips } => ips,
            Exchange::Answer { rcode, .. } => {
                return ResolutionResult::error(hostname, format!("{:?}", rcode), start.elapsed())
            }
        };

        if self.query_aaaa {
            let remaining = timeout.saturating_sub(start.elapsed());
            if !remaining.is_zero() {
                match self.exchange(hostname, server, RecordType::AAAA, remaining).await {
                    Exchange::Answer { rcode: ResponseCode::NoError, ips: v6 } => ips.extend(v6),
                    // with no A records we cannot call this a negative yet
                    Exchange::Timeout if ips.is_empty() => {
                        return ResolutionResult::timeout(hostname, start.elapsed())
                    }
                    Exchange::Failed(e) if ips.is_empty() => {
                        return ResolutionResult::error(hostname, e, start.elapsed())
                    }
                    other => {
                        if let Exchange::Answer { rcode, .. } = other {
                            trace!(host = hostname, ?rcode, "AAAA follow-up ignored");
                        }
                    }
                }
            }
        }

        ResolutionResult::resolved(hostname, ips, start.elapsed())
    }
}
