use hickory_proto::rr::RecordType;
use thiserror::Error;

mod cache;
mod client;
mod config;
mod doh;
mod doq;
mod fakedns;
mod hosts;
mod local;
mod msg;
mod pubsub;
mod record;
mod resolver;
mod server;
mod sysnet;
mod tcp;
mod udp;

pub use cache::CacheController;
pub use client::{Client, CidrMatcher, IpMatcher};
pub use config::{
    DnsConfig, HostMappingConfig, NameServerConfig, NameServerOptions, QueryStrategy,
};
pub use fakedns::FakeDns;
pub use hosts::{HostAddress, StaticHosts};
pub use record::{IpRecord, Record};
pub use resolver::Resolver;
pub use server::{new_name_server, DnsResult, NameServer, Transport};

/// TTL attributed to answers whose records carry none of their own, and the
/// ceiling the merge step starts from.
pub const DEFAULT_TTL: u32 = 300;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("empty response")]
    EmptyResponse,
    /// Internal sentinel: the cache holds nothing for this key. Never
    /// surfaces past the dispatcher.
    #[error("record not found")]
    RecordNotFound,
    #[error("server returned code {0}")]
    RCode(u16),
    #[error("invalid domain: {0}")]
    InvalidDomain(String),
    #[error("query timed out")]
    Timeout,
    #[error("{0}")]
    Transport(String),
    #[error("all queries failed: [{}]", join_errors(.0))]
    Aggregate(Vec<DnsError>),
}

impl From<std::io::Error> for DnsError {
    fn from(e: std::io::Error) -> Self {
        DnsError::Transport(e.to_string())
    }
}

impl From<hickory_proto::error::ProtoError> for DnsError {
    fn from(e: hickory_proto::error::ProtoError) -> Self {
        DnsError::Transport(e.to_string())
    }
}

fn join_errors(errs: &[DnsError]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Collapses the per-client failures of one lookup into a single error.
/// Equal errors fold into one instance; `RecordNotFound` is internal
/// bookkeeping and is dropped before combining.
pub(crate) fn merge_query_errors(errs: Vec<DnsError>) -> DnsError {
    let mut errs: Vec<DnsError> = errs
        .into_iter()
        .filter(|e| !matches!(e, DnsError::RecordNotFound))
        .collect();
    match errs.len() {
        0 => DnsError::EmptyResponse,
        1 => errs.remove(0),
        _ if errs.iter().all(|e| *e == errs[0]) => errs.remove(0),
        _ => DnsError::Aggregate(errs),
    }
}

/// Which address families a lookup wants, plus whether synthetic fake-IP
/// answers are acceptable for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpOption {
    pub ipv4: bool,
    pub ipv6: bool,
    pub fake_enable: bool,
}

impl IpOption {
    pub fn both() -> Self {
        Self {
            ipv4: true,
            ipv6: true,
            fake_enable: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.ipv4 && !self.ipv6
    }

    /// AND-masks the address families; the fake-IP bit follows the caller.
    pub fn mask(self, other: IpOption) -> IpOption {
        IpOption {
            ipv4: self.ipv4 && other.ipv4,
            ipv6: self.ipv6 && other.ipv6,
            fake_enable: self.fake_enable,
        }
    }

    /// The per-family key suffix used by the cache pub/sub and the
    /// single-flight group.
    pub fn family_suffix(&self) -> &'static str {
        match (self.ipv4, self.ipv6) {
            (true, true) => "46",
            (true, false) => "4",
            _ => "6",
        }
    }

    pub fn record_types(&self) -> Vec<RecordType> {
        let mut types = Vec::with_capacity(2);
        if self.ipv4 {
            types.push(RecordType::A);
        }
        if self.ipv6 {
            types.push(RecordType::AAAA);
        }
        types
    }
}

/// Strips trailing dots and lowercases; cache and matcher keys all use
/// this form.
pub(crate) fn fqdn(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

pub(crate) fn family_suffix_of(rt: RecordType) -> &'static str {
    match rt {
        RecordType::AAAA => "6",
        _ => "4",
    }
}
