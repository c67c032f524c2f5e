use std::net::IpAddr;

use serde::Deserialize;

/// Address-family strategy: both families, one of them, or whatever the
/// host network currently supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryStrategy {
    #[default]
    UseIp,
    UseIp4,
    UseIp6,
    UseSys,
}

/// A name server entry: either a bare address string or the full option
/// block.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NameServerConfig {
    Address(String),
    Options(NameServerOptions),
}

impl NameServerConfig {
    pub fn options(&self) -> NameServerOptions {
        match self {
            NameServerConfig::Address(address) => NameServerOptions {
                address: address.clone(),
                ..Default::default()
            },
            NameServerConfig::Options(options) => options.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct NameServerOptions {
    /// Scheme-tagged address, e.g. `udp://1.1.1.1`, `https://dns.google/dns-query`,
    /// `quic+local://94.140.14.14`, `localhost`, `fakedns`.
    pub address: String,
    /// Inbound tag recorded on this client's query spans.
    pub tag: String,
    pub timeout_ms: u64,
    /// Leave this client out of the default fallback round.
    pub skip_fallback: bool,
    /// Stop the fallback iteration after this client.
    pub final_query: bool,
    /// Prioritize instead of filter for `expected-ips`.
    pub act_prior: bool,
    /// Prioritize instead of filter for `unexpected-ips`.
    pub act_unprior: bool,
    pub expected_ips: Vec<String>,
    pub unexpected_ips: Vec<String>,
    /// Domain rules routing lookups to this client ahead of the fallback
    /// order.
    pub domains: Vec<String>,
    pub query_strategy: Option<QueryStrategy>,
    pub client_ip: Option<IpAddr>,
    pub disable_cache: bool,
}

impl Default for NameServerOptions {
    fn default() -> Self {
        Self {
            address: String::new(),
            tag: String::new(),
            timeout_ms: 4000,
            skip_fallback: false,
            final_query: false,
            act_prior: false,
            act_unprior: false,
            expected_ips: Vec::new(),
            unexpected_ips: Vec::new(),
            domains: Vec::new(),
            query_strategy: None,
            client_ip: None,
            disable_cache: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HostMappingConfig {
    /// Domain pattern; bare patterns match the full name, `domain:` /
    /// `keyword:` / `regexp:` prefixes widen the match.
    pub pattern: String,
    /// IPs, a single replacement domain, or a single `#rcode` sentinel.
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DnsConfig {
    pub servers: Vec<NameServerConfig>,
    pub hosts: Vec<HostMappingConfig>,
    pub query_strategy: QueryStrategy,
    /// EDNS0 client-subnet hint attached to upstream queries.
    pub client_ip: Option<IpAddr>,
    pub disable_cache: bool,
    pub serve_stale: bool,
    /// Seconds a stale entry may still be served past expiry; 0 is
    /// unbounded.
    pub serve_expired_ttl: u32,
    pub disable_fallback: bool,
    pub disable_fallback_if_match: bool,
    /// Race the sorted clients in policy groups instead of walking them
    /// serially.
    pub parallel_query: bool,
}
