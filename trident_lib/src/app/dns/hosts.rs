use std::net::IpAddr;

use super::{DnsError, IpOption};
use crate::common::matcher::{DomainRule, MatcherGroup, RuleKind};
use crate::Error;

/// Replacement chains stop unwrapping past this depth.
const MAX_REPLACEMENT_DEPTH: usize = 5;

/// One answer slot of a static mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAddress {
    Ip(IpAddr),
    Domain(String),
}

#[derive(Debug, Clone)]
enum Mapping {
    Ips(Vec<IpAddr>),
    Replace(String),
    /// `#0` is a synthetic NOERROR-with-no-data; `#n` carries the rcode.
    RCode(u16),
}

/// Domain-matcher-backed replacement table consulted before any upstream
/// dispatch. Mappings answer with addresses, chain to another domain, or
/// encode a synthetic response code.
pub struct StaticHosts {
    matchers: MatcherGroup,
    mappings: Vec<Mapping>,
}

impl StaticHosts {
    /// `entries` pair a domain pattern (bare patterns match the full name)
    /// with its address list: IPs, a single replacement domain, or a
    /// single `#n` sentinel.
    pub fn new(entries: &[(String, Vec<String>)]) -> Result<Self, Error> {
        let mut rules = Vec::with_capacity(entries.len());
        let mut mappings = Vec::with_capacity(entries.len());
        for (pattern, addresses) in entries {
            rules.push(DomainRule::parse(pattern, RuleKind::Full)?);
            mappings.push(parse_mapping(pattern, addresses)?);
        }
        Ok(Self {
            matchers: MatcherGroup::new(rules),
            mappings,
        })
    }

    /// `Ok(None)` when the domain is not recorded; sentinel mappings come
    /// back as errors; otherwise the family-filtered IPs or the singleton
    /// replacement domain.
    pub fn lookup(
        &self,
        domain: &str,
        option: IpOption,
    ) -> Result<Option<Vec<HostAddress>>, DnsError> {
        self.lookup_inner(domain, option, 0)
    }

    fn lookup_inner(
        &self,
        domain: &str,
        option: IpOption,
        depth: usize,
    ) -> Result<Option<Vec<HostAddress>>, DnsError> {
        let Some(&index) = self.matchers.matched(domain).first() else {
            return Ok(None);
        };
        match &self.mappings[index] {
            Mapping::RCode(0) => Err(DnsError::EmptyResponse),
            Mapping::RCode(n) => Err(DnsError::RCode(*n)),
            Mapping::Replace(target) => {
                if depth < MAX_REPLACEMENT_DEPTH {
                    if let Some(resolved) = self.lookup_inner(target, option, depth + 1)? {
                        return Ok(Some(resolved));
                    }
                }
                Ok(Some(vec![HostAddress::Domain(target.clone())]))
            }
            Mapping::Ips(ips) => {
                let filtered: Vec<HostAddress> = ips
                    .iter()
                    .filter(|ip| match ip {
                        IpAddr::V4(_) => option.ipv4,
                        IpAddr::V6(_) => option.ipv6,
                    })
                    .map(|ip| HostAddress::Ip(*ip))
                    .collect();
                if filtered.is_empty() {
                    // nothing usable for these families; defer to upstream
                    return Ok(None);
                }
                Ok(Some(filtered))
            }
        }
    }
}

fn parse_mapping(pattern: &str, addresses: &[String]) -> Result<Mapping, Error> {
    if addresses.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "host mapping {} has no addresses",
            pattern
        )));
    }

    if let Some(code) = addresses[0].strip_prefix('#') {
        if addresses.len() > 1 {
            return Err(Error::InvalidConfig(format!(
                "host mapping {} mixes a response code with other addresses",
                pattern
            )));
        }
        let code: u16 = code.parse().map_err(|_| {
            Error::InvalidConfig(format!("bad response code in host mapping {}", pattern))
        })?;
        return Ok(Mapping::RCode(code));
    }

    let mut ips = Vec::with_capacity(addresses.len());
    for address in addresses {
        match address.parse::<IpAddr>() {
            Ok(ip) => ips.push(ip),
            Err(_) => {
                if addresses.len() > 1 {
                    return Err(Error::InvalidConfig(format!(
                        "host mapping {} mixes a replacement domain with other addresses",
                        pattern
                    )));
                }
                return Ok(Mapping::Replace(address.to_ascii_lowercase()));
            }
        }
    }
    Ok(Mapping::Ips(ips))
}
