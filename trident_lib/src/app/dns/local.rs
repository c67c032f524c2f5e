use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::rr::{RData, RecordType};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;

use super::server::{DnsResult, NameServer};
use super::{fqdn, merge_query_errors, DnsError, IpOption, DEFAULT_TTL};
use crate::Error;

/// The operating system's resolver, reached through its configuration.
/// Carries no trident-side cache; the OS stack caches on its own.
pub struct LocalNameServer {
    resolver: TokioAsyncResolver,
}

impl LocalNameServer {
    pub fn new() -> Result<Arc<Self>, Error> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| Error::DNSError(format!("system resolver unavailable: {}", e)))?;
        Ok(Arc::new(Self { resolver }))
    }

    async fn lookup_family(&self, fqdn: &str, rtype: RecordType) -> Result<(Vec<IpAddr>, u32), DnsError> {
        match self.resolver.lookup(fqdn, rtype).await {
            Ok(lookup) => {
                let ttl = lookup
                    .valid_until()
                    .saturating_duration_since(std::time::Instant::now())
                    .as_secs() as u32;
                let ips: Vec<IpAddr> = lookup
                    .iter()
                    .filter_map(|data| match data {
                        RData::A(a) => Some(IpAddr::V4(**a)),
                        RData::AAAA(aaaa) => Some(IpAddr::V6(**aaaa)),
                        _ => None,
                    })
                    .collect();
                if ips.is_empty() {
                    return Err(DnsError::EmptyResponse);
                }
                Ok((ips, ttl.min(DEFAULT_TTL).max(1)))
            }
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Err(DnsError::EmptyResponse),
                _ => Err(DnsError::Transport(e.to_string())),
            },
        }
    }
}

#[async_trait]
impl NameServer for LocalNameServer {
    fn name(&self) -> &str {
        "localhost"
    }

    async fn query_ip(self: Arc<Self>, domain: &str, option: IpOption) -> DnsResult {
        let fqdn = fqdn(domain);
        if fqdn.is_empty() {
            return Err(DnsError::InvalidDomain(domain.to_string()));
        }

        let v4 = async {
            if option.ipv4 {
                Some(self.lookup_family(&fqdn, RecordType::A).await)
            } else {
                None
            }
        };
        let v6 = async {
            if option.ipv6 {
                Some(self.lookup_family(&fqdn, RecordType::AAAA).await)
            } else {
                None
            }
        };
        let (r4, r6) = futures::join!(v4, v6);

        let mut ips = Vec::new();
        let mut ttl = DEFAULT_TTL;
        let mut errs = Vec::new();
        for side in [r4, r6].into_iter().flatten() {
            match side {
                Ok((side_ips, side_ttl)) => {
                    ips.extend(side_ips);
                    ttl = ttl.min(side_ttl);
                }
                Err(e) => errs.push(e),
            }
        }

        if ips.is_empty() {
            return Err(merge_query_errors(errs));
        }
        Ok((ips, ttl))
    }
}
