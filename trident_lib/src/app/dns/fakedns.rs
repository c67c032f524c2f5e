use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::server::{DnsResult, NameServer};
use super::{fqdn, DnsError, IpOption};

/// The fake-IP engine: mints synthetic addresses in a reserved range so
/// real resolution can be deferred until a connection is made. The pool
/// itself lives outside this crate.
#[async_trait]
pub trait FakeDns: Send + Sync {
    async fn lookup(&self, domain: &str, option: IpOption) -> Vec<IpAddr>;
}

/// Name-server binding over a [`FakeDns`] engine. Only consulted when the
/// lookup opted into fake answers; synthetic mappings are served with TTL 1
/// so they are never believed for long.
pub struct FakeDnsServer {
    engine: Arc<dyn FakeDns>,
}

impl FakeDnsServer {
    pub fn new(engine: Arc<dyn FakeDns>) -> Arc<Self> {
        Arc::new(Self { engine })
    }
}

#[async_trait]
impl NameServer for FakeDnsServer {
    fn name(&self) -> &str {
        "fakedns"
    }

    async fn query_ip(self: Arc<Self>, domain: &str, option: IpOption) -> DnsResult {
        if !option.fake_enable {
            return Err(DnsError::EmptyResponse);
        }
        let ips = self.engine.lookup(&fqdn(domain), option).await;
        if ips.is_empty() {
            return Err(DnsError::EmptyResponse);
        }
        Ok((ips, 1))
    }
}
