use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use tokio::time::timeout;
use tracing::{debug, debug_span, Instrument};

use super::server::NameServer;
use super::{sysnet, DnsError, IpOption};

/// Default per-query deadline of a client wrapper.
pub(crate) const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_millis(4000);

/// Answer-address matcher; geo-backed implementations live outside this
/// crate and plug in through this trait.
pub trait IpMatcher: Send + Sync {
    fn matches(&self, ip: &IpAddr) -> bool;
    /// Stable identity used to group rule-equivalent clients for racing.
    fn key(&self) -> String;
}

pub struct CidrMatcher {
    net: IpNet,
}

impl CidrMatcher {
    pub fn new(net: IpNet) -> Arc<Self> {
        Arc::new(Self { net })
    }
}

impl IpMatcher for CidrMatcher {
    fn matches(&self, ip: &IpAddr) -> bool {
        self.net.contains(ip)
    }

    fn key(&self) -> String {
        self.net.to_string()
    }
}

pub struct ClientOpts {
    pub server: Arc<dyn NameServer>,
    /// Per-client family override, AND-masked onto the caller's option.
    pub ip_option: IpOption,
    /// Probe the host network before each query and mask dead families.
    pub probe_system: bool,
    pub expected: Vec<Arc<dyn IpMatcher>>,
    pub unexpected: Vec<Arc<dyn IpMatcher>>,
    /// Prioritize instead of filter for the expected set.
    pub act_prior: bool,
    /// Prioritize instead of filter for the unexpected set.
    pub act_unprior: bool,
    pub tag: String,
    pub timeout: Duration,
    pub final_query: bool,
    pub skip_fallback: bool,
    pub is_fake: bool,
}

/// Wraps one name server with the per-server policy: family override,
/// deadline, session tag, and the expected/unexpected answer filters.
pub struct Client {
    server: Arc<dyn NameServer>,
    ip_option: IpOption,
    probe_system: bool,
    expected: Vec<Arc<dyn IpMatcher>>,
    unexpected: Vec<Arc<dyn IpMatcher>>,
    act_prior: bool,
    act_unprior: bool,
    tag: String,
    timeout: Duration,
    final_query: bool,
    skip_fallback: bool,
    is_fake: bool,
    policy_id: String,
}

impl Client {
    pub fn new(opts: ClientOpts) -> Arc<Self> {
        let policy_id = {
            let mut expected: Vec<String> = opts.expected.iter().map(|m| m.key()).collect();
            let mut unexpected: Vec<String> = opts.unexpected.iter().map(|m| m.key()).collect();
            expected.sort();
            unexpected.sort();
            format!(
                "v4={}&v6={}&sys={}&prior={}&unprior={}&exp={}&unexp={}",
                opts.ip_option.ipv4,
                opts.ip_option.ipv6,
                opts.probe_system,
                opts.act_prior,
                opts.act_unprior,
                expected.join(","),
                unexpected.join(","),
            )
        };
        Arc::new(Self {
            server: opts.server,
            ip_option: opts.ip_option,
            probe_system: opts.probe_system,
            expected: opts.expected,
            unexpected: opts.unexpected,
            act_prior: opts.act_prior,
            act_unprior: opts.act_unprior,
            tag: opts.tag,
            timeout: opts.timeout,
            final_query: opts.final_query,
            skip_fallback: opts.skip_fallback,
            is_fake: opts.is_fake,
            policy_id,
        })
    }

    pub fn name(&self) -> &str {
        self.server.name()
    }

    pub fn final_query(&self) -> bool {
        self.final_query
    }

    pub fn skip_fallback(&self) -> bool {
        self.skip_fallback
    }

    pub fn is_fake_dns(&self) -> bool {
        self.is_fake
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Clients with equal ids are rule-equivalent and may race as a group.
    pub fn policy_id(&self) -> &str {
        &self.policy_id
    }

    pub async fn query_ip(
        &self,
        domain: &str,
        option: IpOption,
    ) -> Result<(Vec<IpAddr>, u32), DnsError> {
        let mut option = option;
        if self.probe_system {
            option = option.mask(sysnet::available_families());
        }
        option = option.mask(self.ip_option);
        if option.is_empty() {
            return Err(DnsError::EmptyResponse);
        }

        let span = debug_span!("dns_query", server = %self.server.name(), tag = %self.tag);
        let query = self.server.clone().query_ip(domain, option);
        let (ips, ttl) = match timeout(self.timeout, query.instrument(span)).await {
            Err(_) => {
                debug!(server = %self.server.name(), domain, "dns client timed out");
                return Err(DnsError::Timeout);
            }
            Ok(result) => result?,
        };
        if ips.is_empty() {
            return Err(DnsError::EmptyResponse);
        }

        let ips = self.apply_filters(ips)?;
        Ok((ips, ttl))
    }

    /// Fixed application order: filter-expected, filter-unexpected,
    /// prioritize-expected, prioritize-unexpected.
    fn apply_filters(&self, mut ips: Vec<IpAddr>) -> Result<Vec<IpAddr>, DnsError> {
        if !self.expected.is_empty() && !self.act_prior {
            ips.retain(|ip| self.expected.iter().any(|m| m.matches(ip)));
            if ips.is_empty() {
                return Err(DnsError::EmptyResponse);
            }
        }

        if !self.unexpected.is_empty() && !self.act_unprior {
            ips.retain(|ip| !self.unexpected.iter().any(|m| m.matches(ip)));
            if ips.is_empty() {
                return Err(DnsError::EmptyResponse);
            }
        }

        if !self.expected.is_empty() && self.act_prior {
            let matched: Vec<IpAddr> = ips
                .iter()
                .copied()
                .filter(|ip| self.expected.iter().any(|m| m.matches(ip)))
                .collect();
            if !matched.is_empty() {
                ips = matched;
            }
        }

        if !self.unexpected.is_empty() && self.act_unprior {
            let (mut keep, demoted): (Vec<IpAddr>, Vec<IpAddr>) = ips
                .into_iter()
                .partition(|ip| !self.unexpected.iter().any(|m| m.matches(ip)));
            keep.extend(demoted);
            ips = keep;
        }

        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::super::server::DnsResult;
    use super::*;

    struct FixedServer {
        ips: Vec<IpAddr>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FixedServer {
        fn new(ips: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                ips: ips.iter().map(|s| s.parse().unwrap()).collect(),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl NameServer for FixedServer {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn query_ip(self: Arc<Self>, _domain: &str, option: IpOption) -> DnsResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let ips = self
                .ips
                .iter()
                .copied()
                .filter(|ip| match ip {
                    IpAddr::V4(_) => option.ipv4,
                    IpAddr::V6(_) => option.ipv6,
                })
                .collect();
            Ok((ips, 60))
        }
    }

    fn base_opts(server: Arc<FixedServer>) -> ClientOpts {
        ClientOpts {
            server,
            ip_option: IpOption::both(),
            probe_system: false,
            expected: vec![],
            unexpected: vec![],
            act_prior: false,
            act_unprior: false,
            tag: "test-in".to_string(),
            timeout: DEFAULT_CLIENT_TIMEOUT,
            final_query: false,
            skip_fallback: false,
            is_fake: false,
        }
    }

    fn cidr(s: &str) -> Arc<dyn IpMatcher> {
        CidrMatcher::new(s.parse().unwrap())
    }

    #[tokio::test]
    async fn test_disabled_families_short_circuit() {
        let server = FixedServer::new(&["8.8.8.8"]);
        let mut opts = base_opts(server.clone());
        opts.ip_option = IpOption {
            ipv4: false,
            ipv6: true,
            fake_enable: false,
        };
        let client = Client::new(opts);

        let err = client
            .query_ip(
                "example.com",
                IpOption {
                    ipv4: true,
                    ipv6: false,
                    fake_enable: false,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, DnsError::EmptyResponse);
        assert_eq!(
            server.calls.load(Ordering::SeqCst),
            0,
            "no dispatch when every family is masked off"
        );
    }

    #[tokio::test]
    async fn test_expected_filter_keeps_matching() {
        let server = FixedServer::new(&["8.8.8.8", "8.8.4.4"]);
        let mut opts = base_opts(server);
        opts.expected = vec![cidr("8.8.8.8/32")];
        let client = Client::new(opts);

        let (ips, _) = client.query_ip("example.com", IpOption::both()).await.unwrap();
        assert_eq!(ips, vec!["8.8.8.8".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_expected_filter_empty_result_is_error() {
        let server = FixedServer::new(&["1.1.1.1"]);
        let mut opts = base_opts(server);
        opts.expected = vec![cidr("8.8.8.0/24")];
        let client = Client::new(opts);

        let err = client
            .query_ip("example.com", IpOption::both())
            .await
            .unwrap_err();
        assert_eq!(err, DnsError::EmptyResponse);
    }

    #[tokio::test]
    async fn test_unexpected_filter_drops_matching() {
        let server = FixedServer::new(&["10.0.0.1", "8.8.8.8"]);
        let mut opts = base_opts(server);
        opts.unexpected = vec![cidr("10.0.0.0/8")];
        let client = Client::new(opts);

        let (ips, _) = client.query_ip("example.com", IpOption::both()).await.unwrap();
        assert_eq!(ips, vec!["8.8.8.8".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_prioritize_expected_reorders_or_keeps() {
        let server = FixedServer::new(&["1.1.1.1", "8.8.8.8"]);
        let mut opts = base_opts(server);
        opts.expected = vec![cidr("8.8.8.0/24")];
        opts.act_prior = true;
        let client = Client::new(opts);

        let (ips, _) = client.query_ip("example.com", IpOption::both()).await.unwrap();
        assert_eq!(
            ips,
            vec!["8.8.8.8".parse::<IpAddr>().unwrap()],
            "matched subset replaces the answer"
        );

        let server = FixedServer::new(&["1.1.1.1", "9.9.9.9"]);
        let mut opts = base_opts(server);
        opts.expected = vec![cidr("8.8.8.0/24")];
        opts.act_prior = true;
        let client = Client::new(opts);

        let (ips, _) = client.query_ip("example.com", IpOption::both()).await.unwrap();
        assert_eq!(ips.len(), 2, "no match keeps the original answer");
    }

    #[tokio::test]
    async fn test_prioritize_unexpected_moves_matching_back() {
        let server = FixedServer::new(&["10.0.0.1", "8.8.8.8", "10.0.0.2"]);
        let mut opts = base_opts(server);
        opts.unexpected = vec![cidr("10.0.0.0/8")];
        opts.act_unprior = true;
        let client = Client::new(opts);

        let (ips, _) = client.query_ip("example.com", IpOption::both()).await.unwrap();
        let expect: Vec<IpAddr> = ["8.8.8.8", "10.0.0.1", "10.0.0.2"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(ips, expect);
    }

    #[tokio::test]
    async fn test_filter_runs_before_prioritize() {
        // expected filters to the 8.8.8.0/24 pair, then unexpected
        // prioritizing demotes 8.8.8.8 behind 8.8.4.4
        let server = FixedServer::new(&["1.1.1.1", "8.8.8.8", "8.8.4.4"]);
        let mut opts = base_opts(server);
        opts.expected = vec![cidr("8.8.0.0/16")];
        opts.unexpected = vec![cidr("8.8.8.8/32")];
        opts.act_unprior = true;
        let client = Client::new(opts);

        let (ips, _) = client.query_ip("example.com", IpOption::both()).await.unwrap();
        let expect: Vec<IpAddr> = ["8.8.4.4", "8.8.8.8"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(ips, expect);
    }

    #[tokio::test]
    async fn test_client_timeout() {
        let server = Arc::new(FixedServer {
            ips: vec!["8.8.8.8".parse().unwrap()],
            delay: Duration::from_secs(5),
            calls: AtomicUsize::new(0),
        });
        let mut opts = base_opts(server);
        opts.timeout = Duration::from_millis(50);
        let client = Client::new(opts);

        let err = client
            .query_ip("example.com", IpOption::both())
            .await
            .unwrap_err();
        assert_eq!(err, DnsError::Timeout);
    }

    #[tokio::test]
    async fn test_policy_id_groups_rule_equivalent_clients() {
        let a = Client::new(ClientOpts {
            expected: vec![cidr("8.8.8.0/24"), cidr("1.1.1.0/24")],
            ..base_opts(FixedServer::new(&["8.8.8.8"]))
        });
        let b = Client::new(ClientOpts {
            expected: vec![cidr("1.1.1.0/24"), cidr("8.8.8.0/24")],
            ..base_opts(FixedServer::new(&["9.9.9.9"]))
        });
        let c = Client::new(ClientOpts {
            act_prior: true,
            ..base_opts(FixedServer::new(&["9.9.9.9"]))
        });

        assert_eq!(a.policy_id(), b.policy_id(), "matcher order is irrelevant");
        assert_ne!(a.policy_id(), c.policy_id());
    }
}
