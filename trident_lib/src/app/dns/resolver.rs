use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, instrument};

use super::cache::CacheController;
use super::client::{CidrMatcher, Client, ClientOpts, IpMatcher};
use super::config::{DnsConfig, QueryStrategy};
use super::fakedns::FakeDns;
use super::hosts::{HostAddress, StaticHosts};
use super::server::new_name_server;
use super::{fqdn, merge_query_errors, sysnet, DnsError, IpOption};
use crate::common::matcher::{DomainRule, MatcherGroup, RuleKind};
use crate::Error;

/// TTL reported for answers taken from the static hosts table.
const STATIC_HOSTS_TTL: u32 = 10;

/// The multi-client dispatcher: orders the configured clients per domain,
/// runs them serially or as grouped races, and hands back the first usable
/// answer.
pub struct Resolver {
    clients: Vec<Arc<Client>>,
    matcher: MatcherGroup,
    /// Rule index (the matcher's) to owning client index.
    match_info: Vec<usize>,
    disable_fallback: bool,
    disable_fallback_if_match: bool,
    strategy: QueryStrategy,
    parallel: bool,
    hosts: Option<StaticHosts>,
}

impl Resolver {
    pub fn new(config: &DnsConfig, fake: Option<Arc<dyn FakeDns>>) -> Result<Self, Error> {
        if config.servers.is_empty() {
            return Err(Error::InvalidConfig("no dns servers configured".into()));
        }

        let mut clients = Vec::with_capacity(config.servers.len());
        let mut rules = Vec::new();
        let mut match_info = Vec::new();

        for (index, server) in config.servers.iter().enumerate() {
            let opts = server.options();
            if opts.address.is_empty() {
                return Err(Error::InvalidConfig("name server with empty address".into()));
            }

            let cache = CacheController::new(
                opts.address.clone(),
                config.disable_cache || opts.disable_cache,
                config.serve_stale,
                config.serve_expired_ttl,
            );
            let client_ip = opts.client_ip.or(config.client_ip);
            let server = new_name_server(&opts.address, client_ip, cache, fake.clone())?;

            for rule in &opts.domains {
                rules.push(DomainRule::parse(rule, RuleKind::Suffix)?);
                match_info.push(index);
            }

            let (ip_option, probe_system) =
                strategy_families(opts.query_strategy.unwrap_or(QueryStrategy::UseIp));
            clients.push(Client::new(ClientOpts {
                is_fake: opts.address == "fakedns",
                server,
                ip_option,
                probe_system,
                expected: parse_matchers(&opts.expected_ips)?,
                unexpected: parse_matchers(&opts.unexpected_ips)?,
                act_prior: opts.act_prior,
                act_unprior: opts.act_unprior,
                tag: opts.tag.clone(),
                timeout: Duration::from_millis(opts.timeout_ms),
                final_query: opts.final_query,
                skip_fallback: opts.skip_fallback,
            }));
        }

        let hosts = if config.hosts.is_empty() {
            None
        } else {
            let entries: Vec<(String, Vec<String>)> = config
                .hosts
                .iter()
                .map(|h| (h.pattern.clone(), h.addresses.clone()))
                .collect();
            Some(StaticHosts::new(&entries)?)
        };

        Ok(Self {
            clients,
            matcher: MatcherGroup::new(rules),
            match_info,
            disable_fallback: config.disable_fallback,
            disable_fallback_if_match: config.disable_fallback_if_match,
            strategy: config.query_strategy,
            parallel: config.parallel_query,
            hosts,
        })
    }

    /// Resolves `domain` to the addresses the caller's option and the
    /// configured policies allow. Guaranteed to return at least one
    /// address when `Ok`.
    #[instrument(level = "debug", skip(self))]
    pub async fn lookup_ip(
        &self,
        domain: &str,
        option: IpOption,
    ) -> Result<(Vec<IpAddr>, u32), DnsError> {
        if domain.is_empty() {
            return Err(DnsError::InvalidDomain("empty domain".into()));
        }
        let mut name = fqdn(domain);
        if name.is_empty() {
            return Err(DnsError::InvalidDomain(domain.to_string()));
        }

        let option = option.mask(self.global_families());
        if option.is_empty() {
            return Err(DnsError::EmptyResponse);
        }

        if let Some(hosts) = &self.hosts {
            if let Some(addresses) = hosts.lookup(&name, option)? {
                let ips: Vec<IpAddr> = addresses
                    .iter()
                    .filter_map(|a| match a {
                        HostAddress::Ip(ip) => Some(*ip),
                        HostAddress::Domain(_) => None,
                    })
                    .collect();
                if !ips.is_empty() {
                    debug!(domain = %name, ips = ips.len(), "static hosts answer");
                    return Ok((ips, STATIC_HOSTS_TTL));
                }
                if let Some(HostAddress::Domain(replacement)) = addresses.into_iter().next() {
                    debug!(domain = %name, replacement = %replacement, "static hosts replacement");
                    name = fqdn(&replacement);
                }
            }
        }

        let clients = self.sort_clients(&name);
        let started = Instant::now();
        let result = if self.parallel {
            self.query_parallel(&clients, &name, option).await
        } else {
            self.query_serial(&clients, &name, option).await
        };
        match &result {
            Ok((ips, ttl)) => {
                debug!(domain = %name, ips = ips.len(), ttl, elapsed = ?started.elapsed(), "lookup finished")
            }
            Err(e) => {
                debug!(domain = %name, error = %e, elapsed = ?started.elapsed(), "lookup failed")
            }
        }
        result
    }

    fn global_families(&self) -> IpOption {
        match self.strategy {
            QueryStrategy::UseIp => IpOption::both(),
            QueryStrategy::UseIp4 => IpOption {
                ipv4: true,
                ipv6: false,
                fake_enable: false,
            },
            QueryStrategy::UseIp6 => IpOption {
                ipv4: false,
                ipv6: true,
                fake_enable: false,
            },
            QueryStrategy::UseSys => sysnet::available_families(),
        }
    }

    /// Per-domain client order: matched rules first (declaration order,
    /// deduplicated), then the fallback round unless disabled, with
    /// `final-query` clients cutting the list short. An empty result
    /// falls back to the first configured client.
    fn sort_clients(&self, domain: &str) -> Vec<Arc<Client>> {
        let mut ordered = Vec::new();
        let mut used = vec![false; self.clients.len()];
        let mut has_match = false;

        for rule_index in self.matcher.matched(domain) {
            let client_index = self.match_info[rule_index];
            has_match = true;
            if used[client_index] {
                continue;
            }
            used[client_index] = true;
            ordered.push(self.clients[client_index].clone());
            if self.clients[client_index].final_query() {
                return ordered;
            }
        }

        if !(self.disable_fallback || (self.disable_fallback_if_match && has_match)) {
            for (client_index, client) in self.clients.iter().enumerate() {
                if used[client_index] || client.skip_fallback() {
                    continue;
                }
                used[client_index] = true;
                ordered.push(client.clone());
                if client.final_query() {
                    break;
                }
            }
        }

        if ordered.is_empty() {
            if let Some(first) = self.clients.first() {
                ordered.push(first.clone());
            }
        }
        ordered
    }

    async fn query_serial(
        &self,
        clients: &[Arc<Client>],
        domain: &str,
        option: IpOption,
    ) -> Result<(Vec<IpAddr>, u32), DnsError> {
        let mut errs = Vec::new();
        for client in clients {
            if client.is_fake_dns() && !option.fake_enable {
                continue;
            }
            match client.query_ip(domain, option).await {
                Ok((ips, ttl)) if !ips.is_empty() => return Ok((ips, ttl)),
                Ok(_) => errs.push(DnsError::EmptyResponse),
                Err(e) => {
                    debug!(client = %client.name(), domain, error = %e, "dns client failed");
                    errs.push(e);
                }
            }
            if client.final_query() {
                break;
            }
        }
        Err(merge_query_errors(errs))
    }

    /// Races every runnable client at once, each bounded by twice its own
    /// deadline and detached from this call. Group priority still holds:
    /// an answer from a later policy group is only returned once every
    /// earlier group has fully failed.
    async fn query_parallel(
        &self,
        clients: &[Arc<Client>],
        domain: &str,
        option: IpOption,
    ) -> Result<(Vec<IpAddr>, u32), DnsError> {
        let runnable: Vec<Arc<Client>> = clients
            .iter()
            .filter(|c| !(c.is_fake_dns() && !option.fake_enable))
            .cloned()
            .collect();
        if runnable.is_empty() {
            return Err(DnsError::EmptyResponse);
        }

        // adjacency-group rule-equivalent clients
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (index, client) in runnable.iter().enumerate() {
            match groups.last_mut() {
                Some(group)
                    if runnable[group[0]].policy_id() == client.policy_id() =>
                {
                    group.push(index)
                }
                _ => groups.push(vec![index]),
            }
        }

        let (tx, mut rx) = mpsc::channel(runnable.len());
        for (index, client) in runnable.iter().enumerate() {
            let client = client.clone();
            let domain = domain.to_string();
            let tx = tx.clone();
            let race_deadline = 2 * client.timeout();
            tokio::spawn(async move {
                let result = match timeout(race_deadline, client.query_ip(&domain, option)).await {
                    Ok(result) => result,
                    Err(_) => Err(DnsError::Timeout),
                };
                let _ = tx.send((index, result)).await;
            });
        }
        drop(tx);

        let mut results: Vec<Option<Result<(Vec<IpAddr>, u32), DnsError>>> =
            vec![None; runnable.len()];
        while let Some((index, result)) = rx.recv().await {
            results[index] = Some(result);

            for group in &groups {
                let mut winner = None;
                let mut pending = false;
                for &member in group {
                    match &results[member] {
                        None => pending = true,
                        Some(Ok((ips, ttl))) if !ips.is_empty() => {
                            winner = Some((ips.clone(), *ttl));
                            break;
                        }
                        Some(_) => {}
                    }
                }
                if let Some(win) = winner {
                    return Ok(win);
                }
                if pending {
                    // the earliest unresolved group holds priority; any
                    // later success stays buffered until it drains
                    break;
                }
            }
        }

        let errs: Vec<DnsError> = results
            .into_iter()
            .flatten()
            .map(|r| match r {
                Ok(_) => DnsError::EmptyResponse,
                Err(e) => e,
            })
            .collect();
        Err(merge_query_errors(errs))
    }
}

fn strategy_families(strategy: QueryStrategy) -> (IpOption, bool) {
    match strategy {
        QueryStrategy::UseIp => (IpOption::both(), false),
        QueryStrategy::UseIp4 => (
            IpOption {
                ipv4: true,
                ipv6: false,
                fake_enable: false,
            },
            false,
        ),
        QueryStrategy::UseIp6 => (
            IpOption {
                ipv4: false,
                ipv6: true,
                fake_enable: false,
            },
            false,
        ),
        QueryStrategy::UseSys => (IpOption::both(), true),
    }
}

fn parse_matchers(cidrs: &[String]) -> Result<Vec<Arc<dyn IpMatcher>>, Error> {
    cidrs
        .iter()
        .map(|s| {
            let net = s.parse::<ipnet::IpNet>()?;
            Ok(CidrMatcher::new(net) as Arc<dyn IpMatcher>)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::super::server::{DnsResult, NameServer};
    use super::super::DEFAULT_TTL;
    use super::*;
    use crate::app::dns::client::DEFAULT_CLIENT_TIMEOUT;

    struct MockServer {
        name: String,
        ips: Vec<IpAddr>,
        fail: bool,
        delay: Duration,
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl MockServer {
        fn ok(name: &str, ips: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                ips: ips.iter().map(|s| s.parse().unwrap()).collect(),
                fail: false,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                ips: vec![],
                fail: true,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn slow(self: Arc<Self>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: self.name.clone(),
                ips: self.ips.clone(),
                fail: self.fail,
                delay,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NameServer for MockServer {
        fn name(&self) -> &str {
            &self.name
        }

        async fn query_ip(self: Arc<Self>, domain: &str, _option: IpOption) -> DnsResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(domain.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(DnsError::Transport("unreachable".into()));
            }
            Ok((self.ips.clone(), DEFAULT_TTL))
        }
    }

    fn client(server: Arc<dyn NameServer>) -> Arc<Client> {
        client_with(server, |_| {})
    }

    fn client_with<F: FnOnce(&mut ClientOpts)>(server: Arc<dyn NameServer>, f: F) -> Arc<Client> {
        let mut opts = ClientOpts {
            server,
            ip_option: IpOption::both(),
            probe_system: false,
            expected: vec![],
            unexpected: vec![],
            act_prior: false,
            act_unprior: false,
            tag: String::new(),
            timeout: DEFAULT_CLIENT_TIMEOUT,
            final_query: false,
            skip_fallback: false,
            is_fake: false,
        };
        f(&mut opts);
        Client::new(opts)
    }

    fn resolver(clients: Vec<Arc<Client>>, rules: Vec<(&str, usize)>) -> Resolver {
        let mut parsed = Vec::new();
        let mut match_info = Vec::new();
        for (rule, client_index) in rules {
            parsed.push(DomainRule::parse(rule, RuleKind::Suffix).unwrap());
            match_info.push(client_index);
        }
        Resolver {
            clients,
            matcher: MatcherGroup::new(parsed),
            match_info,
            disable_fallback: false,
            disable_fallback_if_match: false,
            strategy: QueryStrategy::UseIp,
            parallel: false,
            hosts: None,
        }
    }

    fn names(clients: &[Arc<Client>]) -> Vec<&str> {
        clients.iter().map(|c| c.name()).collect()
    }

    #[tokio::test]
    async fn test_sort_clients_matched_first_then_fallback() {
        let r = resolver(
            vec![
                client(MockServer::ok("c0", &["1.1.1.1"])),
                client(MockServer::ok("c1", &["2.2.2.2"])),
                client_with(MockServer::ok("c2", &["3.3.3.3"]), |o| {
                    o.skip_fallback = true
                }),
            ],
            vec![("google.com", 1)],
        );

        assert_eq!(names(&r.sort_clients("www.google.com")), vec!["c1", "c0"]);
        assert_eq!(names(&r.sort_clients("example.com")), vec!["c0", "c1"]);
    }

    #[tokio::test]
    async fn test_sort_clients_final_query_short_circuits() {
        let r = resolver(
            vec![
                client(MockServer::ok("c0", &["1.1.1.1"])),
                client_with(MockServer::ok("c1", &["2.2.2.2"]), |o| o.final_query = true),
                client(MockServer::ok("c2", &["3.3.3.3"])),
            ],
            vec![("google.com", 1)],
        );

        assert_eq!(names(&r.sort_clients("google.com")), vec!["c1"]);
        // in fallback order the final-query client still stops the list
        assert_eq!(names(&r.sort_clients("example.com")), vec!["c0", "c1"]);
    }

    #[tokio::test]
    async fn test_sort_clients_disable_fallback_if_match() {
        let mut r = resolver(
            vec![
                client(MockServer::ok("c0", &["1.1.1.1"])),
                client(MockServer::ok("c1", &["2.2.2.2"])),
            ],
            vec![("google.com", 1)],
        );
        r.disable_fallback_if_match = true;

        assert_eq!(names(&r.sort_clients("google.com")), vec!["c1"]);
        assert_eq!(names(&r.sort_clients("example.com")), vec!["c0", "c1"]);
    }

    #[tokio::test]
    async fn test_sort_clients_last_resort_default() {
        let mut r = resolver(
            vec![client_with(MockServer::ok("c0", &["1.1.1.1"]), |o| {
                o.skip_fallback = true
            })],
            vec![],
        );
        r.disable_fallback = false;

        // nothing matched, the only client skips fallback; it is still
        // returned as the last resort
        assert_eq!(names(&r.sort_clients("example.com")), vec!["c0"]);
    }

    #[tokio::test]
    async fn test_serial_prioritized_client_wins_without_touching_others() {
        let unreachable = MockServer::failing("c0");
        let stub = MockServer::ok("c1", &["142.250.80.46"]);
        let r = resolver(
            vec![client(unreachable.clone()), client(stub.clone())],
            vec![("google.com", 1)],
        );

        let (ips, _) = r.lookup_ip("google.com", IpOption::both()).await.unwrap();
        assert_eq!(ips, vec!["142.250.80.46".parse::<IpAddr>().unwrap()]);
        assert_eq!(unreachable.calls.load(Ordering::SeqCst), 0);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_serial_falls_back_and_merges_errors() {
        let r = resolver(
            vec![
                client(MockServer::failing("c0")),
                client(MockServer::failing("c1")),
            ],
            vec![],
        );

        let err = r.lookup_ip("example.com", IpOption::both()).await.unwrap_err();
        assert_eq!(err, DnsError::Transport("unreachable".into()));
    }

    #[tokio::test]
    async fn test_empty_domain_is_rejected() {
        let r = resolver(vec![client(MockServer::ok("c0", &["1.1.1.1"]))], vec![]);
        assert!(matches!(
            r.lookup_ip("", IpOption::both()).await,
            Err(DnsError::InvalidDomain(_))
        ));
    }

    #[tokio::test]
    async fn test_global_family_mask_empty_short_circuits() {
        let server = MockServer::ok("c0", &["1.1.1.1"]);
        let mut r = resolver(vec![client(server.clone())], vec![]);
        r.strategy = QueryStrategy::UseIp4;

        let err = r
            .lookup_ip(
                "example.com",
                IpOption {
                    ipv4: false,
                    ipv6: true,
                    fake_enable: false,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, DnsError::EmptyResponse);
        assert_eq!(server.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_static_hosts_answer_and_replacement() {
        let upstream = MockServer::ok("c0", &["10.1.2.3"]);
        let mut r = resolver(vec![client(upstream.clone())], vec![]);
        r.hosts = Some(
            StaticHosts::new(&[
                ("router.lan".to_string(), vec!["192.168.1.1".to_string()]),
                (
                    "alias.example".to_string(),
                    vec!["real.example".to_string()],
                ),
            ])
            .unwrap(),
        );

        let (ips, ttl) = r.lookup_ip("router.lan", IpOption::both()).await.unwrap();
        assert_eq!(ips, vec!["192.168.1.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(ttl, STATIC_HOSTS_TTL);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);

        let (ips, _) = r.lookup_ip("alias.example", IpOption::both()).await.unwrap();
        assert_eq!(ips, vec!["10.1.2.3".parse::<IpAddr>().unwrap()]);
        assert_eq!(
            upstream.seen.lock().unwrap().as_slice(),
            &["real.example".to_string()],
            "the replacement domain goes upstream"
        );
    }

    #[tokio::test]
    async fn test_static_hosts_sentinels_surface() {
        let mut r = resolver(vec![client(MockServer::ok("c0", &["1.1.1.1"]))], vec![]);
        r.hosts = Some(
            StaticHosts::new(&[
                ("empty.example".to_string(), vec!["#0".to_string()]),
                ("refused.example".to_string(), vec!["#5".to_string()]),
            ])
            .unwrap(),
        );

        assert_eq!(
            r.lookup_ip("empty.example", IpOption::both()).await.unwrap_err(),
            DnsError::EmptyResponse
        );
        assert_eq!(
            r.lookup_ip("refused.example", IpOption::both()).await.unwrap_err(),
            DnsError::RCode(5)
        );
    }

    #[tokio::test]
    async fn test_fakedns_client_skipped_unless_enabled() {
        let fake = MockServer::ok("fakedns", &["198.18.0.5"]);
        let real = MockServer::ok("c1", &["93.184.216.34"]);
        let r = resolver(
            vec![
                client_with(fake.clone(), |o| o.is_fake = true),
                client(real.clone()),
            ],
            vec![],
        );

        let (ips, _) = r.lookup_ip("example.com", IpOption::both()).await.unwrap();
        assert_eq!(ips, vec!["93.184.216.34".parse::<IpAddr>().unwrap()]);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);

        let mut opt = IpOption::both();
        opt.fake_enable = true;
        let (ips, _) = r.lookup_ip("example.com", opt).await.unwrap();
        assert_eq!(ips, vec!["198.18.0.5".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_parallel_same_group_first_success_wins() {
        let failing = MockServer::failing("c0");
        let ok = MockServer::ok("c1", &["5.5.5.5"]).slow(Duration::from_millis(50));
        let mut r = resolver(vec![client(failing), client(ok)], vec![]);
        r.parallel = true;

        let (ips, _) = r.lookup_ip("example.com", IpOption::both()).await.unwrap();
        assert_eq!(ips, vec!["5.5.5.5".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_parallel_later_group_waits_for_earlier_drain() {
        // group A: two equally-configured slow failures; group B (distinct
        // policy) answers instantly but must wait for A
        let a0 = MockServer::failing("a0").slow(Duration::from_millis(80));
        let a1 = MockServer::failing("a1").slow(Duration::from_millis(120));
        let b = MockServer::ok("b", &["7.7.7.7"]);
        let mut r = resolver(
            vec![
                client(a0.clone()),
                client(a1.clone()),
                client_with(b.clone(), |o| o.act_prior = true),
            ],
            vec![],
        );
        r.parallel = true;

        let started = Instant::now();
        let (ips, _) = r.lookup_ip("example.com", IpOption::both()).await.unwrap();
        assert_eq!(ips, vec!["7.7.7.7".parse::<IpAddr>().unwrap()]);
        assert!(
            started.elapsed() >= Duration::from_millis(120),
            "group B's buffered answer is released only after group A drains"
        );
    }

    #[tokio::test]
    async fn test_parallel_all_fail_merges_errors() {
        let mut r = resolver(
            vec![
                client(MockServer::failing("c0")),
                client(MockServer::failing("c1")),
            ],
            vec![],
        );
        r.parallel = true;

        let err = r.lookup_ip("example.com", IpOption::both()).await.unwrap_err();
        assert_eq!(err, DnsError::Transport("unreachable".into()));
    }

    #[test]
    fn test_new_validates_config() {
        let empty = DnsConfig::default();
        assert!(Resolver::new(&empty, None).is_err());

        let cfg: DnsConfig =
            serde_yaml::from_str("servers: [\"udp://8.8.8.8\", \"tcp://1.1.1.1\"]").unwrap();
        assert!(Resolver::new(&cfg, None).is_ok());

        let bad: DnsConfig = serde_yaml::from_str("servers: [\"ftp://1.1.1.1\"]").unwrap();
        assert!(Resolver::new(&bad, None).is_err());

        let bad_cidr: DnsConfig = serde_yaml::from_str(
            "servers: [{address: \"udp://8.8.8.8\", expected-ips: [\"not-a-net\"]}]",
        )
        .unwrap();
        assert!(Resolver::new(&bad_cidr, None).is_err());

        let fake_without_engine: DnsConfig =
            serde_yaml::from_str("servers: [fakedns]").unwrap();
        assert!(Resolver::new(&fake_without_engine, None).is_err());
    }
}
