use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::debug;
use url::Url;

use super::cache::CacheController;
use super::doh::DohTransport;
use super::doq::DoqTransport;
use super::fakedns::{FakeDns, FakeDnsServer};
use super::local::LocalNameServer;
use super::record::{slot_ips, Record};
use super::tcp::TcpTransport;
use super::udp::UdpTransport;
use super::{fqdn, merge_query_errors, DnsError, IpOption, DEFAULT_TTL};
use crate::Error;

/// Resolved addresses plus the seconds they may be considered fresh.
pub type DnsResult = Result<(Vec<IpAddr>, u32), DnsError>;

/// Deadline of one dispatched query task.
pub(crate) const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline of a detached stale-refresh, independent of the caller.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(8);

#[async_trait]
pub trait NameServer: Send + Sync {
    fn name(&self) -> &str;
    async fn query_ip(self: Arc<Self>, domain: &str, option: IpOption) -> DnsResult;
}

impl std::fmt::Debug for dyn NameServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NameServer({})", self.name())
    }
}

/// One concrete upstream. `send_query` dispatches a task per requested
/// family; every task ends by installing its answer through
/// `cache.update_record` or by reporting on `err_tx`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn send_query(
        self: Arc<Self>,
        cache: Arc<CacheController>,
        err_tx: mpsc::Sender<DnsError>,
        fqdn: String,
        option: IpOption,
    );
}

/// The query pipeline shared by every cached transport: cache probe,
/// stale-while-revalidate, single-flight, family-keyed waits, merge.
pub struct CachedServer<T: Transport> {
    transport: Arc<T>,
    cache: Arc<CacheController>,
}

impl<T: Transport> CachedServer<T> {
    pub fn new(transport: Arc<T>, cache: Arc<CacheController>) -> Arc<Self> {
        Arc::new(Self { transport, cache })
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &Arc<CacheController> {
        &self.cache
    }

    async fn fetch(self: Arc<Self>, fqdn: &str, option: IpOption) -> DnsResult {
        let key = format!("{}{}", fqdn, option.family_suffix());
        self.cache
            .flight
            .work(&key, || {
                let this = self.clone();
                let fqdn = fqdn.to_string();
                async move { this.do_fetch(&fqdn, option).await }
            })
            .await
    }

    async fn do_fetch(&self, fqdn: &str, option: IpOption) -> DnsResult {
        // register before dispatch so a fast answer cannot slip past us
        let (sub4, sub6) = self.cache.register_subscribers(fqdn, option);
        let (err_tx, mut err_rx) = mpsc::channel::<DnsError>(2);

        self.transport
            .clone()
            .send_query(self.cache.clone(), err_tx, fqdn.to_string(), option)
            .await;

        for sub in [sub4, sub6] {
            let Some(mut sub) = sub else { continue };
            tokio::select! {
                _ = sub.wait() => {}
                Some(e) = err_rx.recv() => {
                    debug!(server = %self.transport.name(), domain = %fqdn, error = %e, "dns query failed");
                    return Err(e);
                }
            }
        }

        let now = Instant::now();
        let rec = self.cache.find_records(fqdn).unwrap_or_default();
        let (ips, ttl, err) = merge(option, &rec, now);
        let ttl = if ttl > 0 {
            ttl as u32
        } else if matches!(err, Some(DnsError::RecordNotFound)) {
            0
        } else {
            // a fast answer aged out during the sibling family's round trip
            1
        };
        finish(ips, ttl, err)
    }
}

#[async_trait]
impl<T: Transport> NameServer for CachedServer<T> {
    fn name(&self) -> &str {
        self.transport.name()
    }

    async fn query_ip(self: Arc<Self>, domain: &str, option: IpOption) -> DnsResult {
        let fqdn = fqdn(domain);
        if fqdn.is_empty() {
            return Err(DnsError::InvalidDomain(domain.to_string()));
        }

        if !self.cache.disable_cache() {
            if let Some(rec) = self.cache.find_records(&fqdn) {
                let now = Instant::now();
                let (ips, ttl, err) = merge(option, &rec, now);
                if !matches!(err, Some(DnsError::RecordNotFound)) {
                    if ttl > 0 {
                        debug!(server = %self.name(), domain = %fqdn, ttl, "dns cache hit");
                        return finish(ips, ttl as u32, err);
                    }
                    if self.cache.serve_stale()
                        && (self.cache.serve_expired_ttl() == 0
                            || self.cache.serve_expired_ttl() < ttl)
                    {
                        debug!(server = %self.name(), domain = %fqdn, "serving stale entry while refreshing");
                        let this = self.clone();
                        let refresh = fqdn.clone();
                        tokio::spawn(async move {
                            if timeout(REFRESH_TIMEOUT, this.fetch(&refresh, option))
                                .await
                                .is_err()
                            {
                                debug!(domain = %refresh, "stale refresh timed out");
                            }
                        });
                        return finish(ips, 1, err);
                    }
                }
            }
        }

        self.fetch(&fqdn, option).await
    }
}

fn finish(ips: Vec<IpAddr>, ttl: u32, err: Option<DnsError>) -> DnsResult {
    match err {
        None => Ok((ips, ttl)),
        Some(e) => Err(e),
    }
}

/// Combines the two family slots under `option` into one answer with a
/// signed TTL. With both families requested, a missing slot short-circuits
/// as `RecordNotFound` ("nothing cached yet"); otherwise IPs accumulate and
/// the TTL is the signed minimum across contributing slots, capped at
/// [`DEFAULT_TTL`].
pub(crate) fn merge(
    option: IpOption,
    rec: &Record,
    now: Instant,
) -> (Vec<IpAddr>, i64, Option<DnsError>) {
    if !(option.ipv4 && option.ipv6) {
        return if option.ipv4 {
            slot_ips(rec.a.as_ref(), now)
        } else {
            slot_ips(rec.aaaa.as_ref(), now)
        };
    }

    let (ips4, ttl4, err4) = slot_ips(rec.a.as_ref(), now);
    let (ips6, ttl6, err6) = slot_ips(rec.aaaa.as_ref(), now);
    if matches!(err4, Some(DnsError::RecordNotFound)) {
        return (ips4, ttl4, err4);
    }
    if matches!(err6, Some(DnsError::RecordNotFound)) {
        return (ips6, ttl6, err6);
    }

    let mut ips = ips4;
    ips.extend(ips6);
    let ttl = (i64::from(DEFAULT_TTL)).min(ttl4).min(ttl6);
    let err = if !ips.is_empty() {
        None
    } else if err4 == err6 {
        err4
    } else {
        // both slots are present and erroneous here, just differently
        Some(merge_query_errors(vec![err4.unwrap(), err6.unwrap()]))
    };
    (ips, ttl, err)
}

/// Builds a name server from its address scheme. `cache` carries the
/// per-server controller; `client_subnet` is forwarded to transports that
/// attach ECS hints.
pub fn new_name_server(
    address: &str,
    client_subnet: Option<IpAddr>,
    cache: Arc<CacheController>,
    fake: Option<Arc<dyn FakeDns>>,
) -> Result<Arc<dyn NameServer>, Error> {
    match address {
        "localhost" => return Ok(LocalNameServer::new()?),
        "fakedns" => {
            let engine = fake.ok_or_else(|| {
                Error::InvalidConfig("fakedns server configured without a fake-dns engine".into())
            })?;
            return Ok(FakeDnsServer::new(engine));
        }
        _ => {}
    }

    if !address.contains("://") {
        let addr = parse_endpoint(address, 53)?;
        let transport = UdpTransport::new(address, addr, client_subnet);
        return Ok(CachedServer::new(transport, cache));
    }

    let url = Url::parse(address)
        .map_err(|e| Error::InvalidConfig(format!("bad name server url {}: {}", address, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidConfig(format!("name server url has no host: {}", address)))?
        .to_string();

    match url.scheme() {
        "udp" => {
            let addr = socket_addr(&host, url.port().unwrap_or(53))?;
            Ok(CachedServer::new(
                UdpTransport::new(address, addr, client_subnet),
                cache,
            ))
        }
        "tcp" | "tcp+local" => {
            let addr = socket_addr(&host, url.port().unwrap_or(53))?;
            Ok(CachedServer::new(
                TcpTransport::plain(address, addr, client_subnet),
                cache,
            ))
        }
        "tls" | "tls+local" => {
            let port = url.port().unwrap_or(853);
            Ok(CachedServer::new(
                TcpTransport::tls(address, &host, port, client_subnet)?,
                cache,
            ))
        }
        "https" | "https+local" => {
            let port = url.port().unwrap_or(443);
            let path = match url.path() {
                "" | "/" => "/dns-query",
                p => p,
            };
            Ok(CachedServer::new(
                DohTransport::new(address, &host, port, path, true, client_subnet)?,
                cache,
            ))
        }
        "h2c" | "h2c+local" => {
            let port = url.port().unwrap_or(80);
            let path = match url.path() {
                "" | "/" => "/dns-query",
                p => p,
            };
            Ok(CachedServer::new(
                DohTransport::new(address, &host, port, path, false, client_subnet)?,
                cache,
            ))
        }
        "quic+local" => {
            let port = url.port().unwrap_or(853);
            Ok(CachedServer::new(
                DoqTransport::new(address, &host, port, client_subnet)?,
                cache,
            ))
        }
        other => Err(Error::InvalidConfig(format!(
            "unknown name server scheme: {}",
            other
        ))),
    }
}

fn parse_endpoint(address: &str, default_port: u16) -> Result<SocketAddr, Error> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    Err(Error::InvalidConfig(format!(
        "name server endpoint must be ip or ip:port, got {}",
        address
    )))
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr, Error> {
    let ip: IpAddr = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .map_err(|_| {
            Error::InvalidConfig(format!("name server host must be an ip, got {}", host))
        })?;
    Ok(SocketAddr::new(ip, port))
}
