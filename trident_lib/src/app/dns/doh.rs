use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use h2::client::SendRequest;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::Request;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout, Instant};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::cache::CacheController;
use super::fqdn;
use super::msg::{build_query, parse_reply, QueryOpts};
use super::record::IpRecord;
use super::server::{Transport, QUERY_TIMEOUT};
use super::{DnsError, IpOption};
use crate::common::tls;
use crate::Error;

const DNS_MESSAGE: &str = "application/dns-message";

/// DNS over HTTP/2: `https://` with TLS+ALPN, `h2c://` in cleartext. One
/// pooled connection per server: liveness is probed on the read path and
/// the connection is rebuilt double-checked under the write lock.
pub struct DohTransport {
    name: String,
    host: String,
    port: u16,
    uri: String,
    tls: Option<Arc<rustls::ClientConfig>>,
    conn: RwLock<Option<SendRequest<Bytes>>>,
    client_subnet: Option<IpAddr>,
}

impl DohTransport {
    pub fn new(
        name: &str,
        host: &str,
        port: u16,
        path: &str,
        use_tls: bool,
        client_subnet: Option<IpAddr>,
    ) -> Result<Arc<Self>, Error> {
        if use_tls {
            rustls::ServerName::try_from(host)
                .map_err(|_| Error::InvalidConfig(format!("bad doh server name: {}", host)))?;
        }
        let scheme = if use_tls { "https" } else { "http" };
        Ok(Arc::new(Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            uri: format!("{}://{}:{}{}", scheme, host, port, path),
            tls: use_tls.then(|| tls::client_config(&[b"h2"])),
            conn: RwLock::new(None),
            client_subnet,
        }))
    }

    async fn h2(&self) -> Result<SendRequest<Bytes>, DnsError> {
        // read-locked fast path: reuse the pooled connection if it is
        // still willing to take a stream
        if let Some(sr) = self.conn.read().await.clone() {
            if let Ok(ready) = sr.ready().await {
                return Ok(ready);
            }
        }

        let mut guard = self.conn.write().await;
        if let Some(sr) = guard.clone() {
            if let Ok(ready) = sr.ready().await {
                return Ok(ready);
            }
        }
        let sr = match self.dial().await {
            Ok(sr) => sr,
            Err(e) => {
                debug!(server = %self.name, error = %e, "doh dial failed, retrying once");
                self.dial().await?
            }
        };
        *guard = Some(sr.clone());
        sr.ready().await.map_err(|e| DnsError::Transport(e.to_string()))
    }

    async fn dial(&self) -> Result<SendRequest<Bytes>, DnsError> {
        let addr = lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| DnsError::Transport(format!("no address for {}", self.host)))?;
        let stream = TcpStream::connect(addr).await?;

        match &self.tls {
            Some(config) => {
                let server_name = rustls::ServerName::try_from(self.host.as_str())
                    .map_err(|_| DnsError::Transport("bad server name".into()))?;
                let stream = TlsConnector::from(config.clone())
                    .connect(server_name, stream)
                    .await?;
                let (sr, conn) = h2::client::handshake(stream)
                    .await
                    .map_err(|e| DnsError::Transport(e.to_string()))?;
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!("doh connection closed: {}", e);
                    }
                });
                Ok(sr)
            }
            None => {
                let (sr, conn) = h2::client::handshake(stream)
                    .await
                    .map_err(|e| DnsError::Transport(e.to_string()))?;
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!("doh connection closed: {}", e);
                    }
                });
                Ok(sr)
            }
        }
    }

    async fn exchange(&self, fqdn: &str, rtype: RecordType) -> Result<IpRecord, DnsError> {
        let mut query = build_query(
            fqdn,
            rtype,
            &QueryOpts {
                client_subnet: self.client_subnet,
                padding: true,
                ..Default::default()
            },
        )?;
        // cache-friendly fixed id on encrypted transports
        query.set_id(0);
        let wire = Bytes::from(query.to_vec()?);

        let mut sr = self.h2().await?;
        let request = Request::builder()
            .method("POST")
            .uri(&self.uri)
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(())
            .map_err(|e| DnsError::Transport(e.to_string()))?;

        let (response, mut body_tx) = sr
            .send_request(request, false)
            .map_err(|e| DnsError::Transport(e.to_string()))?;
        body_tx
            .send_data(wire, true)
            .map_err(|e| DnsError::Transport(e.to_string()))?;

        let response = response
            .await
            .map_err(|e| DnsError::Transport(e.to_string()))?;
        if response.status() != http::StatusCode::OK {
            return Err(DnsError::Transport(format!(
                "doh status {}",
                response.status()
            )));
        }

        let mut body = response.into_body();
        let mut buf = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk.map_err(|e| DnsError::Transport(e.to_string()))?;
            buf.extend_from_slice(&chunk);
            let _ = body.flow_control().release_capacity(chunk.len());
        }
        let reply = Message::from_vec(&buf)?;
        Ok(parse_reply(&reply, rtype, Instant::now()))
    }

    fn is_own_name(&self, queried: &str) -> bool {
        fqdn(&self.host) == queried
    }
}

#[async_trait]
impl Transport for DohTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_query(
        self: Arc<Self>,
        cache: Arc<CacheController>,
        err_tx: mpsc::Sender<DnsError>,
        fqdn: String,
        option: IpOption,
    ) {
        // resolving our own hostname through ourselves would recurse
        if self.is_own_name(&fqdn) {
            warn!(server = %self.name, domain = %fqdn, "refusing to resolve own server name");
            let _ = err_tx
                .send(DnsError::Transport(
                    "cannot resolve the doh server through itself".into(),
                ))
                .await;
            return;
        }

        for rtype in option.record_types() {
            let this = self.clone();
            let cache = cache.clone();
            let err_tx = err_tx.clone();
            let fqdn = fqdn.clone();
            tokio::spawn(async move {
                match timeout(QUERY_TIMEOUT, this.exchange(&fqdn, rtype)).await {
                    Ok(Ok(rec)) => cache.update_record(&fqdn, rec),
                    Ok(Err(e)) => {
                        let _ = err_tx.send(e).await;
                    }
                    Err(_) => {
                        let _ = err_tx.send(DnsError::Timeout).await;
                    }
                }
            });
        }
    }
}
