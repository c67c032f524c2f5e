use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use quinn::{Connection, Endpoint};
use tokio::net::lookup_host;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use super::cache::CacheController;
use super::fqdn;
use super::msg::{build_query, parse_reply, QueryOpts};
use super::record::IpRecord;
use super::server::{Transport, QUERY_TIMEOUT};
use super::{DnsError, IpOption};
use crate::common::tls;
use crate::Error;

/// DNS over QUIC (RFC 9250): message id 0, one bidirectional stream per
/// query with the two-byte length prefix. The connection is pooled per
/// server and revalidated by its close reason; reconnects are
/// double-checked under the write lock with a single dial retry.
pub struct DoqTransport {
    name: String,
    host: String,
    port: u16,
    crypto: Arc<rustls::ClientConfig>,
    state: RwLock<DoqState>,
    client_subnet: Option<IpAddr>,
}

#[derive(Default)]
struct DoqState {
    // the endpoint binds lazily so construction stays runtime-free
    endpoint: Option<Endpoint>,
    conn: Option<Connection>,
}

impl DoqTransport {
    pub fn new(
        name: &str,
        host: &str,
        port: u16,
        client_subnet: Option<IpAddr>,
    ) -> Result<Arc<Self>, Error> {
        rustls::ServerName::try_from(host)
            .map_err(|_| Error::InvalidConfig(format!("bad doq server name: {}", host)))?;
        Ok(Arc::new(Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            crypto: tls::client_config(&[b"doq"]),
            state: RwLock::new(DoqState::default()),
            client_subnet,
        }))
    }

    async fn connection(&self) -> Result<Connection, DnsError> {
        {
            let state = self.state.read().await;
            if let Some(conn) = &state.conn {
                if conn.close_reason().is_none() {
                    return Ok(conn.clone());
                }
            }
        }

        let mut state = self.state.write().await;
        if let Some(conn) = &state.conn {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
        }
        if state.endpoint.is_none() {
            let mut endpoint = Endpoint::client(SocketAddr::from(([0u8; 4], 0)))?;
            endpoint.set_default_client_config(quinn::ClientConfig::new(self.crypto.clone()));
            state.endpoint = Some(endpoint);
        }
        let endpoint = state.endpoint.clone().ok_or_else(|| {
            DnsError::Transport("doq endpoint unavailable".into())
        })?;

        let conn = match self.dial(&endpoint).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(server = %self.name, error = %e, "doq dial failed, retrying once");
                self.dial(&endpoint).await?
            }
        };
        state.conn = Some(conn.clone());
        Ok(conn)
    }

    async fn dial(&self, endpoint: &Endpoint) -> Result<Connection, DnsError> {
        let addr = lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| DnsError::Transport(format!("no address for {}", self.host)))?;
        endpoint
            .connect(addr, &self.host)
            .map_err(|e| DnsError::Transport(e.to_string()))?
            .await
            .map_err(|e| DnsError::Transport(e.to_string()))
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
        // RFC 9250 §4.2.1 requires a zero message id
        query.set_id(0);
        let wire = query.to_vec()?;

        let conn = self.connection().await?;
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| DnsError::Transport(e.to_string()))?;

        send.write_all(&(wire.len() as u16).to_be_bytes())
            .await
            .map_err(|e| DnsError::Transport(e.to_string()))?;
        send.write_all(&wire)
            .await
            .map_err(|e| DnsError::Transport(e.to_string()))?;
        send.finish()
            .await
            .map_err(|e| DnsError::Transport(e.to_string()))?;

        let mut len = [0u8; 2];
        recv.read_exact(&mut len)
            .await
            .map_err(|e| DnsError::Transport(e.to_string()))?;
        let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
        recv.read_exact(&mut buf)
            .await
            .map_err(|e| DnsError::Transport(e.to_string()))?;

        let reply = Message::from_vec(&buf)?;
        Ok(parse_reply(&reply, rtype, Instant::now()))
    }

    fn is_own_name(&self, queried: &str) -> bool {
        fqdn(&self.host) == queried
    }
}

#[async_trait]
impl Transport for DoqTransport {
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
        if self.is_own_name(&fqdn) {
            warn!(server = %self.name, domain = %fqdn, "refusing to resolve own server name");
            let _ = err_tx
                .send(DnsError::Transport(
                    "cannot resolve the doq server through itself".into(),
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
