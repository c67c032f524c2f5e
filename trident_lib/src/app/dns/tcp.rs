use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_rustls::TlsConnector;

use super::cache::CacheController;
use super::msg::{build_query, parse_reply, QueryOpts};
use super::record::IpRecord;
use super::server::{Transport, QUERY_TIMEOUT};
use super::{DnsError, IpOption};
use crate::common::tls;
use crate::Error;

/// DNS over a byte stream with the RFC 1035 two-byte length prefix; plain
/// TCP or, with a TLS config, DoT.
pub struct TcpTransport {
    name: String,
    host: String,
    port: u16,
    tls: Option<(TlsConnector, rustls::ServerName)>,
    client_subnet: Option<IpAddr>,
}

impl TcpTransport {
    pub fn plain(name: &str, addr: SocketAddr, client_subnet: Option<IpAddr>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
            tls: None,
            client_subnet,
        })
    }

    pub fn tls(
        name: &str,
        host: &str,
        port: u16,
        client_subnet: Option<IpAddr>,
    ) -> Result<Arc<Self>, Error> {
        let server_name = rustls::ServerName::try_from(host)
            .map_err(|_| Error::InvalidConfig(format!("bad dot server name: {}", host)))?;
        let connector = TlsConnector::from(tls::client_config(&[]));
        Ok(Arc::new(Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            tls: Some((connector, server_name)),
            client_subnet,
        }))
    }

    async fn exchange(&self, fqdn: &str, rtype: RecordType) -> Result<IpRecord, DnsError> {
        let query = build_query(
            fqdn,
            rtype,
            &QueryOpts {
                client_subnet: self.client_subnet,
                ..Default::default()
            },
        )?;
        let wire = query.to_vec()?;

        let addr = lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| DnsError::Transport(format!("no address for {}", self.host)))?;
        let stream = TcpStream::connect(addr).await?;

        let reply = match &self.tls {
            None => roundtrip(stream, &wire).await?,
            Some((connector, server_name)) => {
                let stream = connector.connect(server_name.clone(), stream).await?;
                roundtrip(stream, &wire).await?
            }
        };

        if reply.id() != query.id() {
            return Err(DnsError::Transport("mismatched reply id".into()));
        }
        Ok(parse_reply(&reply, rtype, Instant::now()))
    }
}

async fn roundtrip<S>(mut stream: S, wire: &[u8]) -> Result<Message, DnsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&(wire.len() as u16).to_be_bytes()).await?;
    stream.write_all(wire).await?;
    stream.flush().await?;

    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut buf).await?;
    Ok(Message::from_vec(&buf)?)
}

#[async_trait]
impl Transport for TcpTransport {
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
