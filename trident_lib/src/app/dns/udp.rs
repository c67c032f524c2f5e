use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::debug;

use super::cache::CacheController;
use super::msg::{build_query, has_edns, parse_reply, QueryOpts};
use super::record::IpRecord;
use super::server::{Transport, QUERY_TIMEOUT};
use super::{DnsError, IpOption};

/// Payload size advertised when retrying a truncated answer with EDNS0.
const TRUNCATED_PAYLOAD: u16 = 1350;

/// Classic RFC 1035 UDP. One socket per dispatched query; a truncated
/// answer to an EDNS0-less query is retried once with a larger advertised
/// payload.
pub struct UdpTransport {
    name: String,
    addr: SocketAddr,
    client_subnet: Option<IpAddr>,
}

impl UdpTransport {
    pub fn new(name: &str, addr: SocketAddr, client_subnet: Option<IpAddr>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            addr,
            client_subnet,
        })
    }

    async fn exchange(&self, fqdn: &str, rtype: RecordType) -> Result<IpRecord, DnsError> {
        let bind: SocketAddr = if self.addr.is_ipv4() {
            SocketAddr::from(([0u8; 4], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.addr).await?;

        let query = build_query(
            fqdn,
            rtype,
            &QueryOpts {
                client_subnet: self.client_subnet,
                ..Default::default()
            },
        )?;
        let reply = roundtrip(&socket, &query).await?;

        if reply.truncated() && !has_edns(&query) {
            debug!(server = %self.name, domain = %fqdn, "truncated answer, retrying with edns0");
            let retry = build_query(
                fqdn,
                rtype,
                &QueryOpts {
                    client_subnet: self.client_subnet,
                    payload_size: Some(TRUNCATED_PAYLOAD),
                    ..Default::default()
                },
            )?;
            let reply = roundtrip(&socket, &retry).await?;
            return Ok(parse_reply(&reply, rtype, Instant::now()));
        }

        Ok(parse_reply(&reply, rtype, Instant::now()))
    }
}

async fn roundtrip(socket: &UdpSocket, query: &Message) -> Result<Message, DnsError> {
    socket.send(&query.to_vec()?).await?;
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.recv(&mut buf).await?;
        let Ok(reply) = Message::from_vec(&buf[..n]) else {
            continue;
        };
        if reply.id() == query.id() {
            return Ok(reply);
        }
        // late answer to an earlier query on a reused port; keep reading
    }
}

#[async_trait]
impl Transport for UdpTransport {
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
