use std::net::IpAddr;
use std::time::Duration;

use hickory_proto::op::{Edns, Message, Query};
use hickory_proto::rr::rdata::opt::EdnsOption;
use hickory_proto::rr::{Name, RData, RecordType};
use rand::Rng;
use tokio::time::Instant;

use super::record::IpRecord;
use super::{DnsError, DEFAULT_TTL};

const EDNS_OPT_CLIENT_SUBNET: u16 = 8;
const EDNS_OPT_PADDING: u16 = 12;

/// Knobs for one outgoing query beyond name and type.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOpts {
    /// Adds an EDNS0 client-subnet hint (/24 for v4, /96 for v6).
    pub client_subnet: Option<IpAddr>,
    /// Advertised UDP payload size; also forces an OPT record.
    pub payload_size: Option<u16>,
    /// Random 100-300 byte padding, for encrypted transports.
    pub padding: bool,
}

pub fn build_query(fqdn: &str, rtype: RecordType, opts: &QueryOpts) -> Result<Message, DnsError> {
    let name = Name::from_str_relaxed(fqdn)
        .map_err(|_| DnsError::InvalidDomain(fqdn.to_string()))?
        .append_domain(&Name::root())
        .map_err(|_| DnsError::InvalidDomain(fqdn.to_string()))?;

    let mut query = Query::new();
    query.set_name(name);
    query.set_query_type(rtype);

    let mut msg = Message::new();
    msg.set_id(rand::thread_rng().gen());
    msg.add_query(query);
    msg.set_recursion_desired(true);

    if opts.client_subnet.is_some() || opts.payload_size.is_some() || opts.padding {
        let mut edns = Edns::new();
        edns.set_version(0);
        edns.set_max_payload(opts.payload_size.unwrap_or(1232));
        if let Some(ip) = opts.client_subnet {
            edns.options_mut()
                .insert(EdnsOption::Unknown(EDNS_OPT_CLIENT_SUBNET, ecs_bytes(ip)));
        }
        if opts.padding {
            let len = rand::thread_rng().gen_range(100..300);
            edns.options_mut()
                .insert(EdnsOption::Unknown(EDNS_OPT_PADDING, vec![0u8; len]));
        }
        msg.set_edns(edns);
    }

    Ok(msg)
}

/// RFC 7871 wire form of a client-subnet option, truncated to the
/// customary source prefix for the family.
fn ecs_bytes(ip: IpAddr) -> Vec<u8> {
    let (family, prefix, addr): (u16, u8, Vec<u8>) = match ip {
        IpAddr::V4(v4) => (1, 24, v4.octets()[..3].to_vec()),
        IpAddr::V6(v6) => (2, 96, v6.octets()[..12].to_vec()),
    };
    let mut out = Vec::with_capacity(4 + addr.len());
    out.extend_from_slice(&family.to_be_bytes());
    out.push(prefix);
    out.push(0); // scope prefix, always 0 on queries
    out.extend_from_slice(&addr);
    out
}

/// Extracts an [`IpRecord`] from a reply: addresses of the requested type,
/// expiry from the minimum RR TTL, and the header bits the cache keeps.
pub fn parse_reply(msg: &Message, rtype: RecordType, now: Instant) -> IpRecord {
    let mut ips = Vec::new();
    let mut min_ttl: Option<u32> = None;

    for rr in msg.answers() {
        if rr.record_type() != rtype {
            continue;
        }
        let ip = match rr.data() {
            Some(RData::A(a)) => IpAddr::V4(**a),
            Some(RData::AAAA(aaaa)) => IpAddr::V6(**aaaa),
            _ => continue,
        };
        ips.push(ip);
        min_ttl = Some(min_ttl.map_or(rr.ttl(), |t| t.min(rr.ttl())));
    }

    let ttl = min_ttl.unwrap_or(DEFAULT_TTL);
    IpRecord {
        req_id: msg.id(),
        ips,
        expire_at: now + Duration::from_secs(u64::from(ttl)),
        authoritative: msg.authoritative(),
        truncated: msg.truncated(),
        rcode: u16::from(msg.response_code().low()),
        req_type: rtype,
    }
}

pub fn has_edns(msg: &Message) -> bool {
    msg.extensions().is_some()
}

#[cfg(test)]
mod tests {
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::Record as RR;

    use super::*;

    #[test]
    fn test_build_query_basics() {
        let msg = build_query("example.com", RecordType::A, &QueryOpts::default()).unwrap();
        assert_eq!(msg.queries().len(), 1);
        assert_eq!(msg.queries()[0].query_type(), RecordType::A);
        assert_eq!(msg.queries()[0].name().to_ascii(), "example.com.");
        assert!(msg.recursion_desired());
        assert!(!has_edns(&msg));
    }

    #[test]
    fn test_build_query_edns_payload() {
        let msg = build_query(
            "example.com",
            RecordType::A,
            &QueryOpts {
                payload_size: Some(1350),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(msg.extensions().as_ref().unwrap().max_payload(), 1350);
    }

    #[test]
    fn test_build_query_subnet_and_padding() {
        let msg = build_query(
            "example.com",
            RecordType::A,
            &QueryOpts {
                client_subnet: Some("203.0.113.77".parse().unwrap()),
                padding: true,
                ..Default::default()
            },
        )
        .unwrap();
        let edns = msg.extensions().as_ref().unwrap();
        let ecs = edns
            .option(hickory_proto::rr::rdata::opt::EdnsCode::Subnet)
            .expect("client-subnet present");
        let bytes = match ecs {
            EdnsOption::Unknown(_, b) => b.clone(),
            other => panic!("unexpected option encoding: {:?}", other),
        };
        assert_eq!(&bytes[..4], &[0, 1, 24, 0]);
        assert_eq!(&bytes[4..], &[203, 0, 113]);
    }

    #[test]
    fn test_parse_reply_min_ttl_and_bits() {
        let query = build_query("example.com", RecordType::A, &QueryOpts::default()).unwrap();
        let mut reply = Message::new();
        reply.set_id(query.id());
        reply.set_authoritative(true);
        let name = Name::from_str_relaxed("example.com.").unwrap();
        reply.add_answer(RR::from_rdata(
            name.clone(),
            120,
            RData::A(A::new(8, 8, 8, 8)),
        ));
        reply.add_answer(RR::from_rdata(name, 60, RData::A(A::new(8, 8, 4, 4))));

        let now = Instant::now();
        let rec = parse_reply(&reply, RecordType::A, now);
        assert_eq!(rec.ips.len(), 2);
        assert_eq!(rec.expire_at, now + Duration::from_secs(60));
        assert!(rec.authoritative);
        assert_eq!(rec.rcode, 0);
        assert_eq!(rec.req_id, query.id());
    }

    #[test]
    fn test_parse_reply_ignores_other_types() {
        let mut reply = Message::new();
        let name = Name::from_str_relaxed("example.com.").unwrap();
        reply.add_answer(RR::from_rdata(
            name,
            60,
            RData::AAAA(AAAA::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
        ));
        let rec = parse_reply(&reply, RecordType::A, Instant::now());
        assert!(rec.ips.is_empty());
    }

    #[test]
    fn test_parse_reply_rcode() {
        let mut reply = Message::new();
        reply.set_response_code(ResponseCode::NXDomain);
        let rec = parse_reply(&reply, RecordType::A, Instant::now());
        assert_eq!(rec.rcode, 3);
    }
}
