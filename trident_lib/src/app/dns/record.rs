use std::net::IpAddr;
use std::sync::Arc;

use hickory_proto::rr::RecordType;
use tokio::time::Instant;

use super::DnsError;

/// One answered RR set for a (domain, type) pair. Immutable once stored in
/// the cache; `update_record` replaces the whole slot.
#[derive(Debug, Clone)]
pub struct IpRecord {
    pub req_id: u16,
    pub ips: Vec<IpAddr>,
    pub expire_at: Instant,
    pub authoritative: bool,
    pub truncated: bool,
    pub rcode: u16,
    pub req_type: RecordType,
}

impl IpRecord {
    /// Returns the addresses with the signed seconds left until expiry.
    /// Negative TTL means the record is past its expiry (stale); a present
    /// record with a non-zero rcode or no addresses reports the
    /// corresponding negative-answer error.
    pub fn get_ips(&self, now: Instant) -> (Vec<IpAddr>, i64, Option<DnsError>) {
        let ttl = signed_secs(self.expire_at, now);
        if self.rcode != 0 {
            return (Vec::new(), ttl, Some(DnsError::RCode(self.rcode)));
        }
        if self.ips.is_empty() {
            return (Vec::new(), ttl, Some(DnsError::EmptyResponse));
        }
        (self.ips.clone(), ttl, None)
    }
}

fn signed_secs(expire_at: Instant, now: Instant) -> i64 {
    if now <= expire_at {
        expire_at.duration_since(now).as_secs() as i64
    } else {
        -(now.duration_since(expire_at).as_secs() as i64)
    }
}

/// Evaluates one family slot; an absent slot is the "nothing cached yet"
/// sentinel.
pub(crate) fn slot_ips(
    rec: Option<&Arc<IpRecord>>,
    now: Instant,
) -> (Vec<IpAddr>, i64, Option<DnsError>) {
    match rec {
        Some(r) => r.get_ips(now),
        None => (Vec::new(), 0, Some(DnsError::RecordNotFound)),
    }
}

/// The cache value for one domain: up to one record per address family.
/// An entry with both slots empty is removed from the map.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub a: Option<Arc<IpRecord>>,
    pub aaaa: Option<Arc<IpRecord>>,
}

impl Record {
    pub fn slot(&self, rt: RecordType) -> Option<&Arc<IpRecord>> {
        match rt {
            RecordType::AAAA => self.aaaa.as_ref(),
            _ => self.a.as_ref(),
        }
    }

    pub fn set_slot(&mut self, rec: Arc<IpRecord>) {
        match rec.req_type {
            RecordType::AAAA => self.aaaa = Some(rec),
            _ => self.a = Some(rec),
        }
    }

    pub fn sibling(&self, rt: RecordType) -> Option<&Arc<IpRecord>> {
        match rt {
            RecordType::AAAA => self.a.as_ref(),
            _ => self.aaaa.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.a.is_none() && self.aaaa.is_none()
    }
}
