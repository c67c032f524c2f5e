use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::pubsub::{PubSub, Subscription};
use super::record::{IpRecord, Record};
use super::server::DnsResult;
use super::{family_suffix_of, IpOption};
use crate::common::singleflight;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
/// Peak size below which an emptied map is not worth reallocating.
const REBUILD_WATERMARK: usize = 512;
/// A shrink starts only once this many entries have drained...
const SHRINK_MIN_DRAINED: usize = 10240;
/// ...and they amount to this share of the historical peak.
const SHRINK_RATIO: f64 = 0.65;
const MIGRATE_BATCH: usize = 4096;

struct CacheState {
    /// Primary map; all writes land here.
    ips: HashMap<String, Record>,
    /// Source map of an in-flight shrink migration; `None` when idle.
    dirty: Option<HashMap<String, Record>>,
    /// Historical peak of `ips`, reset when a shrink starts.
    high_watermark: usize,
}

/// Owns one name server's (domain -> A/AAAA) map: lookups, slot-preserving
/// updates, waiter notification, periodic expiry, and a background shrink
/// that migrates a drained map into a right-sized one without blocking
/// readers.
pub struct CacheController {
    name: String,
    disable_cache: bool,
    serve_stale: bool,
    /// Non-positive offset in seconds; adding it to "now" yields the
    /// effective expiry threshold. Zero means stale entries never age out.
    serve_expired_ttl: i64,
    state: RwLock<CacheState>,
    pubsub: PubSub,
    pub(crate) flight: singleflight::Group<DnsResult>,
    cleanup_running: AtomicBool,
    /// Self-handle for the background tasks this controller spawns.
    weak: Weak<CacheController>,
}

impl CacheController {
    pub fn new(
        name: impl Into<String>,
        disable_cache: bool,
        serve_stale: bool,
        serve_expired_ttl: u32,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name: name.into(),
            disable_cache,
            serve_stale,
            serve_expired_ttl: -i64::from(serve_expired_ttl),
            state: RwLock::new(CacheState {
                ips: HashMap::new(),
                dirty: None,
                high_watermark: 0,
            }),
            pubsub: PubSub::new(),
            flight: singleflight::Group::new(),
            cleanup_running: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn disable_cache(&self) -> bool {
        self.disable_cache
    }

    pub fn serve_stale(&self) -> bool {
        self.serve_stale
    }

    pub fn serve_expired_ttl(&self) -> i64 {
        self.serve_expired_ttl
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read-only lookup; consults the primary map first, then the
    /// migration source if a shrink is in flight.
    pub fn find_records(&self, domain: &str) -> Option<Record> {
        let state = self.read();
        state.ips.get(domain).cloned().or_else(|| {
            state
                .dirty
                .as_ref()
                .and_then(|dirty| dirty.get(domain).cloned())
        })
    }

    /// Installs `rep` under its family slot for `domain`, preserving the
    /// sibling slot from the live entry (or the migration source), then
    /// wakes waiters of the updated family. Waiters of the sibling family
    /// are also woken when that slot already holds live data.
    pub fn update_record(&self, domain: &str, rep: IpRecord) {
        let now = Instant::now();
        let req_type = rep.req_type;
        let rep = Arc::new(rep);

        let sibling = {
            let mut state = self.write();
            let mut entry = match state.ips.get(domain) {
                Some(e) => e.clone(),
                None => state
                    .dirty
                    .as_ref()
                    .and_then(|dirty| dirty.get(domain).cloned())
                    .unwrap_or_default(),
            };
            entry.set_slot(rep.clone());
            let sibling = entry.sibling(req_type).cloned();
            state.ips.insert(domain.to_string(), entry);
            if state.ips.len() > state.high_watermark {
                state.high_watermark = state.ips.len();
            }
            sibling
        };

        debug!(
            server = %self.name,
            domain,
            rtype = %req_type,
            ips = rep.ips.len(),
            "updated dns cache"
        );

        self.pubsub
            .publish(&format!("{}{}", domain, family_suffix_of(req_type)));
        if let Some(sib) = sibling {
            let (_, ttl, err) = sib.get_ips(now);
            if ttl > 0 && err.is_none() {
                self.pubsub
                    .publish(&format!("{}{}", domain, family_suffix_of(sib.req_type)));
            }
        }

        // with an unbounded stale window nothing ever becomes deletable
        if !(self.serve_stale && self.serve_expired_ttl == 0) {
            self.start_cleanup();
        }
    }

    /// Subscribes to the requested family keys. Callers register before
    /// dispatching so a fast answer cannot slip past them.
    pub fn register_subscribers(
        &self,
        domain: &str,
        option: IpOption,
    ) -> (Option<Subscription>, Option<Subscription>) {
        let sub4 = option
            .ipv4
            .then(|| self.pubsub.subscribe(&format!("{}4", domain)));
        let sub6 = option
            .ipv6
            .then(|| self.pubsub.subscribe(&format!("{}6", domain)));
        (sub4, sub6)
    }

    fn start_cleanup(&self) {
        if self.cleanup_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = self.weak.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                let Some(this) = weak.upgrade() else { return };
                if !this.sweep() {
                    // map drained; next update_record restarts us
                    this.cleanup_running.store(false, Ordering::Release);
                    return;
                }
            }
        });
    }

    /// One expiry pass. Returns false once the map is empty so the
    /// periodic task can stand down.
    fn sweep(&self) -> bool {
        let now = Instant::now();
        let threshold = now.checked_sub(Duration::from_secs(-self.serve_expired_ttl as u64));

        let mut expired = Vec::new();
        if let Some(threshold) = threshold {
            let state = self.read();
            for (domain, record) in state.ips.iter() {
                let a_dead = record.a.as_ref().is_some_and(|r| r.expire_at < threshold);
                let aaaa_dead = record
                    .aaaa
                    .as_ref()
                    .is_some_and(|r| r.expire_at < threshold);
                if a_dead || aaaa_dead {
                    expired.push(domain.clone());
                }
            }
        }

        let mut state = self.write();
        if let Some(threshold) = threshold {
            for domain in expired {
                let Some(record) = state.ips.get_mut(&domain) else {
                    continue;
                };
                if record.a.as_ref().is_some_and(|r| r.expire_at < threshold) {
                    record.a = None;
                }
                if record
                    .aaaa
                    .as_ref()
                    .is_some_and(|r| r.expire_at < threshold)
                {
                    record.aaaa = None;
                }
                if record.is_empty() {
                    state.ips.remove(&domain);
                }
            }
        }

        if state.ips.is_empty() && state.dirty.is_none() {
            if state.high_watermark >= REBUILD_WATERMARK {
                debug!(server = %self.name, watermark = state.high_watermark, "rebuilding drained dns cache map");
                state.ips = HashMap::new();
                state.high_watermark = 0;
            }
            return false;
        }

        let live = state.ips.len();
        let drained = state.high_watermark.saturating_sub(live);
        if state.dirty.is_none()
            && drained > SHRINK_MIN_DRAINED
            && drained as f64 > SHRINK_RATIO * state.high_watermark as f64
        {
            debug!(
                server = %self.name,
                live,
                watermark = state.high_watermark,
                "starting dns cache shrink migration"
            );
            let old = std::mem::replace(
                &mut state.ips,
                HashMap::with_capacity(live + live / 10),
            );
            state.dirty = Some(old);
            state.high_watermark = live;
            drop(state);
            self.spawn_migrator();
        }
        true
    }

    /// Moves entries from `dirty` back into `ips` in batches, yielding to
    /// the scheduler between batches. Slots already written to the live
    /// map win over migrated ones.
    fn spawn_migrator(&self) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let worker = tokio::spawn({
                let this = this.clone();
                async move {
                    loop {
                        {
                            let mut state = this.write();
                            let CacheState { ips, dirty, .. } = &mut *state;
                            let Some(src) = dirty.as_mut() else { break };
                            let batch: Vec<String> =
                                src.keys().take(MIGRATE_BATCH).cloned().collect();
                            if batch.is_empty() {
                                *dirty = None;
                                break;
                            }
                            for key in batch {
                                let Some(old) = src.remove(&key) else {
                                    continue;
                                };
                                match ips.get_mut(&key) {
                                    None => {
                                        ips.insert(key, old);
                                    }
                                    Some(current) => {
                                        if current.a.is_none() {
                                            current.a = old.a;
                                        }
                                        if current.aaaa.is_none() {
                                            current.aaaa = old.aaaa;
                                        }
                                    }
                                }
                            }
                        }
                        tokio::task::yield_now().await;
                    }
                }
            });

            if let Err(e) = worker.await {
                if e.is_panic() {
                    error!(server = %this.name, "dns cache migrator panicked");
                } else {
                    warn!(server = %this.name, "dns cache migrator aborted");
                }
                this.write().dirty = None;
            } else {
                debug!(server = %this.name, "dns cache shrink migration finished");
            }
        });
    }

    #[cfg(test)]
    fn migration_in_progress(&self) -> bool {
        self.read().dirty.is_some()
    }

    #[cfg(test)]
    fn lens(&self) -> (usize, usize, usize) {
        let state = self.read();
        (
            state.ips.len(),
            state.dirty.as_ref().map_or(0, HashMap::len),
            state.high_watermark,
        )
    }
}
