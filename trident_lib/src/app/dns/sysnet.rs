use std::net::UdpSocket;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use once_cell::sync::{Lazy, OnceCell};

use super::IpOption;

/// Probe results go stale this fast on machines whose network flaps.
const PROBE_TTL: Duration = Duration::from_millis(100);

const PROBE_V4: &str = "8.8.8.8:53";
const PROBE_V6: &str = "[2001:4860:4860::8888]:53";

static PROBE: Lazy<NetworkProbe> = Lazy::new(NetworkProbe::default);

/// Which address families can currently reach the outside world. Desktop
/// and mobile targets revalidate on a short TTL; server targets probe once
/// per process.
pub fn available_families() -> IpOption {
    PROBE.get()
}

#[derive(Default)]
struct NetworkProbe {
    cached: RwLock<Option<(Instant, IpOption)>>,
    fixed: OnceCell<IpOption>,
}

impl NetworkProbe {
    fn get(&self) -> IpOption {
        if cfg!(any(
            target_os = "windows",
            target_os = "macos",
            target_os = "ios",
            target_os = "android"
        )) {
            self.revalidating()
        } else {
            *self.fixed.get_or_init(probe)
        }
    }

    fn revalidating(&self) -> IpOption {
        let now = Instant::now();
        if let Some((at, opt)) = *self.cached.read().unwrap() {
            if now.duration_since(at) < PROBE_TTL {
                return opt;
            }
        }

        let mut cached = self.cached.write().unwrap();
        // double-checked: another caller may have refreshed while we waited
        if let Some((at, opt)) = *cached {
            if now.duration_since(at) < PROBE_TTL {
                return opt;
            }
        }
        let opt = probe();
        *cached = Some((Instant::now(), opt));
        opt
    }
}

fn probe() -> IpOption {
    IpOption {
        ipv4: probe_family("0.0.0.0:0", PROBE_V4),
        ipv6: probe_family("[::]:0", PROBE_V6),
        fake_enable: false,
    }
}

/// Connecting a UDP socket does no I/O; it only asks the stack for a
/// route, which is exactly the question.
fn probe_family(bind: &str, target: &str) -> bool {
    UdpSocket::bind(bind)
        .and_then(|socket| socket.connect(target))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_is_stable_and_cheap() {
        let first = available_families();
        for _ in 0..50 {
            assert_eq!(available_families(), first);
        }
    }

    #[test]
    fn test_probe_v4_loopback_available() {
        // every test environment routes v4 somewhere
        assert!(probe_family("0.0.0.0:0", PROBE_V4));
    }
}
