//! Per-key fixed-window admission filter.
//!
//! Deliberately imprecise: the goal is abuse prevention, not accounting.
//! One mutex guards the bucket map; the read-modify-write per request is a
//! single critical section.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use tokio::sync::watch;
use tracing::warn;

use crate::config::RateKeyMode;

/// Longest client-supplied key fragment we keep; anything beyond is noise.
const MAX_KEY_LEN: usize = 128;

/// A network prefix such as `10.0.0.0/8` or a bare address.
#[derive(Clone, Debug)]
pub struct Cidr {
    net: IpAddr,
    prefix: u8,
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let prefix: u8 = prefix
                    .parse()
                    .map_err(|_| format!("bad prefix length in {s}"))?;
                (addr, Some(prefix))
            }
            None => (s, None),
        };
        let net: IpAddr = addr.parse().map_err(|_| format!("bad address in {s}"))?;
        let max = if net.is_ipv4() { 32 } else { 128 };
        let prefix = prefix.unwrap_or(max);
        if prefix > max {
            return Err(format!("prefix /{prefix} too long for {addr}"));
        }
        Ok(Cidr { net, prefix })
    }
}

impl Cidr {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.net, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix as u32)
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix as u32)
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

struct Bucket {
    tokens: u32,
    window_start: Instant,
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    capacity: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(per_minute: u32, burst: u32) -> Self {
        Self::with_window(per_minute, burst, Duration::from_secs(60))
    }

    /// Window length is injectable so tests do not sleep for a minute.
    pub fn with_window(per_minute: u32, burst: u32, window: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity: per_minute.min(burst).max(1),
            window,
        }
    }

    /// Consume one token for `key`, refilling on window rollover.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut map = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = map.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            window_start: now,
        });
        if now.duration_since(bucket.window_start) >= self.window {
            bucket.tokens = self.capacity;
            bucket.window_start = now;
        }
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Drop buckets idle for two full windows to bound memory.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let horizon = self.window * 2;
        let mut map = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, bucket| now.duration_since(bucket.window_start) < horizon);
        before - map.len()
    }

    pub fn spawn_sweep(
        self: &std::sync::Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = std::sync::Arc::clone(self);
        let period = self.window.max(Duration::from_secs(60)) * 5;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        limiter.sweep();
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

/// Derive the admission key for a request.
///
/// Address mode honors `X-Forwarded-For` only when the direct peer sits
/// inside the trusted proxy list; header mode uses an opaque value the
/// client chose, which on its own identifies no person.
pub fn client_key(
    mode: &RateKeyMode,
    peer: Option<SocketAddr>,
    headers: &HeaderMap,
    trusted_proxies: &[Cidr],
) -> String {
    let peer_ip = peer.map(|addr| addr.ip());
    match mode {
        RateKeyMode::Header(name) => {
            if let Some(value) = headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
            {
                let mut key = String::from("h:");
                key.extend(value.chars().take(MAX_KEY_LEN));
                return key;
            }
            address_key(peer_ip)
        }
        RateKeyMode::Address => {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|v| v.trim().parse::<IpAddr>().ok());
            match (peer_ip, forwarded) {
                (Some(peer), Some(fwd))
                    if trusted_proxies.iter().any(|cidr| cidr.contains(peer)) =>
                {
                    address_key(Some(fwd))
                }
                _ => {
                    if forwarded.is_some() && peer_ip.is_some() {
                        warn!(target: "admission", "ignoring forwarded header from untrusted peer");
                    }
                    address_key(peer_ip)
                }
            }
        }
    }
}

fn address_key(ip: Option<IpAddr>) -> String {
    match ip {
        Some(ip) => format!("a:{ip}"),
        None => "a:unknown".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn rejects_after_capacity_within_window() {
        let limiter = RateLimiter::new(3, 10);
        for _ in 0..3 {
            assert!(limiter.allow("k"));
        }
        assert!(!limiter.allow("k"));
        assert!(limiter.allow("other"));
    }

    #[test]
    fn window_rollover_refills() {
        let limiter = RateLimiter::with_window(2, 2, Duration::from_millis(40));
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        std::thread::sleep(Duration::from_millis(50));
        assert!(limiter.allow("k"));
    }

    #[test]
    fn burst_caps_capacity() {
        let limiter = RateLimiter::new(10, 2);
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
    }

    #[test]
    fn sweep_drops_idle_buckets() {
        let limiter = RateLimiter::with_window(5, 5, Duration::from_millis(10));
        limiter.allow("a");
        limiter.allow("b");
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(limiter.sweep(), 2);
    }

    #[test]
    fn cidr_matching() {
        let cidr: Cidr = "10.0.0.0/8".parse().unwrap();
        assert!(cidr.contains("10.1.2.3".parse().unwrap()));
        assert!(!cidr.contains("11.0.0.1".parse().unwrap()));
        let bare: Cidr = "192.168.1.9".parse().unwrap();
        assert!(bare.contains("192.168.1.9".parse().unwrap()));
        assert!(!bare.contains("192.168.1.10".parse().unwrap()));
        let v6: Cidr = "fd00::/8".parse().unwrap();
        assert!(v6.contains("fd00::1".parse().unwrap()));
        assert!(!v6.contains("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn forwarded_header_requires_trusted_peer() {
        let proxies: Vec<Cidr> = vec!["10.0.0.0/8".parse().unwrap()];
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));

        let trusted: SocketAddr = "10.0.0.2:9999".parse().unwrap();
        let key = client_key(&RateKeyMode::Address, Some(trusted), &headers, &proxies);
        assert_eq!(key, "a:203.0.113.7");

        let untrusted: SocketAddr = "198.51.100.4:9999".parse().unwrap();
        let key = client_key(&RateKeyMode::Address, Some(untrusted), &headers, &proxies);
        assert_eq!(key, "a:198.51.100.4");
    }

    #[test]
    fn header_mode_falls_back_to_address() {
        let mode = RateKeyMode::Header("x-client-key".into());
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = "192.0.2.1:1000".parse().unwrap();
        assert_eq!(client_key(&mode, Some(peer), &headers, &[]), "a:192.0.2.1");
        headers.insert("x-client-key", HeaderValue::from_static("abc123"));
        assert_eq!(client_key(&mode, Some(peer), &headers, &[]), "h:abc123");
    }
}
