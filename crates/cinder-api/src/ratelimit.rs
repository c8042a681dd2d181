//! Per-source-IP rate limiting
//!
//! Token bucket per client IP. The source is the socket peer address with
//! the port stripped; forwarded-for headers are deliberately ignored since
//! callers can forge them. The visitor table is bounded: overflow evicts
//! the least-recently-seen entry, and a janitor task drops anything idle
//! for five minutes.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Hard cap on tracked IPs; prevents memory exhaustion from address churn.
pub const MAX_VISITORS: usize = 10_000;

const IDLE_EVICTION: Duration = Duration::from_secs(300);
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Visitor {
    tokens: f64,
    last_seen: Instant,
}

/// Token-bucket limiter keyed by client IP.
pub struct IpRateLimiter {
    visitors: DashMap<IpAddr, Visitor>,
    rps: f64,
    burst: f64,
    janitor_cancel: CancellationToken,
}

impl IpRateLimiter {
    /// Build the limiter and start its eviction janitor.
    pub fn new(rps: f64, burst: u32) -> Arc<Self> {
        let limiter = Arc::new(Self {
            visitors: DashMap::new(),
            rps: rps.max(0.0),
            burst: f64::from(burst.max(1)),
            janitor_cancel: CancellationToken::new(),
        });

        let janitor = Arc::clone(&limiter);
        let cancel = limiter.janitor_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(JANITOR_INTERVAL) => {
                        janitor
                            .visitors
                            .retain(|_, v| v.last_seen.elapsed() <= IDLE_EVICTION);
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });

        limiter
    }

    /// Admit or reject one request from `ip`.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();

        if !self.visitors.contains_key(&ip) && self.visitors.len() >= MAX_VISITORS {
            self.evict_oldest();
        }

        let mut visitor = self.visitors.entry(ip).or_insert(Visitor {
            tokens: self.burst,
            last_seen: now,
        });

        let elapsed = now.saturating_duration_since(visitor.last_seen).as_secs_f64();
        visitor.last_seen = now;
        visitor.tokens = (visitor.tokens + elapsed * self.rps).min(self.burst);

        if visitor.tokens < 1.0 {
            return false;
        }
        visitor.tokens -= 1.0;
        true
    }

    pub fn visitor_count(&self) -> usize {
        self.visitors.len()
    }

    /// Stop the janitor task.
    pub fn shutdown(&self) {
        self.janitor_cancel.cancel();
    }

    fn evict_oldest(&self) {
        let oldest = self
            .visitors
            .iter()
            .min_by_key(|entry| entry.value().last_seen)
            .map(|entry| *entry.key());
        if let Some(ip) = oldest {
            self.visitors.remove(&ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test]
    async fn test_burst_then_deny() {
        let limiter = IpRateLimiter::new(1.0, 3);
        let client = ip(1);

        assert!(limiter.check(client));
        assert!(limiter.check(client));
        assert!(limiter.check(client));
        assert!(!limiter.check(client), "burst exhausted");
        limiter.shutdown();
    }

    #[tokio::test]
    async fn test_distinct_ips_have_distinct_buckets() {
        let limiter = IpRateLimiter::new(1.0, 1);
        assert!(limiter.check(ip(1)));
        assert!(!limiter.check(ip(1)));
        assert!(limiter.check(ip(2)), "second ip gets its own bucket");
        limiter.shutdown();
    }

    #[tokio::test]
    async fn test_tokens_refill_over_time() {
        let limiter = IpRateLimiter::new(1000.0, 1);
        let client = ip(1);
        assert!(limiter.check(client));
        assert!(!limiter.check(client));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(limiter.check(client), "refilled at 1000 rps");
        limiter.shutdown();
    }

    #[tokio::test]
    async fn test_tokens_never_exceed_burst() {
        let limiter = IpRateLimiter::new(1000.0, 2);
        let client = ip(1);
        assert!(limiter.check(client));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Long idle refills to burst, not beyond: two admissions, not 50.
        assert!(limiter.check(client));
        assert!(limiter.check(client));
        assert!(!limiter.check(client));
        limiter.shutdown();
    }

    #[tokio::test]
    async fn test_table_bounded_with_lru_eviction() {
        let limiter = IpRateLimiter::new(1.0, 1);

        // Fill with distinct IPv6 addresses to exceed the IPv4 space of the helper.
        for i in 0..MAX_VISITORS {
            let addr = IpAddr::V6(std::net::Ipv6Addr::new(
                0xfd00,
                0,
                0,
                0,
                0,
                0,
                (i >> 16) as u16,
                (i & 0xffff) as u16,
            ));
            limiter.check(addr);
        }
        assert_eq!(limiter.visitor_count(), MAX_VISITORS);

        limiter.check(ip(9));
        assert!(limiter.visitor_count() <= MAX_VISITORS);
        limiter.shutdown();
    }
}
