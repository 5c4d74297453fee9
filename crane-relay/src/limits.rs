//! Connection rate limiting for crane-relay.
//!
//! Protects the relay against a single host opening connections in a tight
//! loop. Peers are keyed by IP address; the keyed limiter is backed by
//! DashMap, and idle keys are evicted by a periodic maintenance task.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Rate limiters for the relay server.
#[derive(Clone)]
pub struct RateLimits {
    /// Limits new connections per remote IP.
    ///
    /// Configured via `limits.connections_per_ip` (per minute).
    connection_limiter: Arc<KeyedLimiter<IpAddr>>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("connection_limiter", &"KeyedLimiter<IpAddr>")
            .field("tracked_ips", &self.connection_limiter.len())
            .finish()
    }
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// A zero quota is treated as one connection per minute; `Config::validate`
    /// rejects it before this point.
    pub fn new(config: &LimitsConfig) -> Self {
        let per_minute = NonZeroU32::new(config.connections_per_ip).unwrap_or(NonZeroU32::MIN);
        Self {
            connection_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute))),
        }
    }

    /// Check if a new connection from `ip` is allowed.
    pub fn check_connection(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        self.connection_limiter
            .check_key(&ip)
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Get the number of tracked IPs (for metrics).
    pub fn tracked_ips(&self) -> usize {
        self.connection_limiter.len()
    }

    /// Evict idle IPs whose quota has fully recharged.
    pub fn shrink(&self) {
        self.connection_limiter.retain_recent();
    }
}

/// Spawn a background task that periodically evicts idle limiter keys.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_maintenance_task(limits: RateLimits, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Limiter maintenance started (interval: {}s)", every.as_secs());
        let mut timer = tokio::time::interval(every);
        // The first tick completes immediately
        timer.tick().await;

        loop {
            timer.tick().await;
            let before = limits.tracked_ips();
            limits.shrink();
            tracing::debug!(
                "Limiter maintenance: {} -> {} tracked IPs",
                before,
                limits.tracked_ips()
            );
        }
    })
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many connection attempts from this IP.
    #[error("connection rate limit exceeded")]
    ConnectionLimitExceeded,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(connections_per_ip: u32) -> LimitsConfig {
        LimitsConfig {
            connections_per_ip,
            max_concurrent_sessions: 10,
        }
    }

    #[test]
    fn connection_limit_allows_within_quota() {
        let limits = RateLimits::new(&test_config(5));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        // First 5 should succeed
        for _ in 0..5 {
            assert!(limits.check_connection(ip).is_ok());
        }

        // 6th should fail
        assert_eq!(
            limits.check_connection(ip),
            Err(RateLimitError::ConnectionLimitExceeded)
        );
    }

    #[test]
    fn different_ips_have_independent_limits() {
        let limits = RateLimits::new(&test_config(2));
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limits.check_connection(a).is_ok());
        assert!(limits.check_connection(a).is_ok());
        assert!(limits.check_connection(a).is_err());

        assert!(limits.check_connection(b).is_ok());
        assert_eq!(limits.tracked_ips(), 2);
    }

    #[test]
    fn zero_quota_still_builds() {
        let limits = RateLimits::new(&test_config(0));
        assert!(limits.check_connection("::1".parse().unwrap()).is_ok());
    }

    #[test]
    fn rate_limits_are_debug() {
        let limits = RateLimits::new(&test_config(5));
        assert!(format!("{:?}", limits).contains("RateLimits"));
    }

    #[test]
    fn shrink_does_not_panic() {
        let limits = RateLimits::new(&test_config(5));
        let _ = limits.check_connection("10.0.0.1".parse().unwrap());
        limits.shrink();
    }

    #[test]
    fn rate_limit_error_display() {
        assert_eq!(
            RateLimitError::ConnectionLimitExceeded.to_string(),
            "connection rate limit exceeded"
        );
    }
}
