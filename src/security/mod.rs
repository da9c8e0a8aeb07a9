//! Per-client request accounting.
//!
//! Every request counts against its client IP in a fixed window. A client
//! that exceeds the window budget is blacklisted for a while and receives
//! `403` until the entry expires. Handlers can also run scoped throttles
//! (forum posting) through the same counters.

use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use moka::future::Cache;

use crate::{config::Config, error::forbidden, identity::ClientIdentity, state::AppState};

const MAX_TRACKED_KEYS: u64 = 100_000;
/// Counters idle this long are dropped; longer than any window in use.
const COUNTER_IDLE: Duration = Duration::from_secs(2 * 60 * 60);

pub const FORUM_POST_WINDOW: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy)]
struct RequestWindow {
    started: Instant,
    count: u64,
}

/// Fixed-window counters plus an IP blacklist. Cheap to clone.
#[derive(Clone)]
pub struct RateLimiter {
    counters: Cache<String, RequestWindow>,
    blacklist: Cache<String, ()>,
    request_limit: u64,
    request_window: Duration,
}

impl RateLimiter {
    pub fn new(request_limit: u64, request_window: Duration, blacklist_ttl: Duration) -> Self {
        Self {
            counters: Cache::builder()
                .max_capacity(MAX_TRACKED_KEYS)
                .time_to_idle(COUNTER_IDLE.max(request_window))
                .build(),
            blacklist: Cache::builder()
                .max_capacity(MAX_TRACKED_KEYS)
                .time_to_live(blacklist_ttl)
                .build(),
            request_limit,
            request_window,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.rate_limit_requests,
            config.rate_limit_window,
            config.blacklist_ttl,
        )
    }

    /// Counts one hit on `key` and returns the count inside the current window.
    ///
    /// The read-modify-write happens inside the cache entry lock, so
    /// concurrent hits on the same key never lose an increment.
    pub async fn hit(&self, key: &str, window: Duration) -> u64 {
        let entry = self
            .counters
            .entry(key.to_string())
            .and_upsert_with(|existing| {
                let now = Instant::now();
                let next = match existing.map(|entry| entry.into_value()) {
                    Some(current) if now.duration_since(current.started) < window => RequestWindow {
                        started: current.started,
                        count: current.count + 1,
                    },
                    _ => RequestWindow {
                        started: now,
                        count: 1,
                    },
                };
                std::future::ready(next)
            })
            .await;
        entry.into_value().count
    }

    /// `true` while `key` is still within `limit` hits per `window`.
    pub async fn allow(&self, scope: &str, key: &str, limit: u64, window: Duration) -> bool {
        self.hit(&format!("{scope}:{key}"), window).await <= limit
    }

    pub async fn is_blacklisted(&self, ip: &str) -> bool {
        self.blacklist.get(ip).await.is_some()
    }

    pub async fn blacklist(&self, ip: &str) {
        self.blacklist.insert(ip.to_string(), ()).await;
    }

    /// Accounts one request from `ip`; `false` means the client is (now) blocked.
    pub async fn admit(&self, ip: &str) -> bool {
        if self.is_blacklisted(ip).await {
            return false;
        }
        if self.allow("requests", ip, self.request_limit, self.request_window).await {
            return true;
        }
        tracing::warn!(ip, limit = self.request_limit, "request budget exceeded, blacklisting client");
        self.blacklist(ip).await;
        false
    }
}

pub async fn ip_guard(
    State(state): State<AppState>,
    client: ClientIdentity,
    request: Request,
    next: Next,
) -> Response {
    if !state.limiter.admit(&client.ip).await {
        return forbidden("Access denied").into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blacklists_after_budget_is_spent() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60), Duration::from_secs(60));

        for _ in 0..3 {
            assert!(limiter.admit("203.0.113.9").await);
        }
        assert!(!limiter.admit("203.0.113.9").await);
        assert!(limiter.is_blacklisted("203.0.113.9").await);
        assert!(limiter.admit("203.0.113.10").await);
    }

    #[tokio::test]
    async fn window_resets_after_it_elapses() {
        let limiter = RateLimiter::new(100, Duration::from_secs(60), Duration::from_secs(60));
        let window = Duration::from_millis(30);

        assert_eq!(limiter.hit("k", window).await, 1);
        assert_eq!(limiter.hit("k", window).await, 2);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(limiter.hit("k", window).await, 1);
    }

    #[tokio::test]
    async fn concurrent_hits_are_all_counted() {
        let limiter = RateLimiter::new(1_000, Duration::from_secs(60), Duration::from_secs(60));
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.hit("shared", Duration::from_secs(60)).await })
            })
            .collect();
        for task in tasks {
            task.await.expect("task");
        }
        assert_eq!(limiter.hit("shared", Duration::from_secs(60)).await, 51);
    }

    #[tokio::test]
    async fn scopes_do_not_share_budgets() {
        let limiter = RateLimiter::new(100, Duration::from_secs(60), Duration::from_secs(60));
        assert!(limiter.allow("forum_post", "user:1", 1, FORUM_POST_WINDOW).await);
        assert!(!limiter.allow("forum_post", "user:1", 1, FORUM_POST_WINDOW).await);
        assert!(limiter.allow("forum_post", "user:2", 1, FORUM_POST_WINDOW).await);
    }
}
