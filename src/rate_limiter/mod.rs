/*!
 * # Admission Control
 *
 * Token-bucket guard placed in front of the refund and webhook endpoints.
 *
 * Handlers depend only on the [`AdmissionControl`] trait. Two backends exist:
 *
 * - [`TokenBucketLimiter`]: process-local buckets in a `DashMap`. Correct for a
 *   single instance only; each replica keeps its own buckets.
 * - [`RedisWindowLimiter`]: fixed-window counters in Redis shared by all
 *   replicas, falling back to local buckets when Redis is unreachable.
 *
 * Keys are composed from [`path_key`] and [`ip_key`], e.g.
 * `path:/api/v1/orders/refund|ip:203.0.113.9`.
 */
use async_trait::async_trait;
use axum::{
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::ErrorResponse;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Helper function to convert a number to a HeaderValue.
fn num_to_header_value<T: ToString>(n: T) -> HeaderValue {
    HeaderValue::from_str(&n.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

/// Bucket sizing: `capacity` tokens, `refill_tokens` restored every `refill_interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    pub capacity: u32,
    pub refill_tokens: u32,
    pub refill_interval: Duration,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_tokens: 10,
            refill_interval: Duration::from_secs(60),
        }
    }
}

/// Result of an admission attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until at least one token is available again
    pub reset_after: Duration,
}

impl Admission {
    /// `x-ratelimit-*` headers; the reset value is an epoch timestamp in seconds.
    pub fn headers(&self) -> HeaderMap {
        let reset_epoch = Utc::now().timestamp() + self.reset_after.as_secs() as i64;
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(HEADER_LIMIT),
            num_to_header_value(self.limit),
        );
        headers.insert(
            HeaderName::from_static(HEADER_REMAINING),
            num_to_header_value(self.remaining),
        );
        headers.insert(
            HeaderName::from_static(HEADER_RESET),
            num_to_header_value(reset_epoch),
        );
        headers
    }

    /// 429 response carrying the rate-limit headers
    pub fn rejection(&self) -> Response {
        let body = ErrorResponse {
            error: "Too Many Requests".to_string(),
            code: "rate_limited".to_string(),
            message: "Rate limit exceeded".to_string(),
            request_id: crate::tracing::current_request_id().map(|rid| rid.0),
            timestamp: Utc::now().to_rfc3339(),
        };
        (StatusCode::TOO_MANY_REQUESTS, self.headers(), Json(body)).into_response()
    }
}

/// Admission gate consulted before expensive or abusable work.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    async fn try_acquire(&self, key: &str) -> Admission;

    /// Forgets per-key state that has refilled completely. Returns how many keys were dropped.
    fn evict_idle(&self) -> usize;
}

#[derive(Debug, Clone)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

/// Process-local token buckets, one per key.
#[derive(Clone)]
pub struct TokenBucketLimiter {
    buckets: Arc<DashMap<String, BucketState>>,
    config: BucketConfig,
}

impl TokenBucketLimiter {
    pub fn new(config: BucketConfig) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            config,
        }
    }

    fn acquire_at(&self, key: &str, now: Instant) -> Admission {
        let config = &self.config;
        let interval = config.refill_interval.max(Duration::from_millis(1));
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketState {
                tokens: config.capacity,
                last_refill: now,
            });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if elapsed >= interval {
            let intervals = (elapsed.as_millis() / interval.as_millis()) as u32;
            let added = intervals.saturating_mul(config.refill_tokens);
            bucket.tokens = config.capacity.min(bucket.tokens.saturating_add(added));
            bucket.last_refill += interval * intervals;
        }

        let allowed = bucket.tokens > 0;
        if allowed {
            bucket.tokens -= 1;
        }

        let reset_after = if bucket.tokens > 0 {
            Duration::ZERO
        } else {
            (bucket.last_refill + interval).saturating_duration_since(now)
        };

        Admission {
            allowed,
            limit: config.capacity,
            remaining: bucket.tokens,
            reset_after,
        }
    }

    /// Drops buckets that would be back at capacity by `now`; a fresh bucket behaves the same.
    fn evict_idle_at(&self, now: Instant) -> usize {
        let config = &self.config;
        let interval = config.refill_interval.max(Duration::from_millis(1));
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let elapsed = now.saturating_duration_since(bucket.last_refill);
            let intervals = (elapsed.as_millis() / interval.as_millis()).min(u32::MAX as u128) as u32;
            let refilled = bucket
                .tokens
                .saturating_add(intervals.saturating_mul(config.refill_tokens));
            refilled < config.capacity
        });
        before.saturating_sub(self.buckets.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

#[async_trait]
impl AdmissionControl for TokenBucketLimiter {
    async fn try_acquire(&self, key: &str) -> Admission {
        let admission = self.acquire_at(key, Instant::now());
        if !admission.allowed {
            debug!(key, "admission denied");
            counter!("storefront_admission_denied_total", 1, "backend" => "memory");
        }
        admission
    }

    fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }
}

/// Fixed-window counters shared through Redis.
#[derive(Clone)]
pub struct RedisWindowLimiter {
    client: Arc<redis::Client>,
    namespace: String,
    config: BucketConfig,
    fallback: TokenBucketLimiter,
}

impl RedisWindowLimiter {
    pub fn new(client: Arc<redis::Client>, namespace: impl Into<String>, config: BucketConfig) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            config,
            fallback: TokenBucketLimiter::new(config),
        }
    }

    async fn check_with_redis<C>(
        conn: &mut C,
        redis_key: &str,
        config: &BucketConfig,
    ) -> Result<Admission, redis::RedisError>
    where
        C: redis::aio::ConnectionLike + Send,
    {
        let window_secs = config.refill_interval.as_secs().max(1);

        let count: i64 = conn.incr(redis_key, 1).await?;
        if count == 1 {
            let _: Result<(), _> = conn.expire(redis_key, window_secs as usize).await;
        }

        let ttl_secs = match conn.ttl::<_, i64>(redis_key).await {
            Ok(ttl) if ttl > 0 => ttl as u64,
            _ => {
                let _: Result<(), _> = conn.expire(redis_key, window_secs as usize).await;
                window_secs
            }
        };

        let limit = config.capacity;
        let allowed = count <= limit as i64;
        let remaining = if allowed {
            limit.saturating_sub(count.max(0) as u32)
        } else {
            0
        };

        Ok(Admission {
            allowed,
            limit,
            remaining,
            reset_after: Duration::from_secs(ttl_secs),
        })
    }
}

#[async_trait]
impl AdmissionControl for RedisWindowLimiter {
    async fn try_acquire(&self, key: &str) -> Admission {
        let redis_key = format!("{}:{}", self.namespace, key);
        let result = match self.client.get_async_connection().await {
            Ok(mut conn) => Self::check_with_redis(&mut conn, &redis_key, &self.config).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(admission) => {
                if !admission.allowed {
                    counter!("storefront_admission_denied_total", 1, "backend" => "redis");
                }
                admission
            }
            Err(err) => {
                warn!("Redis admission check failed, using local buckets: {}", err);
                self.fallback.try_acquire(key).await
            }
        }
    }

    // Redis keys expire on their own; only the fallback buckets need sweeping.
    fn evict_idle(&self) -> usize {
        self.fallback.evict_idle()
    }
}

/// Periodically sweeps idle buckets out of every limiter so per-key state stays bounded.
pub fn spawn_idle_sweeper(
    limiters: Vec<Arc<dyn AdmissionControl>>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted: usize = limiters.iter().map(|limiter| limiter.evict_idle()).sum();
            if evicted > 0 {
                debug!(evicted, "evicted idle admission buckets");
            }
        }
    })
}

/// Builds the admission backend selected by configuration.
pub fn build_admission(
    config: BucketConfig,
    redis: Option<(Arc<redis::Client>, String)>,
) -> Arc<dyn AdmissionControl> {
    match redis {
        Some((client, namespace)) => Arc::new(RedisWindowLimiter::new(client, namespace, config)),
        None => Arc::new(TokenBucketLimiter::new(config)),
    }
}

/// Best-effort client address from proxy headers.
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = forwarded.split(',').next().map(str::trim) {
            if !ip.is_empty() {
                return Some(ip.to_string());
            }
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

pub fn ip_key(ip: Option<&str>) -> String {
    format!("ip:{}", ip.unwrap_or("unknown"))
}

pub fn path_key(path: &str) -> String {
    format!("path:{}", path)
}

pub fn composite_key(parts: &[String]) -> String {
    parts.join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, refill: u32, secs: u64) -> TokenBucketLimiter {
        TokenBucketLimiter::new(BucketConfig {
            capacity,
            refill_tokens: refill,
            refill_interval: Duration::from_secs(secs),
        })
    }

    #[test]
    fn bucket_allows_capacity_then_denies() {
        let limiter = limiter(3, 3, 60);
        let now = Instant::now();

        let remaining: Vec<u32> = (0..3)
            .map(|_| limiter.acquire_at("k", now))
            .inspect(|a| assert!(a.allowed))
            .map(|a| a.remaining)
            .collect();
        assert_eq!(remaining, vec![2, 1, 0]);

        let denied = limiter.acquire_at("k", now);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_after, Duration::from_secs(60));
    }

    #[test]
    fn bucket_refills_in_whole_intervals() {
        let limiter = limiter(2, 1, 10);
        let start = Instant::now();
        assert!(limiter.acquire_at("k", start).allowed);
        assert!(limiter.acquire_at("k", start).allowed);
        assert!(!limiter.acquire_at("k", start + Duration::from_secs(9)).allowed);

        let refilled = limiter.acquire_at("k", start + Duration::from_secs(10));
        assert!(refilled.allowed);
        assert_eq!(refilled.remaining, 0);

        // long idle periods never overfill past capacity
        let later = limiter.acquire_at("k", start + Duration::from_secs(1_000));
        assert!(later.allowed);
        assert_eq!(later.remaining, 1);
    }

    #[test]
    fn idle_buckets_are_evicted_once_refilled() {
        let limiter = limiter(2, 1, 10);
        let start = Instant::now();
        for n in 0..500 {
            assert!(limiter.acquire_at(&format!("ip:{}", n), start).allowed);
        }
        // drained bucket needs two intervals to be full again
        assert!(limiter.acquire_at("ip:hot", start).allowed);
        assert!(limiter.acquire_at("ip:hot", start).allowed);
        assert_eq!(limiter.tracked_keys(), 501);

        assert_eq!(limiter.evict_idle_at(start + Duration::from_secs(5)), 0);
        assert_eq!(limiter.evict_idle_at(start + Duration::from_secs(10)), 500);
        assert_eq!(limiter.tracked_keys(), 1);

        // a still-draining bucket keeps its state
        assert!(!limiter.acquire_at("ip:hot", start + Duration::from_secs(9)).allowed);

        assert_eq!(limiter.evict_idle_at(start + Duration::from_secs(20)), 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_drains_all_limiters() {
        let refunds = Arc::new(limiter(1, 1, 1));
        let webhooks = Arc::new(limiter(1, 1, 1));
        refunds.try_acquire("ip:1").await;
        webhooks.try_acquire("ip:2").await;
        webhooks.try_acquire("ip:3").await;

        let handle = spawn_idle_sweeper(
            vec![refunds.clone() as Arc<dyn AdmissionControl>, webhooks.clone()],
            Duration::from_secs(5),
        );
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(refunds.tracked_keys(), 0);
        assert_eq!(webhooks.tracked_keys(), 0);
        handle.abort();
    }

    #[test]
    fn keys_are_isolated() {
        let limiter = limiter(1, 1, 60);
        let now = Instant::now();
        assert!(limiter.acquire_at("ip:1", now).allowed);
        assert!(!limiter.acquire_at("ip:1", now).allowed);
        assert!(limiter.acquire_at("ip:2", now).allowed);
    }

    #[test]
    fn key_helpers_compose() {
        let key = composite_key(&[path_key("/api/v1/orders/refund"), ip_key(Some("10.0.0.1"))]);
        assert_eq!(key, "path:/api/v1/orders/refund|ip:10.0.0.1");
        assert_eq!(ip_key(None), "ip:unknown");
    }

    #[test]
    fn client_ip_prefers_first_forwarded_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(client_ip(&headers).as_deref(), Some("203.0.113.9"));

        headers.remove("x-forwarded-for");
        assert_eq!(client_ip(&headers).as_deref(), Some("10.0.0.2"));

        assert_eq!(client_ip(&HeaderMap::new()), None);
    }

    #[test]
    fn headers_carry_limit_and_remaining() {
        let admission = Admission {
            allowed: true,
            limit: 10,
            remaining: 7,
            reset_after: Duration::ZERO,
        };
        let headers = admission.headers();
        assert_eq!(headers.get(HEADER_LIMIT).unwrap(), "10");
        assert_eq!(headers.get(HEADER_REMAINING).unwrap(), "7");
        assert!(headers.get(HEADER_RESET).is_some());
    }

    #[tokio::test]
    async fn rejection_is_429_with_headers() {
        let admission = Admission {
            allowed: false,
            limit: 10,
            remaining: 0,
            reset_after: Duration::from_secs(30),
        };
        let response = admission.rejection();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(HEADER_REMAINING).unwrap(), "0");
    }
}
