use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub tokens_remaining: f64,
}

/// A token bucket keyed per principal: `rps` tokens refill per second, up to
/// `burst` capacity.
#[derive(Debug, Clone, Copy)]
pub struct BucketParams {
    pub rps: u32,
    pub burst: u32,
}

#[async_trait]
pub trait RateLimiterEngine: Send + Sync {
    /// Attempts to take one token from `key`'s bucket. Must fail open: any
    /// transport error is treated as `allowed = true` by the caller, not by
    /// the implementation, so callers can distinguish "denied" from
    /// "couldn't check".
    async fn check(&self, key: &str, params: BucketParams) -> Result<RateDecision>;
}

// ---------------- Redis token-bucket implementation ----------------

/// Atomic CAS-free token bucket, evaluated as a single Lua script so the
/// read-refill-decrement-write cycle never races across gateway replicas.
const TOKEN_BUCKET_SCRIPT: &str = r"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local rps = tonumber(ARGV[2])
local burst = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1]) or burst
local ts = tonumber(state[2]) or now_ms
local delta = math.max(0, now_ms - ts)
local refill = (delta / 1000.0) * rps
tokens = math.min(burst, tokens + refill)
local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end
redis.call('HMSET', key, 'tokens', tokens, 'ts', now_ms)
redis.call('PEXPIRE', key, ttl)
return {allowed, tokens}
";

#[derive(Clone)]
pub struct RedisRateLimiter {
    manager: ConnectionManager,
    script: Arc<Script>,
    prefix: String,
}

impl RedisRateLimiter {
    pub async fn new(redis_url: &str, prefix: String) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to create Redis connection manager")?;
        Ok(Self { manager, script: Arc::new(Script::new(TOKEN_BUCKET_SCRIPT)), prefix })
    }
}

#[async_trait]
impl RateLimiterEngine for RedisRateLimiter {
    async fn check(&self, key: &str, params: BucketParams) -> Result<RateDecision> {
        let redis_key = format!("{}:{}", self.prefix, key);
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let ttl_ms = (2000 + 1000 * params.burst as i64 / params.rps.max(1) as i64).max(2000);
        let mut conn = self.manager.clone();
        let (allowed, tokens): (i64, f64) = self
            .script
            .key(&redis_key)
            .arg(now_ms)
            .arg(params.rps)
            .arg(params.burst)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .context("token bucket script invocation failed")?;
        Ok(RateDecision { allowed: allowed == 1, tokens_remaining: tokens })
    }
}

// ---------------- In-memory fallback/test implementation ----------------

#[derive(Clone)]
pub struct InMemoryRateLimiter {
    inner: Arc<Mutex<HashMap<String, (f64, std::time::Instant)>>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())) }
    }
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterEngine for InMemoryRateLimiter {
    async fn check(&self, key: &str, params: BucketParams) -> Result<RateDecision> {
        let mut guard = self.inner.lock().await;
        let now = std::time::Instant::now();
        let entry = guard
            .entry(key.to_string())
            .or_insert((params.burst as f64, now));
        let delta = now.duration_since(entry.1).as_secs_f64();
        let refill = delta * params.rps as f64;
        let mut tokens = (entry.0 + refill).min(params.burst as f64);
        let allowed = tokens >= 1.0;
        if allowed {
            tokens -= 1.0;
        }
        *entry = (tokens, now);
        Ok(RateDecision { allowed, tokens_remaining: tokens })
    }
}

/// Wraps a Redis-backed limiter with a fail-open fallback, mirroring the
/// original gateway's bare `except Exception: return` behavior: any Redis
/// transport error is logged and treated as an allow.
pub enum RateLimiter {
    Redis(RedisRateLimiter),
    Memory(InMemoryRateLimiter),
}

impl RateLimiter {
    pub async fn redis(redis_url: &str, prefix: String) -> Result<Self> {
        Ok(RateLimiter::Redis(RedisRateLimiter::new(redis_url, prefix).await?))
    }

    pub fn memory() -> Self {
        RateLimiter::Memory(InMemoryRateLimiter::new())
    }

    /// Returns `true` when the request is allowed, failing open (allowing
    /// the request) if the backing store is unreachable.
    pub async fn allow(&self, key: &str, params: BucketParams) -> bool {
        let result = match self {
            RateLimiter::Redis(r) => r.check(key, params).await,
            RateLimiter::Memory(r) => r.check(key, params).await,
        };
        match result {
            Ok(decision) => decision.allowed,
            Err(err) => {
                warn!(error = %err, "rate limiter check failed, failing open");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_bucket_allows_burst_then_throttles() {
        let limiter = InMemoryRateLimiter::new();
        let params = BucketParams { rps: 1, burst: 2 };
        assert!(limiter.check("k", params).await.unwrap().allowed);
        assert!(limiter.check("k", params).await.unwrap().allowed);
        assert!(!limiter.check("k", params).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn in_memory_bucket_refills_over_time() {
        let limiter = InMemoryRateLimiter::new();
        let params = BucketParams { rps: 1000, burst: 1 };
        assert!(limiter.check("k", params).await.unwrap().allowed);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(limiter.check("k", params).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn separate_keys_have_independent_buckets() {
        let limiter = InMemoryRateLimiter::new();
        let params = BucketParams { rps: 1, burst: 1 };
        assert!(limiter.check("a", params).await.unwrap().allowed);
        assert!(limiter.check("b", params).await.unwrap().allowed);
    }
}
