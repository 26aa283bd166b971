use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::Deserialize;
use serde_json::json;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    /// Prepended to every key so several services can share one Redis.
    pub prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 3,
            window: Duration::from_secs(60),
            prefix: "chirp:ratelimit".to_string(),
        }
    }
}

impl RateLimitConfig {
    fn window_chrono(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.window).context("Rate limit window out of range")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitOutcome {
    pub success: bool,
    pub remaining: u32,
    /// When the oldest counted request leaves the window.
    pub reset: DateTime<Utc>,
}

/// Atomic check-and-increment against a sliding window, keyed by caller.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn limit(&self, key: &str) -> Result<RateLimitOutcome>;
}

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
local count = redis.call('ZCARD', key)
local allowed = 0
if count < limit then
  redis.call('ZADD', key, now, ARGV[4])
  count = count + 1
  allowed = 1
end
redis.call('PEXPIRE', key, window)

local reset = now + window
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
  reset = tonumber(oldest[2]) + window
end
return {allowed, limit - count, reset}
"#;

/// Sliding-log limiter running on Upstash Redis over its REST API.
pub struct UpstashRateLimiter {
    client: reqwest::Client,
    url: String,
    token: String,
    config: RateLimitConfig,
}

#[derive(Debug, Deserialize)]
struct UpstashResponse {
    result: Option<Vec<i64>>,
    error: Option<String>,
}

impl UpstashRateLimiter {
    pub fn new(url: String, token: String, config: RateLimitConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            token,
            config,
        }
    }
}

fn parse_upstash_reply(reply: UpstashResponse) -> Result<RateLimitOutcome> {
    if let Some(error) = reply.error {
        return Err(anyhow!("Upstash error: {}", error));
    }

    let values = reply
        .result
        .ok_or_else(|| anyhow!("Upstash reply missing result"))?;
    let &[allowed, remaining, reset_ms] = values.as_slice() else {
        return Err(anyhow!("Unexpected Upstash reply: {:?}", values));
    };

    Ok(RateLimitOutcome {
        success: allowed == 1,
        remaining: remaining.max(0) as u32,
        reset: DateTime::from_timestamp_millis(reset_ms)
            .ok_or_else(|| anyhow!("Invalid reset timestamp {}", reset_ms))?,
    })
}

#[async_trait]
impl RateLimiter for UpstashRateLimiter {
    async fn limit(&self, key: &str) -> Result<RateLimitOutcome> {
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = self.config.window.as_millis() as i64;

        let command = json!([
            "EVAL",
            SLIDING_WINDOW_SCRIPT,
            "1",
            format!("{}:{}", self.config.prefix, key),
            now_ms.to_string(),
            window_ms.to_string(),
            self.config.max_requests.to_string(),
            Uuid::new_v4().to_string(),
        ]);

        let reply: UpstashResponse = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&command)
            .send()
            .await?
            .json()
            .await?;

        parse_upstash_reply(reply)
    }
}

/// Single-process limiter for local development and tests. State is lost on
/// restart and is not shared between replicas.
pub struct MemoryRateLimiter {
    logs: Cache<String, Arc<Mutex<VecDeque<DateTime<Utc>>>>>,
    config: RateLimitConfig,
}

impl MemoryRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let logs = Cache::builder()
            .max_capacity(100_000)
            .time_to_idle(config.window)
            .build();

        Self { logs, config }
    }

    pub async fn limit_at(&self, key: &str, now: DateTime<Utc>) -> Result<RateLimitOutcome> {
        let window = self.config.window_chrono()?;
        let max = self.config.max_requests as usize;

        let log = self
            .logs
            .get_with(key.to_string(), async { Arc::new(Mutex::new(VecDeque::new())) })
            .await;
        let mut log = log.lock().await;

        while log.front().is_some_and(|t| *t <= now - window) {
            log.pop_front();
        }

        let success = log.len() < max;
        if success {
            log.push_back(now);
        }

        let reset = log.front().map(|t| *t + window).unwrap_or(now + window);

        Ok(RateLimitOutcome {
            success,
            remaining: (max - log.len()) as u32,
            reset,
        })
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn limit(&self, key: &str) -> Result<RateLimitOutcome> {
        self.limit_at(key, Utc::now()).await
    }
}
