//! Token-bucket rate limiting and classified retry for outbound API calls.
//!
//! Every collector, LLM provider, and output channel routes its HTTP calls
//! through a [`RateLimiter`] keyed by API name. [`RateLimiter::execute`]
//! classifies failures (429 / 5xx / transient transport vs. anything else),
//! retries with exponential backoff plus jitter, and honors a `Retry-After`
//! hint expressed either as integer seconds or an HTTP-date.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::Mutex;

use crate::error::Result;
use crate::PipelineError;

/// Per-API rate limit policy.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Number of requests allowed per `per`.
    pub rate: u32,
    /// The window the `rate` applies to.
    pub per: Duration,
    /// Whether a `User-Agent` header is mandatory for this API.
    pub user_agent_required: bool,
    /// The `User-Agent` value to attach when required.
    pub user_agent: Option<String>,
}

impl RateLimitConfig {
    /// Build a config with no user-agent requirement.
    pub fn new(rate: u32, per: Duration) -> Self {
        Self {
            rate,
            per,
            user_agent_required: false,
            user_agent: None,
        }
    }

    /// Attach a mandatory `User-Agent`.
    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent_required = true;
        self.user_agent = Some(ua.into());
        self
    }
}

/// Built-in per-API defaults, matching the original deployment's seed table.
pub fn default_configs() -> HashMap<String, RateLimitConfig> {
    let mut m = HashMap::new();
    m.insert(
        "sec".to_string(),
        RateLimitConfig::new(10, Duration::from_secs(1))
            .with_user_agent("NewsDigest/1.0 (contact@example.com)"),
    );
    m.insert(
        "finnhub".to_string(),
        RateLimitConfig::new(60, Duration::from_secs(60)),
    );
    m.insert(
        "notion".to_string(),
        RateLimitConfig::new(3, Duration::from_secs(1)),
    );
    m.insert(
        "telegram".to_string(),
        RateLimitConfig::new(30, Duration::from_secs(1)),
    );
    m.insert(
        "gemini".to_string(),
        RateLimitConfig::new(60, Duration::from_secs(60)),
    );
    m.insert(
        "openai".to_string(),
        RateLimitConfig::new(60, Duration::from_secs(60)),
    );
    m.insert(
        "claude".to_string(),
        RateLimitConfig::new(60, Duration::from_secs(60)),
    );
    m
}

/// A simple token bucket refilled continuously at `rate / per`.
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig) -> Self {
        let capacity = config.rate as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: capacity / config.per.as_secs_f64(),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Returns `Some(wait)` if a token is not yet available, `None` if one was consumed.
    fn try_consume(&mut self) -> Option<Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

/// Parse a `Retry-After` header value as either integer seconds or an HTTP-date.
///
/// Returns the duration to wait from "now". An HTTP-date in the past yields
/// `Duration::ZERO` rather than a negative wait.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    if let Ok(when) = httpdate::parse_http_date(value) {
        let now = SystemTime::now();
        return Some(when.duration_since(now).unwrap_or(Duration::ZERO));
    }

    None
}

/// Compute the backoff wait for a given attempt, honoring a `Retry-After` floor.
///
/// `wait = min(60s, 2^attempt * U(0.75, 1.25))`, raised to `retry_after` when present.
pub fn compute_backoff(attempt: u32, retry_after: Option<Duration>) -> Duration {
    let base = 2f64.powi(attempt as i32) * (0.75 + fastrand::f64() * 0.5);
    let capped = Duration::from_secs_f64(base.min(60.0));
    match retry_after {
        Some(ra) if ra > capped => ra,
        _ => capped,
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Shared, process-wide rate limiter covering every registered API.
pub struct RateLimiter {
    buckets: HashMap<String, Arc<Mutex<TokenBucket>>>,
    configs: HashMap<String, RateLimitConfig>,
}

impl RateLimiter {
    /// Build a limiter from an explicit config table.
    pub fn new(configs: HashMap<String, RateLimitConfig>) -> Self {
        let buckets = configs
            .iter()
            .map(|(name, cfg)| (name.clone(), Arc::new(Mutex::new(TokenBucket::new(cfg)))))
            .collect();
        Self { buckets, configs }
    }

    /// Build a limiter seeded with [`default_configs`].
    pub fn with_defaults() -> Self {
        Self::new(default_configs())
    }

    /// Look up the policy for an API, if registered.
    pub fn config(&self, api: &str) -> Option<&RateLimitConfig> {
        self.configs.get(api)
    }

    /// Block until a token is available for `api`. Unregistered APIs are unlimited.
    pub async fn acquire(&self, api: &str) {
        let Some(bucket) = self.buckets.get(api) else {
            return;
        };
        loop {
            let wait = {
                let mut b = bucket.lock().await;
                b.try_consume()
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    /// Run `op` under the rate limit for `api`, retrying on classified transient
    /// failures up to `max_retries` times with exponential backoff.
    ///
    /// `op` must surface failures as [`PipelineError::HttpError`] (status + optional
    /// `retry_after`) for retry classification to apply; any other error is
    /// propagated immediately without retry.
    pub async fn execute<F, Fut, T>(&self, api: &str, max_retries: u32, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(cfg) = self.config(api) {
            if cfg.user_agent_required && cfg.user_agent.is_none() {
                return Err(PipelineError::InvalidConfig(format!(
                    "API '{api}' requires a User-Agent but none is configured"
                )));
            }
        }

        let mut attempt = 0;
        let mut last_retry_after: Option<Duration> = None;
        loop {
            self.acquire(api).await;

            match op().await {
                Ok(v) => return Ok(v),
                Err(PipelineError::HttpError {
                    status,
                    retry_after,
                    body,
                }) if is_retryable_status(status) => {
                    last_retry_after = retry_after;
                    if attempt >= max_retries {
                        return Err(PipelineError::RateLimited {
                            api: api.to_string(),
                            attempts: attempt + 1,
                            retry_after: last_retry_after,
                        });
                    }
                    let wait = compute_backoff(attempt, retry_after);
                    tracing::debug!(api, status, attempt, wait_ms = wait.as_millis() as u64, body, "retrying after transient failure");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(PipelineError::Request(e)) => {
                    if attempt >= max_retries {
                        return Err(PipelineError::RateLimited {
                            api: api.to_string(),
                            attempts: attempt + 1,
                            retry_after: last_retry_after,
                        });
                    }
                    let wait = compute_backoff(attempt, None);
                    tracing::debug!(api, attempt, error = %e, "retrying after transport error");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// The configured `User-Agent` for `api`, if any. Collectors that must set
    /// a `User-Agent` header (e.g. SEC EDGAR) read this to attach it consistently
    /// with the policy `execute` enforces.
    pub fn user_agent(&self, api: &str) -> Option<&str> {
        self.configs.get(api)?.user_agent.as_deref()
    }
}
