//! Quota buckets driven by server-reported rate limit headers.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use http::{HeaderMap, HeaderName, Method};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::RateLimiter;
use crate::core::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaBucketConfig {
    /// Limit assumed until the first response reports one.
    pub initial_limit: u32,
    /// Period over which the server replenishes the full limit.
    pub window: Duration,
    pub limit_header: HeaderName,
    pub remaining_header: HeaderName,
}

impl QuotaBucketConfig {
    pub fn new(initial_limit: u32, limit_header: HeaderName, remaining_header: HeaderName) -> Self {
        Self {
            initial_limit,
            window: Duration::from_secs(60),
            limit_header,
            remaining_header,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "initial_limit",
                requirement: "greater than zero",
            });
        }
        if self.window.is_zero() {
            return Err(ConfigError::Invalid {
                field: "window",
                requirement: "greater than zero",
            });
        }
        Ok(())
    }
}

impl Default for QuotaBucketConfig {
    fn default() -> Self {
        Self::new(
            800,
            HeaderName::from_static("ratelimit-limit"),
            HeaderName::from_static("ratelimit-remaining"),
        )
    }
}

#[derive(Debug)]
struct BucketState {
    limit: u32,
    remaining: u32,
    last_grant: Option<Instant>,
}

/// Adaptive token bucket.
///
/// While `remaining > 0` calls are granted immediately. Once it hits zero, calls are spaced
/// `window / limit` apart, and time spent idle is credited back as slots the server has
/// probably refilled on its own clock.
#[derive(Debug)]
pub struct QuotaBucket {
    config: QuotaBucketConfig,
    gate: tokio::sync::Mutex<()>,
    state: Mutex<BucketState>,
}

impl QuotaBucket {
    pub fn new(config: QuotaBucketConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let limit = config.initial_limit;
        Ok(Self {
            config,
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(BucketState {
                limit,
                remaining: limit,
                last_grant: None,
            }),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.state.lock().limit
    }

    pub fn remaining(&self) -> u32 {
        self.state.lock().remaining
    }

    /// Wait until a call may start.
    pub async fn acquire(&self) {
        let _gate = self.gate.lock().await;
        if let Some(delay) = self.admit(Instant::now()) {
            trace!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "quota exhausted, spacing call"
            );
            tokio::time::sleep(delay).await;
        }
        self.state.lock().last_grant = Some(Instant::now());
    }

    fn admit(&self, now: Instant) -> Option<Duration> {
        let mut state = self.state.lock();
        if state.remaining > 0 {
            state.remaining -= 1;
            return None;
        }

        let Some(last_grant) = state.last_grant else {
            state.remaining = state.limit;
            return None;
        };
        let spacing = self.config.window / state.limit.max(1);
        let elapsed = now.saturating_duration_since(last_grant);
        if elapsed < spacing {
            return Some(spacing - elapsed);
        }
        let refilled = (elapsed.as_nanos() / spacing.as_nanos().max(1)).saturating_sub(1);
        state.remaining = u32::try_from(refilled)
            .unwrap_or(u32::MAX)
            .min(state.limit);
        None
    }

    /// Overwrite limit and remaining with reported values. Missing or unparsable values leave
    /// the field unchanged.
    pub fn update(&self, limit: Option<&str>, remaining: Option<&str>) {
        let limit = limit.and_then(|value| parse_count("limit", value));
        let remaining = remaining.and_then(|value| parse_count("remaining", value));
        let mut state = self.state.lock();
        if let Some(limit) = limit {
            state.limit = limit;
        }
        if let Some(remaining) = remaining {
            state.remaining = remaining;
        }
    }

    pub fn update_from_headers(&self, headers: &HeaderMap) {
        let header = |name: &HeaderName| headers.get(name).and_then(|value| value.to_str().ok());
        self.update(
            header(&self.config.limit_header),
            header(&self.config.remaining_header),
        );
    }
}

fn parse_count(field: &'static str, value: &str) -> Option<u32> {
    match value.trim().parse() {
        Ok(count) => Some(count),
        Err(err) => {
            debug!(field, value, error = %err, "ignoring unparsable quota header");
            None
        }
    }
}

impl RateLimiter for QuotaBucket {
    fn perform<F, Fut, R>(&self, op: F) -> impl Future<Output = R> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = R> + Send,
        R: Send,
    {
        async move {
            self.acquire().await;
            op().await
        }
    }
}

/// A global bucket plus optional buckets keyed by HTTP method and endpoint.
#[derive(Debug)]
pub struct QuotaBuckets {
    global: QuotaBucket,
    endpoints: HashMap<(Method, String), QuotaBucket>,
}

impl QuotaBuckets {
    pub fn new(global: QuotaBucketConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            global: QuotaBucket::new(global)?,
            endpoints: HashMap::new(),
        })
    }

    pub fn with_endpoint(
        mut self,
        method: Method,
        endpoint: impl Into<String>,
        config: QuotaBucketConfig,
    ) -> Result<Self, ConfigError> {
        self.endpoints
            .insert((method, endpoint.into()), QuotaBucket::new(config)?);
        Ok(self)
    }

    pub fn global(&self) -> &QuotaBucket {
        &self.global
    }

    pub fn endpoint(&self, method: &Method, endpoint: &str) -> Option<&QuotaBucket> {
        self.endpoints.get(&(method.clone(), endpoint.to_string()))
    }

    /// Wait on the endpoint bucket (if any), then the global one, run `op`, and feed the
    /// returned response headers back into both.
    pub async fn perform<F, Fut, R>(&self, method: &Method, endpoint: &str, op: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = (R, HeaderMap)>,
    {
        let bucket = self.endpoint(method, endpoint);
        if let Some(bucket) = bucket {
            bucket.acquire().await;
        }
        self.global.acquire().await;

        let (result, headers) = op().await;
        if let Some(bucket) = bucket {
            bucket.update_from_headers(&headers);
        }
        self.global.update_from_headers(&headers);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn bucket(limit: u32) -> QuotaBucket {
        QuotaBucket::new(QuotaBucketConfig {
            initial_limit: limit,
            ..QuotaBucketConfig::default()
        })
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_spaces_calls_by_window_over_limit() {
        let bucket = bucket(60);
        let start = Instant::now();
        bucket.acquire().await;
        bucket.update(Some("60"), Some("0"));

        tokio::time::sleep(Duration::from_millis(500)).await;
        bucket.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_is_credited_back_as_slots() {
        let bucket = bucket(60);
        bucket.acquire().await;
        bucket.update(None, Some("0"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        let start = Instant::now();
        bucket.acquire().await;
        assert_eq!(bucket.remaining(), 2);
        bucket.acquire().await;
        bucket.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        bucket.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[test]
    fn unparsable_or_missing_headers_leave_fields_unchanged() {
        let bucket = bucket(800);
        bucket.update(Some("not-a-number"), None);
        assert_eq!(bucket.capacity(), 800);
        assert_eq!(bucket.remaining(), 800);

        let mut headers = HeaderMap::new();
        headers.insert("ratelimit-remaining", HeaderValue::from_static(" 797 "));
        bucket.update_from_headers(&headers);
        assert_eq!(bucket.capacity(), 800);
        assert_eq!(bucket.remaining(), 797);
    }

    #[tokio::test(start_paused = true)]
    async fn endpoint_and_global_buckets_both_gate_and_update() {
        let clips = QuotaBucketConfig::new(
            1,
            HeaderName::from_static("ratelimit-clips-limit"),
            HeaderName::from_static("ratelimit-clips-remaining"),
        );
        let buckets = QuotaBuckets::new(QuotaBucketConfig::default())
            .unwrap()
            .with_endpoint(Method::POST, "helix/clips", clips)
            .unwrap();

        let response = || async {
            let mut headers = HeaderMap::new();
            headers.insert("ratelimit-remaining", HeaderValue::from_static("42"));
            ("created", headers)
        };

        let start = Instant::now();
        let body = buckets.perform(&Method::POST, "helix/clips", response).await;
        assert_eq!(body, "created");
        assert_eq!(buckets.global().remaining(), 42);
        assert_eq!(
            buckets
                .endpoint(&Method::POST, "helix/clips")
                .map(QuotaBucket::remaining),
            Some(0)
        );

        // Unlisted endpoints only consult the global bucket.
        buckets.perform(&Method::GET, "helix/users", response).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        buckets.perform(&Method::POST, "helix/clips", response).await;
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[test]
    fn zero_initial_limit_is_rejected() {
        let config = QuotaBucketConfig {
            initial_limit: 0,
            ..QuotaBucketConfig::default()
        };
        assert!(QuotaBucket::new(config).is_err());
    }
}
