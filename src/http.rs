use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors surfaced by the outbound HTTP stack. Callers branch on these, so
/// they are tags rather than a stringly error.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("circuit breaker open for {host}: {reason}")]
    CircuitOpen { host: String, reason: String },
    #[error("resource not found")]
    NotFound,
    #[error("upstream returned http {status}")]
    HttpStatus { status: u16 },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("upstream unavailable after {attempts} attempts: {last}")]
    UpstreamUnavailable { attempts: u32, last: String },
}

impl FetchError {
    /// Transient upstream failures worth another attempt. Rate limiting and
    /// breaker rejections are deliberately excluded: the first is a signal to
    /// slow down, the second must not be counted as a further failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout
                | FetchError::Network(_)
                | FetchError::HttpStatus { status: 500..=599 }
        )
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub user_agent: String,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub rate_per_sec: f64,
    pub burst: f64,
    pub per_host: bool,
    pub breaker_threshold: u32,
    pub breaker_recovery: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("wormwatch/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_secs(15),
            max_attempts: 3,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(10),
            rate_per_sec: 20.0,
            burst: 40.0,
            per_host: true,
            breaker_threshold: 5,
            breaker_recovery: Duration::from_secs(30),
        }
    }
}

/// Token bucket; refills continuously at `rate_per_sec` up to `burst`.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    rate_per_sec: f64,
    burst: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            rate_per_sec,
            burst,
            last_refill: now,
        }
    }

    pub fn try_take(&mut self, now: Instant) -> Result<(), u64> {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.burst);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            let retry_after_ms = ((deficit / self.rate_per_sec) * 1000.0).ceil() as u64;
            Err(retry_after_ms.max(1))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// Per-host circuit breaker: closed → open after N consecutive failures,
/// open → half-open after the recovery timeout, half-open admits a single
/// probe whose outcome decides the next state.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    threshold: u32,
    recovery: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, recovery: Duration) -> Self {
        Self {
            state: BreakerState::Closed { failures: 0 },
            threshold: threshold.max(1),
            recovery,
        }
    }

    pub fn try_acquire(&mut self, now: Instant) -> Result<(), String> {
        match self.state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { until } if now < until => Err(format!(
                "open for another {} ms",
                until.duration_since(now).as_millis()
            )),
            BreakerState::Open { .. } => {
                // Recovery elapsed: admit exactly one probe.
                self.state = BreakerState::HalfOpen;
                Ok(())
            }
            BreakerState::HalfOpen => Err("probe already in flight".to_string()),
        }
    }

    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed { failures: 0 };
    }

    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            BreakerState::Closed { failures } => {
                let failures = failures.saturating_add(1);
                if failures >= self.threshold {
                    self.state = BreakerState::Open {
                        until: now + self.recovery,
                    };
                } else {
                    self.state = BreakerState::Closed { failures };
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open {
                    until: now + self.recovery,
                };
            }
            BreakerState::Open { .. } => {}
        }
    }

    #[allow(dead_code)]
    pub fn is_open(&self, now: Instant) -> bool {
        matches!(self.state, BreakerState::Open { until } if now < until)
    }
}

#[derive(Debug, Default)]
pub struct HttpStats {
    pub requests: AtomicU64,
    pub retries: AtomicU64,
    pub failures: AtomicU64,
    pub rate_limited: AtomicU64,
    pub breaker_rejections: AtomicU64,
}

/// Outbound HTTP with the full middleware stack: token-bucket rate limiting,
/// per-host circuit breaking, bounded retries with jittered exponential
/// backoff, and request-scoped telemetry. Every request gets an id that is
/// threaded through all log events; logged URLs have query strings and
/// fragments stripped.
#[derive(Debug)]
pub struct HttpClient {
    inner: reqwest::Client,
    cfg: HttpConfig,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    next_request_id: AtomicU64,
    stats: HttpStats,
}

impl HttpClient {
    pub fn new(cfg: HttpConfig) -> eyre::Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| eyre::eyre!("failed to build http client: {e}"))?;
        Ok(Self {
            inner,
            cfg,
            buckets: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            stats: HttpStats::default(),
        })
    }

    pub fn stats(&self) -> &HttpStats {
        &self.stats
    }

    fn bucket_key(&self, host: &str) -> String {
        if self.cfg.per_host {
            host.to_string()
        } else {
            String::new()
        }
    }

    fn take_token(&self, host: &str) -> Result<(), FetchError> {
        let key = self.bucket_key(host);
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(self.cfg.rate_per_sec, self.cfg.burst, now));
        bucket.try_take(now).map_err(|retry_after_ms| {
            self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
            FetchError::RateLimited { retry_after_ms }
        })
    }

    fn acquire_breaker(&self, host: &str) -> Result<(), FetchError> {
        let now = Instant::now();
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let breaker = breakers.entry(host.to_string()).or_insert_with(|| {
            CircuitBreaker::new(self.cfg.breaker_threshold, self.cfg.breaker_recovery)
        });
        breaker.try_acquire(now).map_err(|reason| {
            self.stats.breaker_rejections.fetch_add(1, Ordering::Relaxed);
            FetchError::CircuitOpen {
                host: host.to_string(),
                reason,
            }
        })
    }

    fn breaker_success(&self, host: &str) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(breaker) = breakers.get_mut(host) {
            breaker.record_success();
        }
    }

    fn breaker_failure(&self, host: &str) {
        let now = Instant::now();
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(breaker) = breakers.get_mut(host) {
            breaker.record_failure(now);
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base_ms = self.cfg.backoff_base.as_millis() as u64;
        let cap_ms = self.cfg.backoff_cap.as_millis() as u64;
        let mut delay = base_ms.saturating_mul(1u64 << exp).min(cap_ms);
        let jitter_window = base_ms.max(1);
        delay = delay
            .saturating_add(rand::thread_rng().gen_range(0..jitter_window))
            .min(cap_ms);
        Duration::from_millis(delay)
    }

    /// GET the URL and decode the body as JSON, applying the middleware
    /// stack. Bearer auth is attached when given.
    pub async fn get_json(
        &self,
        url: reqwest::Url,
        bearer: Option<&str>,
    ) -> Result<serde_json::Value, FetchError> {
        let host = url.host_str().unwrap_or("").to_string();
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let logged_url = sanitize_url(&url);

        self.acquire_breaker(&host)?;
        self.take_token(&host)?;
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(request_id, url = %logged_url, "request start");

        let mut last_err: Option<FetchError> = None;
        for attempt in 1..=self.cfg.max_attempts {
            if attempt > 1 {
                // Re-acquire before each retry so an opened breaker stops the
                // remaining attempts immediately.
                self.acquire_breaker(&host)?;
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
            }

            match self.send_once(&url, bearer).await {
                Ok(body) => {
                    self.breaker_success(&host);
                    tracing::debug!(request_id, url = %logged_url, attempt, "request finish");
                    return Ok(body);
                }
                Err(err) => {
                    let counts_as_failure = matches!(
                        err,
                        FetchError::Timeout
                            | FetchError::Network(_)
                            | FetchError::HttpStatus { status: 500..=599 }
                    );
                    if counts_as_failure {
                        self.breaker_failure(&host);
                    }

                    if !err.is_retryable() || attempt == self.cfg.max_attempts {
                        if err.is_retryable() {
                            // Retries exhausted on a transient error.
                            self.stats.failures.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                request_id,
                                url = %logged_url,
                                attempts = attempt,
                                error = %err,
                                "request error; upstream unavailable"
                            );
                            return Err(FetchError::UpstreamUnavailable {
                                attempts: attempt,
                                last: err.to_string(),
                            });
                        }
                        tracing::debug!(request_id, url = %logged_url, error = %err, "request error");
                        return Err(err);
                    }

                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        request_id,
                        url = %logged_url,
                        attempt,
                        sleep_ms = delay.as_millis() as u64,
                        error = %err,
                        "request failed; retrying"
                    );
                    last_err = Some(err);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        Err(FetchError::UpstreamUnavailable {
            attempts: self.cfg.max_attempts,
            last: last_err.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn send_once(
        &self,
        url: &reqwest::Url,
        bearer: Option<&str>,
    ) -> Result<serde_json::Value, FetchError> {
        let mut req = self
            .inner
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(classify_reqwest_error)?;
        let status = resp.status();

        if status.is_success() {
            return resp
                .json::<serde_json::Value>()
                .await
                .map_err(|e| FetchError::Decode(e.to_string()));
        }

        match status.as_u16() {
            404 => Err(FetchError::NotFound),
            429 => {
                let retry_after_ms = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(|secs| secs * 1000)
                    .unwrap_or(1000);
                Err(FetchError::RateLimited { retry_after_ms })
            }
            code => Err(FetchError::HttpStatus { status: code }),
        }
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(err.to_string())
    }
}

/// URL with query string and fragment stripped, safe for logs.
pub fn sanitize_url(url: &reqwest::Url) -> String {
    let mut clean = url.clone();
    clean.set_query(None);
    clean.set_fragment(None);
    clean.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_allows_burst_then_rejects() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(10.0, 3.0, now);
        assert!(bucket.try_take(now).is_ok());
        assert!(bucket.try_take(now).is_ok());
        assert!(bucket.try_take(now).is_ok());

        let retry_after = bucket.try_take(now).unwrap_err();
        // One token refills in 100 ms at 10 req/s.
        assert!(retry_after <= 100, "retry_after={retry_after}");
    }

    #[test]
    fn bucket_refills_over_time() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(10.0, 1.0, now);
        assert!(bucket.try_take(now).is_ok());
        assert!(bucket.try_take(now).is_err());
        assert!(bucket.try_take(now + Duration::from_millis(150)).is_ok());
    }

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        for _ in 0..4 {
            breaker.record_failure(now);
            assert!(breaker.try_acquire(now).is_ok());
        }
        breaker.record_failure(now);
        assert!(breaker.is_open(now));
        assert!(breaker.try_acquire(now).is_err());
    }

    #[test]
    fn breaker_half_open_admits_single_probe() {
        let now = Instant::now();
        let recovery = Duration::from_secs(30);
        let mut breaker = CircuitBreaker::new(1, recovery);
        breaker.record_failure(now);
        assert!(breaker.try_acquire(now).is_err());

        let later = now + recovery + Duration::from_millis(1);
        assert!(breaker.try_acquire(later).is_ok());
        // Second caller while the probe is outstanding is rejected.
        assert!(breaker.try_acquire(later).is_err());
    }

    #[test]
    fn breaker_probe_success_closes_failure_reopens() {
        let now = Instant::now();
        let recovery = Duration::from_secs(30);
        let mut breaker = CircuitBreaker::new(1, recovery);
        breaker.record_failure(now);

        let later = now + recovery + Duration::from_millis(1);
        assert!(breaker.try_acquire(later).is_ok());
        breaker.record_success();
        assert!(breaker.try_acquire(later).is_ok());

        breaker.record_failure(later);
        assert!(breaker.try_acquire(later + Duration::from_millis(1)).is_err());
        let probe_at = later + recovery + Duration::from_millis(2);
        assert!(breaker.try_acquire(probe_at).is_ok());
        breaker.record_failure(probe_at);
        assert!(breaker.try_acquire(probe_at).is_err());
    }

    #[test]
    fn retryable_classification() {
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::Network("reset".into()).is_retryable());
        assert!(FetchError::HttpStatus { status: 502 }.is_retryable());

        assert!(!FetchError::NotFound.is_retryable());
        assert!(!FetchError::HttpStatus { status: 400 }.is_retryable());
        assert!(!FetchError::RateLimited { retry_after_ms: 100 }.is_retryable());
        assert!(!FetchError::CircuitOpen {
            host: "h".into(),
            reason: "open".into()
        }
        .is_retryable());
    }

    #[test]
    fn sanitize_url_strips_query_and_fragment() {
        let url =
            reqwest::Url::parse("https://api.example.net/path/?token=secret#frag").unwrap();
        assert_eq!(sanitize_url(&url), "https://api.example.net/path/");
    }
}
