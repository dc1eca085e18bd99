//! HTTP fetching with rotation, retry and adaptive throttling.
//!
//! Every attempt draws a fresh [`CredentialSet`] from the shared
//! [`RotationPool`] and reports its outcome back, so proxy statistics reflect
//! every request the crawler makes.
//!
//! # Retry Strategy
//!
//! - At most `retry_times` attempts in total (3 by default)
//! - Only connection errors, timeouts and statuses in `retry_http_codes`
//!   (5xx, 408, 429 by default) are retried; other 4xx fail immediately
//! - Backoff doubles per attempt from `retry_base_delay_ms`, capped at
//!   `retry_max_delay_ms`, plus up to 250ms of random jitter
//!
//! # Auto-throttle
//!
//! The delay before each request follows observed latency divided by the
//! target concurrency: fast clean responses pull it down toward the configured
//! download delay, slow responses or errors push it up toward the maximum.

use crate::config::CrawlerSettings;
use crate::rotation::{CredentialSet, Outcome, RotationPool};
use rand::{Rng, rng};
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use url::Url;

/// Upper bound on the random jitter added to each backoff.
const MAX_JITTER: Duration = Duration::from_millis(250);

/// Broad failure class of a [`FetchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Timeout,
    HttpError,
    ConnectionError,
    /// The crawler itself refused to send the request.
    Blocked,
}

/// Errors raised while fetching a page.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("connection to {url} failed: {message}")]
    Connection { url: String, message: String },
    #[error("HTTP {status} from {url}")]
    Http {
        url: String,
        status: u16,
        retriable: bool,
    },
    #[error("gave up on {url} after {attempts} attempts")]
    AttemptsExhausted { url: String, attempts: u32 },
    #[error("no eligible proxy available")]
    ProxyExhausted,
    #[error("fetch of {url} cancelled")]
    Cancelled { url: String },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl FetchError {
    /// Classify a transport error from reqwest.
    pub fn from_reqwest(url: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Connection {
                url: url.to_string(),
                message: e.to_string(),
            }
        }
    }

    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Timeout { .. } => FetchErrorKind::Timeout,
            FetchError::Http { .. } => FetchErrorKind::HttpError,
            FetchError::Connection { .. } | FetchError::Client(_) => {
                FetchErrorKind::ConnectionError
            }
            FetchError::AttemptsExhausted { .. }
            | FetchError::ProxyExhausted
            | FetchError::Cancelled { .. } => FetchErrorKind::Blocked,
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::Connection { .. } => true,
            FetchError::Http { retriable, .. } => *retriable,
            FetchError::AttemptsExhausted { .. }
            | FetchError::ProxyExhausted
            | FetchError::Cancelled { .. }
            | FetchError::Client(_) => false,
        }
    }
}

/// A successfully fetched page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub html: String,
    /// URL after redirects.
    pub final_url: Url,
    pub status: u16,
}

/// Which failures are retried and how long to wait between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub retry_codes: HashSet<u16>,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &CrawlerSettings) -> Self {
        Self {
            max_attempts: settings.retry_times.max(1),
            retry_codes: settings.retry_http_codes.iter().copied().collect(),
            base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            max_delay: Duration::from_millis(settings.retry_max_delay_ms),
        }
    }

    pub fn is_retriable_status(&self, status: u16) -> bool {
        self.retry_codes.contains(&status)
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
    ///
    /// ```text
    /// delay = min(base_delay * 2^(attempt-1), max_delay) + jitter(0..=min(250ms, base_delay))
    /// ```
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        let delay = self.base_delay.saturating_mul(1 << exponent).min(self.max_delay);
        let jitter_cap = MAX_JITTER.min(self.base_delay).as_millis() as u64;
        let jitter_ms: u64 = rng().random_range(0..=jitter_cap);
        delay + Duration::from_millis(jitter_ms)
    }
}

/// Process-wide request delay that adapts to how the target responds.
#[derive(Debug)]
pub struct AutoThrottle {
    enabled: bool,
    randomize: bool,
    min_delay: Duration,
    max_delay: Duration,
    target_concurrency: f64,
    delay: Mutex<Duration>,
}

impl AutoThrottle {
    pub fn from_settings(settings: &CrawlerSettings) -> Self {
        let auto = &settings.autothrottle;
        let min_delay = Duration::from_millis(settings.download_delay_ms);
        let max_delay = Duration::from_millis(auto.max_delay_ms).max(min_delay);
        let start = if auto.enabled {
            Duration::from_millis(auto.start_delay_ms).clamp(min_delay, max_delay)
        } else {
            min_delay
        };
        Self {
            enabled: auto.enabled,
            randomize: settings.randomize_delay,
            min_delay,
            max_delay,
            target_concurrency: auto.target_concurrency.max(0.1),
            delay: Mutex::new(start),
        }
    }

    pub fn current_delay(&self) -> Duration {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delay to sleep before the next request, randomized if configured.
    pub fn next_delay(&self) -> Duration {
        let base = self.current_delay();
        if self.randomize && !base.is_zero() {
            base.mul_f64(rng().random_range(0.5..1.5))
        } else {
            base
        }
    }

    /// Feed back the latency of a finished attempt.
    pub fn observe(&self, latency: Duration, ok: bool) {
        if !self.enabled {
            return;
        }
        let mut delay = self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        let target = latency.div_f64(self.target_concurrency);
        let mut next = ((*delay + target) / 2).max(target);
        if !ok {
            // Error pages are fast; never let them shrink the delay.
            next = next.max(delay.saturating_mul(2));
        }
        let next = next.clamp(self.min_delay, self.max_delay);
        if next != *delay {
            debug!(old = ?*delay, new = ?next, ?latency, ok, "Auto-throttle adjusted delay");
        }
        *delay = next;
    }
}

/// Fetches pages through the rotation pool with retry and throttling.
#[derive(Debug)]
pub struct FetchClient {
    direct: Client,
    proxied: Mutex<HashMap<String, Client>>,
    pool: Arc<RotationPool>,
    headers: HeaderMap,
    timeout: Duration,
    retry: RetryPolicy,
    throttle: AutoThrottle,
}

impl FetchClient {
    pub fn new(settings: &CrawlerSettings, pool: Arc<RotationPool>) -> Result<Self, FetchError> {
        let headers = default_headers(&settings.default_headers);
        let timeout = Duration::from_secs(settings.timeout_secs);
        let direct = build_client(&headers, timeout, None)?;
        Ok(Self {
            direct,
            proxied: Mutex::new(HashMap::new()),
            pool,
            headers,
            timeout,
            retry: RetryPolicy::from_settings(settings),
            throttle: AutoThrottle::from_settings(settings),
        })
    }

    pub fn pool(&self) -> &Arc<RotationPool> {
        &self.pool
    }

    pub fn throttle(&self) -> &AutoThrottle {
        &self.throttle
    }

    /// Fetch `url`, retrying transient failures.
    ///
    /// Once `cancel` fires no further attempt is sent; throttle and backoff
    /// sleeps are cut short. An attempt already on the wire runs to completion.
    ///
    /// # Errors
    ///
    /// The last attempt's [`FetchError`] once the retry budget is spent, the
    /// first non-retriable error, or [`FetchError::Cancelled`].
    #[instrument(level = "info", skip_all, fields(%url))]
    pub async fn fetch(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<FetchedPage, FetchError> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let delay = self.throttle.next_delay();
            if !pause(delay, cancel).await {
                debug!(attempt, "Cancelled before sending");
                return Err(FetchError::Cancelled {
                    url: url.to_string(),
                });
            }
            let credential = self.pool.acquire(url.as_str())?;

            let attempt_t0 = Instant::now();
            let result = self.attempt(url, &credential).await;
            let latency = attempt_t0.elapsed();

            let err = match result {
                Ok(page) => {
                    self.pool.report(&credential, Outcome::Success);
                    self.throttle.observe(latency, true);
                    debug!(
                        attempt,
                        status = page.status,
                        bytes = page.html.len(),
                        elapsed_ms = latency.as_millis() as u64,
                        "Fetched page"
                    );
                    return Ok(page);
                }
                Err((err, outcome)) => {
                    self.pool.report(&credential, outcome);
                    self.throttle.observe(latency, false);
                    err
                }
            };

            if !err.is_retriable() {
                warn!(attempt, error = %err, "Fetch failed; not retriable");
                return Err(err);
            }

            if attempt >= self.retry.max_attempts {
                error!(
                    attempt,
                    max = self.retry.max_attempts,
                    elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                    error = %err,
                    "Fetch exhausted retries"
                );
                return Err(err);
            }

            let backoff = self.retry.backoff(attempt);
            warn!(
                attempt,
                max = self.retry.max_attempts,
                ?backoff,
                proxy = ?credential.proxy,
                error = %err,
                "Fetch attempt failed; backing off"
            );
            if !pause(backoff, cancel).await {
                debug!(attempt, "Cancelled during backoff");
                return Err(FetchError::Cancelled {
                    url: url.to_string(),
                });
            }
        }
    }

    async fn attempt(
        &self,
        url: &Url,
        credential: &CredentialSet,
    ) -> Result<FetchedPage, (FetchError, Outcome)> {
        let client = self
            .client_for(credential)
            .map_err(|e| (e, Outcome::HardFailure))?;

        let response = client
            .get(url.clone())
            .header(USER_AGENT, credential.user_agent.as_str())
            .send()
            .await
            .map_err(|e| (FetchError::from_reqwest(url.as_str(), e), Outcome::HardFailure))?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let html = response
            .text()
            .await
            .map_err(|e| (FetchError::from_reqwest(url.as_str(), e), Outcome::HardFailure))?;

        if (200..300).contains(&status) {
            return Ok(FetchedPage {
                html,
                final_url,
                status,
            });
        }

        let outcome = failure_outcome(status, &html);
        Err((
            FetchError::Http {
                url: url.to_string(),
                status,
                retriable: self.retry.is_retriable_status(status),
            },
            outcome,
        ))
    }

    fn client_for(&self, credential: &CredentialSet) -> Result<Client, FetchError> {
        let Some(proxy) = credential.proxy.as_deref() else {
            return Ok(self.direct.clone());
        };
        let mut clients = self.proxied.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(proxy) {
            return Ok(client.clone());
        }
        let client = build_client(&self.headers, self.timeout, Some(proxy))?;
        clients.insert(proxy.to_string(), client.clone());
        Ok(client)
    }
}

/// Sleep for `delay` unless `cancel` fires first; `false` means cancelled.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if delay.is_zero() {
        return true;
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(delay) => true,
    }
}

/// How a non-2xx answer reflects on the proxy that carried it.
///
/// A 5xx with no payload usually means the proxy itself gave up; anything
/// with a body came from the target.
fn failure_outcome(status: u16, body: &str) -> Outcome {
    if status >= 500 && body.trim().is_empty() {
        Outcome::HardFailure
    } else {
        Outcome::SoftFailure
    }
}

fn default_headers(configured: &std::collections::BTreeMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in configured {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid default header"),
        }
    }
    headers
}

fn build_client(
    headers: &HeaderMap,
    timeout: Duration,
    proxy: Option<&str>,
) -> Result<Client, FetchError> {
    let mut builder = Client::builder()
        .default_headers(headers.clone())
        .timeout(timeout)
        .gzip(true)
        .brotli(true)
        .deflate(true);
    builder = match proxy {
        Some(address) => builder.proxy(reqwest::Proxy::all(address).map_err(FetchError::Client)?),
        // Direct means direct: ignore HTTP_PROXY and friends.
        None => builder.no_proxy(),
    };
    builder.build().map_err(FetchError::Client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoThrottleSettings, ProxySettings, UserAgentSettings};
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::response::{Html, IntoResponse, Response};
    use axum::routing::get;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Hits {
        flaky: Arc<AtomicUsize>,
        missing: Arc<AtomicUsize>,
        down: Arc<AtomicUsize>,
    }

    async fn ok_handler(headers: AxumHeaders) -> Html<String> {
        let ua = headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        Html(format!("<html><body><p>{ua}</p></body></html>"))
    }

    async fn flaky_handler(State(hits): State<Hits>) -> Response {
        if hits.flaky.fetch_add(1, Ordering::SeqCst) == 0 {
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        } else {
            Html("<html><body>recovered</body></html>").into_response()
        }
    }

    async fn missing_handler(State(hits): State<Hits>) -> Response {
        hits.missing.fetch_add(1, Ordering::SeqCst);
        (StatusCode::NOT_FOUND, "gone").into_response()
    }

    async fn down_handler(State(hits): State<Hits>) -> Response {
        hits.down.fetch_add(1, Ordering::SeqCst);
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }

    async fn busy_handler() -> Response {
        (StatusCode::SERVICE_UNAVAILABLE, Html("<html>busy</html>")).into_response()
    }

    async fn spawn_test_server() -> (String, Hits, tokio::task::JoinHandle<()>) {
        let hits = Hits::default();
        let app = Router::new()
            .route("/ok", get(ok_handler))
            .route("/flaky", get(flaky_handler))
            .route("/missing", get(missing_handler))
            .route("/down", get(down_handler))
            .route("/busy", get(busy_handler))
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let address = listener.local_addr().expect("local addr should exist");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("server should run");
        });
        (format!("http://{address}"), hits, handle)
    }

    fn fast_settings() -> CrawlerSettings {
        CrawlerSettings {
            download_delay_ms: 0,
            randomize_delay: false,
            timeout_secs: 5,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            autothrottle: AutoThrottleSettings {
                enabled: false,
                ..AutoThrottleSettings::default()
            },
            ..CrawlerSettings::default()
        }
    }

    fn client(settings: &CrawlerSettings) -> FetchClient {
        let pool = Arc::new(RotationPool::new(
            &ProxySettings::default(),
            &UserAgentSettings::default(),
            settings.max_attempts_per_url,
        ));
        FetchClient::new(settings, pool).expect("client should build")
    }

    #[tokio::test]
    async fn fetch_returns_body_and_sends_rotated_user_agent() {
        let (base, _hits, server) = spawn_test_server().await;
        let client = client(&fast_settings());
        let url = Url::parse(&format!("{base}/ok")).unwrap();

        let page = client
            .fetch(&url, &CancellationToken::new())
            .await
            .expect("fetch should succeed");

        assert_eq!(page.status, 200);
        assert_eq!(page.final_url, url);
        assert!(page.html.contains("Mozilla/5.0"));
        server.abort();
    }

    #[tokio::test]
    async fn fetch_retries_transient_status() {
        let (base, hits, server) = spawn_test_server().await;
        let client = client(&fast_settings());
        let url = Url::parse(&format!("{base}/flaky")).unwrap();

        let page = client
            .fetch(&url, &CancellationToken::new())
            .await
            .expect("second attempt should succeed");

        assert!(page.html.contains("recovered"));
        assert_eq!(hits.flaky.load(Ordering::SeqCst), 2);
        server.abort();
    }

    #[tokio::test]
    async fn fetch_does_not_retry_plain_4xx() {
        let (base, hits, server) = spawn_test_server().await;
        let client = client(&fast_settings());
        let url = Url::parse(&format!("{base}/missing")).unwrap();

        let err = client
            .fetch(&url, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Http { status: 404, retriable: false, .. }));
        assert_eq!(err.kind(), FetchErrorKind::HttpError);
        assert_eq!(hits.missing.load(Ordering::SeqCst), 1);
        server.abort();
    }

    #[tokio::test]
    async fn fetch_stops_after_retry_budget() {
        let (base, hits, server) = spawn_test_server().await;
        let client = client(&fast_settings());
        let url = Url::parse(&format!("{base}/down")).unwrap();

        let err = client
            .fetch(&url, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Http { status: 503, retriable: true, .. }));
        assert_eq!(hits.down.load(Ordering::SeqCst), 3);
        assert_eq!(client.pool().attempts_for(url.as_str()), 3);
        server.abort();
    }

    #[tokio::test]
    async fn fetch_classifies_refused_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);
        let client = client(&fast_settings());
        let url = Url::parse(&format!("http://{address}/nothing")).unwrap();

        let err = client
            .fetch(&url, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FetchErrorKind::ConnectionError);
        assert!(err.is_retriable());
        assert_eq!(client.pool().attempts_for(url.as_str()), 3);
    }

    #[tokio::test]
    async fn fetch_respects_per_url_attempt_cap() {
        let (base, hits, server) = spawn_test_server().await;
        let settings = CrawlerSettings {
            max_attempts_per_url: 2,
            ..fast_settings()
        };
        let client = client(&settings);
        let url = Url::parse(&format!("{base}/down")).unwrap();

        let err = client
            .fetch(&url, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::AttemptsExhausted { attempts: 2, .. }));
        assert_eq!(hits.down.load(Ordering::SeqCst), 2);
        server.abort();
    }

    #[tokio::test]
    async fn fetch_sends_nothing_once_cancelled() {
        let (base, hits, server) = spawn_test_server().await;
        let client = client(&fast_settings());
        let url = Url::parse(&format!("{base}/down")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client.fetch(&url, &cancel).await.unwrap_err();

        assert!(matches!(err, FetchError::Cancelled { .. }));
        assert!(!err.is_retriable());
        assert_eq!(hits.down.load(Ordering::SeqCst), 0);
        assert_eq!(client.pool().attempts_for(url.as_str()), 0);
        server.abort();
    }

    #[tokio::test]
    async fn fetch_cancel_cuts_backoff_short() {
        let (base, hits, server) = spawn_test_server().await;
        let settings = CrawlerSettings {
            retry_times: 5,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 5000,
            ..fast_settings()
        };
        let client = client(&settings);
        let url = Url::parse(&format!("{base}/down")).unwrap();
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            stopper.cancel();
        });

        let started = Instant::now();
        let err = client.fetch(&url, &cancel).await.unwrap_err();

        assert!(matches!(err, FetchError::Cancelled { .. }));
        assert_eq!(hits.down.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(900));
        server.abort();
    }

    /// A client whose only proxy is the test server itself; plain-HTTP
    /// targets then arrive there in absolute form and route by path.
    fn proxied_client(proxy: &str) -> FetchClient {
        let settings = fast_settings();
        let proxies = ProxySettings {
            enabled: true,
            proxies: vec![proxy.to_string()],
            max_fail_times: 3,
            ..ProxySettings::default()
        };
        let pool = Arc::new(RotationPool::new(
            &proxies,
            &UserAgentSettings::default(),
            settings.max_attempts_per_url,
        ));
        FetchClient::new(&settings, pool).expect("client should build")
    }

    #[tokio::test]
    async fn empty_5xx_through_proxy_counts_as_hard_failure() {
        let (base, hits, server) = spawn_test_server().await;
        let client = proxied_client(&base);
        let url = Url::parse("http://news.invalid/down").unwrap();

        client
            .fetch(&url, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(hits.down.load(Ordering::SeqCst), 3);
        assert!(client.pool().is_evicted(&base));
        assert!(client.pool().proxies().is_empty());
        server.abort();
    }

    #[tokio::test]
    async fn answered_failures_through_proxy_are_soft() {
        let (base, _hits, server) = spawn_test_server().await;
        let client = proxied_client(&base);
        let cancel = CancellationToken::new();

        let busy = Url::parse("http://news.invalid/busy").unwrap();
        client.fetch(&busy, &cancel).await.unwrap_err();
        let missing = Url::parse("http://news.invalid/missing").unwrap();
        client.fetch(&missing, &cancel).await.unwrap_err();

        let records = client.pool().proxies();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fail_count, 4);
        assert_eq!(records[0].consecutive_fails, 0);
        assert!(!client.pool().is_evicted(&base));
        server.abort();
    }

    #[test]
    fn test_failure_outcome_by_status_and_body() {
        assert_eq!(failure_outcome(503, ""), Outcome::HardFailure);
        assert_eq!(failure_outcome(502, "  \n"), Outcome::HardFailure);
        assert_eq!(failure_outcome(503, "<html>busy</html>"), Outcome::SoftFailure);
        assert_eq!(failure_outcome(403, ""), Outcome::SoftFailure);
        assert_eq!(failure_outcome(404, "gone"), Outcome::SoftFailure);
        assert_eq!(failure_outcome(429, ""), Outcome::SoftFailure);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            retry_codes: HashSet::new(),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(200));
        let second = policy.backoff(2);
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(300));
        let capped = policy.backoff(10);
        assert!(capped >= Duration::from_millis(300) && capped <= Duration::from_millis(400));
    }

    #[test]
    fn test_retriable_status_set() {
        let policy = RetryPolicy::from_settings(&CrawlerSettings::default());
        for status in [500, 502, 503, 504, 408, 429] {
            assert!(policy.is_retriable_status(status));
        }
        for status in [400, 403, 404, 410] {
            assert!(!policy.is_retriable_status(status));
        }
    }

    #[test]
    fn test_auto_throttle_tracks_latency() {
        let settings = CrawlerSettings {
            download_delay_ms: 100,
            randomize_delay: false,
            autothrottle: AutoThrottleSettings {
                enabled: true,
                start_delay_ms: 1000,
                max_delay_ms: 5000,
                target_concurrency: 2.0,
            },
            ..CrawlerSettings::default()
        };
        let throttle = AutoThrottle::from_settings(&settings);
        assert_eq!(throttle.current_delay(), Duration::from_millis(1000));

        for _ in 0..20 {
            throttle.observe(Duration::from_millis(50), true);
        }
        assert_eq!(throttle.current_delay(), Duration::from_millis(100));

        throttle.observe(Duration::from_millis(50), false);
        assert_eq!(throttle.current_delay(), Duration::from_millis(200));

        for _ in 0..10 {
            throttle.observe(Duration::from_secs(20), true);
        }
        assert_eq!(throttle.current_delay(), Duration::from_millis(5000));
    }

    #[test]
    fn test_disabled_throttle_keeps_download_delay() {
        let settings = CrawlerSettings {
            download_delay_ms: 250,
            randomize_delay: false,
            autothrottle: AutoThrottleSettings {
                enabled: false,
                ..AutoThrottleSettings::default()
            },
            ..CrawlerSettings::default()
        };
        let throttle = AutoThrottle::from_settings(&settings);
        throttle.observe(Duration::from_secs(10), false);
        assert_eq!(throttle.next_delay(), Duration::from_millis(250));
    }
}
