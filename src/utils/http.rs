// src/utils/http.rs

//! HTTP client utilities: identity headers, block detection and retries.

use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, UPGRADE_INSECURE_REQUESTS};
use reqwest::{Client, StatusCode};

use crate::error::{AppError, Result};
use crate::models::{PacingConfig, ScraperConfig};
use crate::utils::url::append_query;

pub use crate::models::content_sha256;

/// Statuses the target uses for blocking or throttling. Always retried.
pub const BLOCK_STATUS_CODES: [u16; 9] = [403, 404, 409, 420, 429, 500, 502, 503, 504];

/// Lowercase body markers of a block or challenge page.
pub const BLOCK_MARKERS: [&str; 2] = ["captcha", "temporarily unavailable"];

/// How much of the body is inspected for block markers.
pub const SNIFF_BYTES: usize = 1024;

const MAX_IDLE_PER_HOST: usize = 32;

/// Real browser user agents; one is picked per client.
pub const USER_AGENTS: &[&str] = &[
    // Chrome on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    // Chrome on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Firefox
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:133.0) Gecko/20100101 Firefox/133.0",
    // Safari
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
    // Edge
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
];

/// Pick a user agent at random.
pub fn random_user_agent() -> &'static str {
    USER_AGENTS[rand::rng().random_range(0..USER_AGENTS.len())]
}

/// Create a pooled client with browser-like identity headers.
///
/// `proxy_url` is applied to both HTTP and HTTPS traffic.
pub fn build_client(source_address: Option<IpAddr>, proxy_url: Option<&str>) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));

    let mut builder = Client::builder()
        .user_agent(random_user_agent())
        .default_headers(headers)
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .gzip(true)
        .brotli(true)
        .deflate(true);

    if let Some(addr) = source_address {
        builder = builder.local_address(addr);
    }
    if let Some(proxy) = proxy_url {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| AppError::config(format!("invalid proxy URL '{proxy}': {e}")))?;
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}

/// Build a client from scraper settings.
pub fn client_from_config(config: &ScraperConfig) -> Result<Client> {
    build_client(config.source_ip, config.outbound_proxy_url.as_deref())
}

static LAST_CACHE_BUSTER: AtomicU64 = AtomicU64::new(0);

/// Next cache-buster value: wall-clock milliseconds, forced strictly increasing.
pub fn next_cache_buster() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut prev = LAST_CACHE_BUSTER.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_CACHE_BUSTER.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// `url` with a fresh `nocache` query parameter.
pub fn cache_busted(url: &str) -> String {
    append_query(url, "nocache", &next_cache_buster().to_string())
}

/// Sleep a uniformly random duration in `[min, max]`.
pub async fn jitter_sleep(min: Duration, max: Duration) {
    let delay = random_between(min, max);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Sleep a random number of milliseconds from a `[min, max]` pair.
pub async fn jitter_sleep_ms(range: [u64; 2]) {
    jitter_sleep(Duration::from_millis(range[0]), Duration::from_millis(range[1])).await;
}

fn random_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let ms = rand::rng().random_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(ms)
}

/// Outcome of a single attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Ok(T),
    Retryable(AppError),
    Fatal(AppError),
}

/// Retry schedule for [`retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Random pause before each attempt
    pub jitter: (Duration, Duration),
}

impl RetryPolicy {
    pub fn from_config(scraper: &ScraperConfig, pacing: &PacingConfig) -> Self {
        Self {
            max_attempts: scraper.max_retries,
            initial_backoff: Duration::from_millis(pacing.initial_backoff_ms),
            max_backoff: Duration::from_millis(pacing.max_backoff_ms),
            jitter: (
                Duration::from_millis(pacing.request_jitter_ms[0]),
                Duration::from_millis(pacing.request_jitter_ms[1]),
            ),
        }
    }

    /// No waiting anywhere.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: (Duration::ZERO, Duration::ZERO),
        }
    }

    /// Delay after failed attempt `attempt` (1-based).
    ///
    /// `initial * 2^(attempt-1)` plus up to `initial` of jitter, capped at `max_backoff`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let base = self.initial_backoff.saturating_mul(factor);
        let jitter = random_between(Duration::ZERO, self.initial_backoff);
        base.saturating_add(jitter).min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails fatally, or attempts run out.
///
/// The closure receives the 1-based attempt number. On exhaustion the last
/// error is returned unchanged.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Attempt::Ok(value) => return Ok(value),
            Attempt::Fatal(e) => return Err(e),
            Attempt::Retryable(e) if attempt >= max_attempts => return Err(e),
            Attempt::Retryable(e) => {
                let delay = policy.backoff_delay(attempt);
                log::warn!(
                    "Attempt {attempt}/{max_attempts} failed: {e}; retrying in {}ms",
                    delay.as_millis()
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Whether a status belongs to the block set.
pub fn is_block_status(status: StatusCode) -> bool {
    BLOCK_STATUS_CODES.contains(&status.as_u16())
}

/// First block marker found in the leading bytes of a body.
pub fn find_block_marker(body: &[u8]) -> Option<&'static str> {
    let head = &body[..body.len().min(SNIFF_BYTES)];
    let text = String::from_utf8_lossy(head).to_lowercase();
    BLOCK_MARKERS.into_iter().find(|m| text.contains(m))
}

/// A response whose leading bytes were already read for block detection.
///
/// The timeout bounds each read, not the whole transfer, so a large body
/// keeps streaming as long as bytes keep arriving.
#[derive(Debug)]
pub struct FetchResponse {
    status: StatusCode,
    url: String,
    prefix: Vec<u8>,
    inner: reqwest::Response,
    read_timeout: Duration,
}

impl FetchResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// URL as requested, without the cache buster.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next piece of the body; the sniffed prefix comes first.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.prefix.is_empty() {
            return Ok(Some(std::mem::take(&mut self.prefix)));
        }
        read_chunk(&mut self.inner, &self.url, self.read_timeout).await
    }

    /// Whole body as text, invalid UTF-8 replaced.
    pub async fn text(mut self) -> Result<String> {
        let mut body = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Read one body chunk, failing if none arrives within `timeout`.
async fn read_chunk(
    response: &mut reqwest::Response,
    url: &str,
    timeout: Duration,
) -> Result<Option<Vec<u8>>> {
    match tokio::time::timeout(timeout, response.chunk()).await {
        Ok(chunk) => Ok(chunk?.map(|b| b.to_vec())),
        Err(_) => Err(AppError::Timeout {
            url: url.to_string(),
            after: timeout,
        }),
    }
}

/// GET `url` with jitter, cache busting, block detection and backoff.
///
/// Non-block error statuses are returned as-is for the caller to inspect.
pub async fn retrying_fetch(
    client: &Client,
    url: &str,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<FetchResponse> {
    retry_with_backoff(policy, |attempt| async move {
        jitter_sleep(policy.jitter.0, policy.jitter.1).await;
        log::debug!("GET {url} (attempt {attempt})");
        fetch_once(client, url, timeout).await
    })
    .await
}

async fn fetch_once(client: &Client, url: &str, timeout: Duration) -> Attempt<FetchResponse> {
    let request = match client.get(cache_busted(url)).build() {
        Ok(request) => request,
        Err(e) => return Attempt::Fatal(e.into()),
    };

    let mut response = match tokio::time::timeout(timeout, client.execute(request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) if e.is_builder() => return Attempt::Fatal(e.into()),
        Ok(Err(e)) => return Attempt::Retryable(e.into()),
        Err(_) => {
            return Attempt::Retryable(AppError::Timeout {
                url: url.to_string(),
                after: timeout,
            });
        }
    };

    let status = response.status();
    if is_block_status(status) {
        return Attempt::Retryable(AppError::BlockedStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let mut prefix = Vec::new();
    while prefix.len() < SNIFF_BYTES {
        match read_chunk(&mut response, url, timeout).await {
            Ok(Some(chunk)) => prefix.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(e) => return Attempt::Retryable(e),
        }
    }

    if let Some(marker) = find_block_marker(&prefix) {
        return Attempt::Retryable(AppError::BlockedContent {
            url: url.to_string(),
            marker: marker.to_string(),
        });
    }

    Attempt::Ok(FetchResponse {
        status,
        url: url.to_string(),
        prefix,
        inner: response,
        read_timeout: timeout,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[test]
    fn test_block_status_set() {
        for code in BLOCK_STATUS_CODES {
            assert!(is_block_status(StatusCode::from_u16(code).unwrap()));
        }
        assert!(!is_block_status(StatusCode::OK));
        assert!(!is_block_status(StatusCode::GONE));
    }

    #[test]
    fn test_find_block_marker() {
        assert_eq!(
            find_block_marker(b"<html>Please solve the CAPTCHA</html>"),
            Some("captcha")
        );
        assert_eq!(
            find_block_marker(b"Service Temporarily Unavailable"),
            Some("temporarily unavailable")
        );
        assert_eq!(find_block_marker(b"<html>ok</html>"), None);
    }

    #[test]
    fn test_find_block_marker_only_inspects_prefix() {
        let mut body = vec![b'a'; SNIFF_BYTES];
        body.extend_from_slice(b"captcha");
        assert_eq!(find_block_marker(&body), None);
    }

    #[test]
    fn test_cache_buster_strictly_increasing() {
        let mut prev = next_cache_buster();
        for _ in 0..1000 {
            let next = next_cache_buster();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_cache_busted_appends_param() {
        let url = cache_busted("https://x.gov/news?page=1");
        assert!(url.starts_with("https://x.gov/news?page=1&nocache="));
    }

    #[test]
    fn test_backoff_delay_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            jitter: (Duration::ZERO, Duration::ZERO),
        };
        let first = policy.backoff_delay(1);
        assert!(first >= Duration::from_secs(1) && first <= Duration::from_secs(2));
        let third = policy.backoff_delay(3);
        assert!(third >= Duration::from_secs(4) && third <= Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_random_user_agent_from_pool() {
        assert!(USER_AGENTS.contains(&random_user_agent()));
    }

    #[test]
    fn test_build_client_rejects_bad_proxy() {
        assert!(build_client(None, Some("http://exa mple.com:3128")).is_err());
        assert!(build_client(None, Some("http://127.0.0.1:3128")).is_ok());
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_retryable() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&RetryPolicy::immediate(6), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Attempt::Retryable(AppError::BlockedStatus {
                        url: "u".into(),
                        status: 429,
                    })
                } else {
                    Attempt::Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_returns_last_error_on_exhaustion() {
        let result: Result<()> = retry_with_backoff(&RetryPolicy::immediate(2), |attempt| async move {
            Attempt::Retryable(AppError::BlockedStatus {
                url: "u".into(),
                status: 500 + attempt as u16,
            })
        })
        .await;
        assert!(matches!(
            result,
            Err(AppError::BlockedStatus { status: 502, .. })
        ));
    }

    #[tokio::test]
    async fn test_retry_stops_on_fatal() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&RetryPolicy::immediate(6), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Attempt::Fatal(AppError::config("bad url")) }
        })
        .await;
        assert!(matches!(result, Err(AppError::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
