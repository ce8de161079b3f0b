// src/services/render.rs

//! Headless-browser fallback for pages that block plain HTTP clients.
//!
//! A browser session is launched per [`RenderClient::fetch_with_retry`] call
//! and always shut down before the call returns. The browser itself sits
//! behind [`RenderBackend`] so the wait/retry logic can be exercised
//! without Chromium.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{AppError, Result};
use crate::models::RenderConfig;

/// Lowercase markers of an interstitial challenge page.
pub const CHALLENGE_MARKERS: [&str; 2] = ["just a moment", "checking your browser"];

/// Whether a rendered body is still showing a challenge.
pub fn contains_challenge(body: &str) -> bool {
    let lower = body.to_lowercase();
    CHALLENGE_MARKERS.iter().any(|m| lower.contains(m))
}

/// One live browser session.
#[async_trait]
pub trait RenderBackend: Send {
    /// Load `url` in the session's page.
    async fn navigate(&mut self, url: &str) -> Result<()>;

    /// Current `document.readyState`.
    async fn ready_state(&mut self) -> Result<String>;

    /// Current serialized document.
    async fn body(&mut self) -> Result<String>;

    /// Close the page and the browser.
    async fn shutdown(&mut self) -> Result<()>;
}

/// Starts browser sessions.
#[async_trait]
pub trait RenderLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn RenderBackend>>;
}

/// Wait and retry timings for rendering.
#[derive(Debug, Clone)]
pub struct RenderTiming {
    /// Upper bound for load and challenge waits on one attempt
    pub page_timeout: Duration,
    /// Pause after a challenge page is first seen
    pub challenge_cooldown: Duration,
    /// Interval between readiness and challenge polls
    pub poll_interval: Duration,
    /// Bodies shorter than this (in chars) are treated as blocked
    pub min_body_chars: usize,
    /// Delay before attempt `n + 1` is `backoff_base * 2^n`
    pub backoff_base: Duration,
}

impl RenderTiming {
    pub fn from_config(config: &RenderConfig, page_timeout: Duration) -> Self {
        Self {
            page_timeout,
            challenge_cooldown: Duration::from_secs(config.challenge_cooldown_secs),
            poll_interval: Duration::from_secs(1),
            min_body_chars: config.min_body_chars,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Retrying browser fetcher.
pub struct RenderClient {
    launcher: Box<dyn RenderLauncher>,
    timing: RenderTiming,
}

impl RenderClient {
    pub fn new(launcher: Box<dyn RenderLauncher>, timing: RenderTiming) -> Self {
        Self { launcher, timing }
    }

    /// Render `url`, retrying up to `max_retries` attempts in one session.
    ///
    /// Exhaustion is an [`AppError::Render`], never an empty body.
    pub async fn fetch_with_retry(&self, url: &str, max_retries: u32) -> Result<String> {
        let mut backend = self
            .launcher
            .launch()
            .await
            .map_err(|e| AppError::render(url, format!("browser launch failed: {e}")))?;

        let result = self.attempt_all(backend.as_mut(), url, max_retries.max(1)).await;

        if let Err(e) = backend.shutdown().await {
            log::warn!("Browser shutdown after {url} failed: {e}");
        }
        result
    }

    async fn attempt_all(
        &self,
        backend: &mut dyn RenderBackend,
        url: &str,
        max_attempts: u32,
    ) -> Result<String> {
        let mut last_error = None;
        for attempt in 0..max_attempts {
            match self.render_once(backend, url).await {
                Ok(body) => {
                    log::info!("Rendered {url} on attempt {}", attempt + 1);
                    return Ok(body);
                }
                Err(e) => {
                    log::warn!(
                        "Render attempt {}/{max_attempts} for {url} failed: {e}",
                        attempt + 1
                    );
                    last_error = Some(e);
                }
            }
            if attempt + 1 < max_attempts {
                let delay = self.timing.backoff(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let detail = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(AppError::render(
            url,
            format!("gave up after {max_attempts} attempts: {detail}"),
        ))
    }

    async fn render_once(&self, backend: &mut dyn RenderBackend, url: &str) -> Result<String> {
        let deadline = Instant::now() + self.timing.page_timeout;

        backend.navigate(url).await?;
        self.wait_until_complete(backend, url, deadline).await?;

        let mut body = backend.body().await?;
        if contains_challenge(&body) {
            log::info!(
                "Challenge page at {url}; waiting {}s",
                self.timing.challenge_cooldown.as_secs()
            );
            self.pause(self.timing.challenge_cooldown).await;
            loop {
                body = backend.body().await?;
                if !contains_challenge(&body) {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(AppError::BlockedContent {
                        url: url.to_string(),
                        marker: "challenge did not clear".to_string(),
                    });
                }
                self.pause(self.timing.poll_interval).await;
            }
        }

        let chars = body.chars().count();
        if chars < self.timing.min_body_chars {
            return Err(AppError::render(
                url,
                format!("body too short ({chars} chars)"),
            ));
        }
        Ok(body)
    }

    async fn wait_until_complete(
        &self,
        backend: &mut dyn RenderBackend,
        url: &str,
        deadline: Instant,
    ) -> Result<()> {
        loop {
            let state = backend.ready_state().await?;
            if state == "complete" {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(AppError::render(
                    url,
                    format!("page not ready before timeout (readyState={state})"),
                ));
            }
            self.pause(self.timing.poll_interval).await;
        }
    }

    async fn pause(&self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Launches headless Chromium through the DevTools protocol.
pub struct ChromiumLauncher {
    config: RenderConfig,
    user_agent: String,
    proxy: Option<String>,
}

impl ChromiumLauncher {
    pub fn new(config: RenderConfig, user_agent: impl Into<String>, proxy: Option<String>) -> Self {
        Self {
            config,
            user_agent: user_agent.into(),
            proxy,
        }
    }
}

#[cfg(feature = "render")]
#[async_trait]
impl RenderLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Box<dyn RenderBackend>> {
        let backend =
            chromium::ChromiumBackend::launch(&self.config, &self.user_agent, self.proxy.as_deref())
                .await?;
        Ok(Box::new(backend))
    }
}

#[cfg(not(feature = "render"))]
#[async_trait]
impl RenderLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Box<dyn RenderBackend>> {
        let _ = (&self.config, &self.user_agent, &self.proxy);
        Err(AppError::render(
            "",
            "built without the `render` feature",
        ))
    }
}

#[cfg(feature = "render")]
mod chromium {
    use async_trait::async_trait;
    use chromiumoxide::{Browser, BrowserConfig, Page};
    use futures::StreamExt;
    use tokio::task::JoinHandle;

    use super::RenderBackend;
    use crate::error::{AppError, Result};
    use crate::models::RenderConfig;

    const CHROME_ARGS: &[&str] = &[
        "--disable-blink-features=AutomationControlled",
        "--disable-infobars",
        "--disable-dev-shm-usage",
        "--no-first-run",
        "--no-default-browser-check",
        "--disable-background-networking",
        "--disable-sync",
        "--no-sandbox",
        "--disable-gpu",
        "--window-size=1366,768",
    ];

    /// A launched browser with a single page.
    pub(super) struct ChromiumBackend {
        browser: Option<Browser>,
        page: Option<Page>,
        handler: JoinHandle<()>,
        url: String,
    }

    impl ChromiumBackend {
        pub(super) async fn launch(
            config: &RenderConfig,
            user_agent: &str,
            proxy: Option<&str>,
        ) -> Result<Self> {
            let mut builder = BrowserConfig::builder();
            if let Some(path) = &config.chrome_path {
                builder = builder.chrome_executable(path);
            }
            if !config.headless {
                builder = builder.with_head();
            }
            if let Some(proxy) = proxy {
                builder = builder.arg(format!("--proxy-server={proxy}"));
            }
            builder = builder.arg(format!("--user-agent={user_agent}"));
            for arg in CHROME_ARGS {
                builder = builder.arg(*arg);
            }
            let browser_config = builder
                .build()
                .map_err(|e| AppError::render("", format!("browser config: {e}")))?;

            let (mut browser, mut events) = Browser::launch(browser_config)
                .await
                .map_err(|e| AppError::render("", format!("launch: {e}")))?;

            let handler = tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    if event.is_err() {
                        break;
                    }
                }
            });

            let page = match browser.new_page("about:blank").await {
                Ok(page) => page,
                Err(e) => {
                    let _ = browser.close().await;
                    let _ = browser.wait().await;
                    handler.abort();
                    return Err(AppError::render("", format!("new page: {e}")));
                }
            };

            log::debug!("Browser launched (headless={})", config.headless);
            Ok(Self {
                browser: Some(browser),
                page: Some(page),
                handler,
                url: String::new(),
            })
        }

        fn page(&self) -> Result<&Page> {
            self.page
                .as_ref()
                .ok_or_else(|| AppError::render(self.url.as_str(), "browser already shut down"))
        }
    }

    #[async_trait]
    impl RenderBackend for ChromiumBackend {
        async fn navigate(&mut self, url: &str) -> Result<()> {
            self.url = url.to_string();
            self.page()?
                .goto(url)
                .await
                .map_err(|e| AppError::render(url, format!("navigate: {e}")))?;
            Ok(())
        }

        async fn ready_state(&mut self) -> Result<String> {
            let result = self
                .page()?
                .evaluate("document.readyState")
                .await
                .map_err(|e| AppError::render(self.url.as_str(), format!("readyState: {e}")))?;
            result
                .into_value::<String>()
                .map_err(|e| AppError::render(self.url.as_str(), format!("readyState: {e}")))
        }

        async fn body(&mut self) -> Result<String> {
            self.page()?
                .content()
                .await
                .map_err(|e| AppError::render(self.url.as_str(), format!("content: {e}")))
        }

        async fn shutdown(&mut self) -> Result<()> {
            if let Some(page) = self.page.take() {
                if let Err(e) = page.close().await {
                    log::debug!("Page close failed: {e}");
                }
            }
            if let Some(mut browser) = self.browser.take() {
                browser
                    .close()
                    .await
                    .map_err(|e| AppError::render(self.url.as_str(), format!("close: {e}")))?;
                let _ = browser.wait().await;
            }
            self.handler.abort();
            Ok(())
        }
    }

    impl Drop for ChromiumBackend {
        fn drop(&mut self) {
            // The child process is killed when `Browser` drops.
            self.handler.abort();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn client(launcher: ScriptedLauncher) -> (RenderClient, CallLog) {
        let log = launcher.log.clone();
        (RenderClient::new(Box::new(launcher), fast_timing()), log)
    }

    #[test]
    fn test_contains_challenge() {
        assert!(contains_challenge("<title>Just a moment...</title>"));
        assert!(contains_challenge("Checking your browser before accessing"));
        assert!(!contains_challenge("<html>Commission news</html>"));
    }

    #[test]
    fn test_backoff_doubles() {
        let timing = RenderTiming {
            backoff_base: Duration::from_secs(1),
            ..fast_timing()
        };
        assert_eq!(timing.backoff(0), Duration::from_secs(1));
        assert_eq!(timing.backoff(1), Duration::from_secs(2));
        assert_eq!(timing.backoff(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_challenge_clears_after_wait() {
        let body = long_body("news");
        let (client, log) = client(ScriptedLauncher::new(vec![Script::Bodies(vec![
            "<title>Just a moment...</title>".to_string(),
            body.clone(),
        ])]));

        let rendered = client.fetch_with_retry("https://x.gov/news", 3).await.unwrap();
        assert_eq!(rendered, body);
        assert_eq!(log.count("shutdown"), 1);
        assert_eq!(log.count("navigate https://x.gov/news"), 1);
    }

    #[tokio::test]
    async fn test_short_body_exhausts_attempts() {
        let short = Script::Bodies(vec!["<html>tiny</html>".to_string()]);
        let (client, log) = client(ScriptedLauncher::new(vec![short.clone(), short.clone(), short]));

        let err = client.fetch_with_retry("https://x.gov/news", 3).await.unwrap_err();
        assert!(matches!(err, AppError::Render { .. }));
        assert_eq!(log.count("navigate https://x.gov/news"), 3);
        assert_eq!(log.count("shutdown"), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_navigation_error() {
        let body = long_body("ok");
        let (client, log) = client(ScriptedLauncher::new(vec![
            Script::NavigateError,
            Script::NeverReady,
            Script::Bodies(vec![body.clone()]),
        ]));

        let rendered = client.fetch_with_retry("https://x.gov/a", 6).await.unwrap();
        assert_eq!(rendered, body);
        assert_eq!(log.count("navigate https://x.gov/a"), 3);
        assert_eq!(log.count("shutdown"), 1);
    }

    #[tokio::test]
    async fn test_persistent_challenge_fails() {
        let (client, log) = client(ScriptedLauncher::new(vec![Script::Bodies(vec![
            long_body("Checking your browser"),
        ])]));

        let err = client.fetch_with_retry("https://x.gov/a", 1).await.unwrap_err();
        assert!(matches!(err, AppError::Render { .. }));
        assert_eq!(log.count("shutdown"), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_is_render_error() {
        let mut launcher = ScriptedLauncher::new(Vec::new());
        launcher.fail = true;
        let (client, log) = client(launcher);

        let err = client.fetch_with_retry("https://x.gov/a", 3).await.unwrap_err();
        assert!(matches!(err, AppError::Render { .. }));
        assert_eq!(log.entries(), vec!["launch".to_string()]);
    }
}
