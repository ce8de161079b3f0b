// src/services/fetcher.rs

//! Page fetching with escalation to the browser fallback.

use std::time::Duration;

use reqwest::Client;

use crate::error::{AppError, Result};
use crate::models::Config;
use crate::services::render::{ChromiumLauncher, RenderClient, RenderTiming, contains_challenge};
use crate::utils::http::{
    FetchResponse, RetryPolicy, client_from_config, random_user_agent, retrying_fetch,
};

/// Fetches HTML pages: plain HTTP first, a real browser when blocked.
pub struct PageFetcher {
    client: Client,
    timeout: Duration,
    policy: RetryPolicy,
    render: Option<RenderClient>,
    render_attempts: u32,
}

impl PageFetcher {
    pub fn new(client: Client, timeout: Duration, policy: RetryPolicy) -> Self {
        Self {
            client,
            timeout,
            policy,
            render: None,
            render_attempts: 1,
        }
    }

    /// Enable the browser fallback with `attempts` tries per page.
    pub fn with_render(mut self, render: RenderClient, attempts: u32) -> Self {
        self.render = Some(render);
        self.render_attempts = attempts;
        self
    }

    /// Build the HTTP client, retry policy and optional browser fallback.
    pub fn from_config(config: &Config) -> Result<Self> {
        let scraper = &config.scraper;
        let client = client_from_config(scraper)?;
        let timeout = scraper.request_timeout();
        let fetcher = Self::new(
            client,
            timeout,
            RetryPolicy::from_config(scraper, &config.pacing),
        );

        if !scraper.render_fallback {
            return Ok(fetcher);
        }
        let launcher = ChromiumLauncher::new(
            config.render.clone(),
            random_user_agent(),
            scraper.outbound_proxy_url.clone(),
        );
        let render = RenderClient::new(
            Box::new(launcher),
            RenderTiming::from_config(&config.render, timeout),
        );
        Ok(fetcher.with_render(render, scraper.max_retries))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Raw retrying GET, for streaming downloads.
    pub async fn fetch_response(&self, url: &str) -> Result<FetchResponse> {
        retrying_fetch(&self.client, url, self.timeout, &self.policy).await
    }

    /// Fetch a page body as text.
    ///
    /// A failed HTTP fetch (including a block status such as 403 that
    /// outlasted its retries) or a challenge marker in the body escalates to
    /// the browser fallback when one is configured. Other error statuses
    /// surface as [`AppError::HttpStatus`].
    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = match self.fetch_response(url).await {
            Ok(response) => response,
            Err(e) => return self.escalate(url, e).await,
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return self.escalate(url, e).await,
        };

        if contains_challenge(&body) {
            let cause = AppError::BlockedContent {
                url: url.to_string(),
                marker: "challenge page".to_string(),
            };
            return self.escalate(url, cause).await;
        }
        if !status.is_success() {
            return Err(AppError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(body)
    }

    async fn escalate(&self, url: &str, cause: AppError) -> Result<String> {
        let Some(render) = &self.render else {
            return Err(cause);
        };

        log::info!("Falling back to browser for {url}: {cause}");
        match render.fetch_with_retry(url, self.render_attempts).await {
            Ok(body) => Ok(body),
            Err(e) => {
                log::warn!("Browser fallback failed for {url}: {e}");
                Err(cause)
            }
        }
    }
}
