//! HTTP client for crawler fetches.
//!
//! One client per source. Rotates user agents in impersonate mode, sends
//! the site's referer convention, sleeps between requests, and backs off
//! adaptively on 429/503.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CrawlError, Result};
use crate::crawlers::user_agent::resolve_user_agent;

/// Retries per request once the server starts rate limiting.
const RATE_LIMIT_RETRIES: u32 = 3;

/// Delay growth factor on 429/503.
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Delay shrink factor after consecutive successes.
const RECOVERY_MULTIPLIER: f64 = 0.75;

/// Successes needed before recovery kicks in.
const RECOVERY_THRESHOLD: u32 = 5;

const MAX_DELAY: Duration = Duration::from_secs(120);

#[derive(Debug)]
struct BackoffState {
    current_delay: Duration,
    in_backoff: bool,
    consecutive_successes: u32,
}

/// HTTP client with per-request delay and adaptive rate-limit backoff.
pub struct HttpClient {
    client: Client,
    /// None = default UA, "impersonate" = rotate per request, other = custom.
    user_agent_config: Option<String>,
    referer: Option<String>,
    base_delay: Duration,
    state: Mutex<BackoffState>,
}

impl HttpClient {
    /// Create a new client for one source.
    pub fn new(
        timeout: Duration,
        request_delay: Duration,
        user_agent_config: Option<&str>,
        referer: Option<&str>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            user_agent_config: user_agent_config.map(|s| s.to_string()),
            referer: referer.map(|s| s.to_string()),
            base_delay: request_delay,
            state: Mutex::new(BackoffState {
                current_delay: request_delay,
                in_backoff: false,
                consecutive_successes: 0,
            }),
        })
    }

    /// Fetch a page as text, honoring the inter-request delay and backing
    /// off on rate limiting.
    pub async fn get_text(&self, url: &str) -> Result<String> {
        let delay = {
            let state = self.state.lock().await;
            state.current_delay
        };
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let mut attempt = 0u32;
        loop {
            let user_agent = resolve_user_agent(self.user_agent_config.as_deref());
            let mut request = self.client.get(url).header("User-Agent", user_agent);
            if let Some(referer) = &self.referer {
                request = request.header("Referer", referer.clone());
            }

            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS
                || status == StatusCode::SERVICE_UNAVAILABLE
            {
                attempt += 1;
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                let wait = self.report_rate_limited(retry_after).await;
                if attempt > RATE_LIMIT_RETRIES {
                    return Err(CrawlError::RateLimited(format!(
                        "{url} still limited after {RATE_LIMIT_RETRIES} retries"
                    )));
                }
                warn!(%url, %status, ?wait, "Rate limited, backing off");
                tokio::time::sleep(wait).await;
                continue;
            }

            let response = response.error_for_status()?;
            let body = response.text().await?;
            self.report_success().await;
            debug!(%url, bytes = body.len(), "Fetched page");
            return Ok(body);
        }
    }

    /// Grow the delay and return how long to wait before retrying.
    async fn report_rate_limited(&self, retry_after: Option<Duration>) -> Duration {
        let mut state = self.state.lock().await;
        state.consecutive_successes = 0;
        state.in_backoff = true;
        let grown = Duration::from_secs_f64(
            state.current_delay.as_secs_f64().max(0.5) * BACKOFF_MULTIPLIER,
        );
        state.current_delay = grown.min(MAX_DELAY);
        retry_after.unwrap_or(state.current_delay)
    }

    /// Shrink the delay back toward the base after sustained successes.
    async fn report_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_successes += 1;
        if state.in_backoff && state.consecutive_successes >= RECOVERY_THRESHOLD {
            let shrunk = Duration::from_secs_f64(
                state.current_delay.as_secs_f64() * RECOVERY_MULTIPLIER,
            );
            state.current_delay = shrunk.max(self.base_delay);
            if state.current_delay <= self.base_delay {
                state.in_backoff = false;
                info!("Recovered from rate limit backoff");
            }
            state.consecutive_successes = 0;
        }
    }
}
