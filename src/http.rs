// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::Mutex;
use tracing::debug;

/// A streaming response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// A fully-read HTML page
pub struct HttpPage {
    /// HTTP status code
    pub status: u16,
    /// URL after following redirects
    pub final_url: String,
    /// Response body decoded as text
    pub body: String,
}

/// HTTP response with status, content length, and body stream
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Content-Length header value, if present
    pub content_length: Option<u64>,
    /// URL after following redirects
    pub final_url: String,
    /// Response body as a stream of bytes
    pub body: ByteStream,
}

/// HTTP client abstraction for testability
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Fetch a page and read its body as text
    async fn get_page(&self, url: &str) -> Result<HttpPage, reqwest::Error>;

    /// Get a streaming response for archive downloads
    async fn get_stream(&self, url: &str) -> Result<HttpResponse, reqwest::Error>;
}

/// Statuses worth another attempt after a pause
const RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Tunables for [`ReqwestClient`]
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout: Duration,
    /// Extra attempts after a retryable status or connection error
    pub max_retries: u32,
    /// Minimum spacing between two page fetches
    pub page_delay: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            page_delay: Duration::from_millis(450),
        }
    }
}

/// Browser-like user agent; the font site serves reduced markup to unknown agents
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

/// Default HTTP client implementation using reqwest
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
    max_retries: u32,
    page_delay: Duration,
    last_page_at: Arc<Mutex<Option<Instant>>>,
}

impl ReqwestClient {
    /// Create a new ReqwestClient with default settings
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Create a client from explicit settings
    pub fn from_settings(settings: &HttpSettings) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.timeout)
            .build()?;

        Ok(Self {
            client,
            max_retries: settings.max_retries,
            page_delay: settings.page_delay,
            last_page_at: Arc::new(Mutex::new(None)),
        })
    }

    /// Create a new ReqwestClient with a custom reqwest::Client
    pub fn with_client(client: reqwest::Client) -> Self {
        let defaults = HttpSettings::default();
        Self {
            client,
            max_retries: defaults.max_retries,
            page_delay: Duration::ZERO,
            last_page_at: Arc::new(Mutex::new(None)),
        }
    }

    /// Space page fetches out so the index walk stays polite
    async fn throttle(&self) {
        if self.page_delay.is_zero() {
            return;
        }

        let mut last = self.last_page_at.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.page_delay {
                tokio::time::sleep(self.page_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Send a GET, retrying a bounded number of times on transient failures
    async fn send_with_retry(&self, url: &str) -> Result<reqwest::Response, reqwest::Error> {
        let mut attempt = 0;

        loop {
            let result = self.client.get(url).send().await;
            let can_retry = attempt < self.max_retries;

            match result {
                Ok(response)
                    if can_retry && RETRY_STATUSES.contains(&response.status().as_u16()) =>
                {
                    let wait = retry_after(&response).unwrap_or_else(|| backoff(attempt));
                    debug!(
                        "HTTP {} for {}, retrying in {:?}",
                        response.status().as_u16(),
                        url,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) if can_retry && (e.is_timeout() || e.is_connect()) => {
                    let wait = backoff(attempt);
                    debug!("Request to {} failed ({}), retrying in {:?}", url, e, wait);
                    tokio::time::sleep(wait).await;
                }
                other => return other,
            }

            attempt += 1;
        }
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get_page(&self, url: &str) -> Result<HttpPage, reqwest::Error> {
        self.throttle().await;

        let response = self.send_with_retry(url).await?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response.text().await?;

        Ok(HttpPage {
            status,
            final_url,
            body,
        })
    }

    async fn get_stream(&self, url: &str) -> Result<HttpResponse, reqwest::Error> {
        let response = self.send_with_retry(url).await?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        let final_url = response.url().to_string();

        let body: ByteStream = Box::pin(response.bytes_stream());

        Ok(HttpResponse {
            status,
            content_length,
            final_url,
            body,
        })
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(800 * 2u64.pow(attempt.min(5)))
}
