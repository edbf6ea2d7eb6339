//! HTTP content source
//!
//! Issues a GET against a URL template keyed by object ID and streams the
//! body in fixed-size chunks. Opening the request is retried with
//! exponential backoff on connection errors and transient statuses; other
//! non-2xx statuses fail immediately.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{FetchConfig, ID_PLACEHOLDER};
use crate::error::{Result, StageError};
use crate::fetch::{ContentSource, FetchedContent, fixed_chunks};
use crate::types::ObjectId;

/// Streams objects over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    url_template: String,
    chunk_size: usize,
    read_timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        if !config.url_template.contains(ID_PLACEHOLDER) {
            return Err(StageError::Config(format!(
                "fetch.url_template must contain {ID_PLACEHOLDER}"
            )));
        }
        Url::parse(&config.url_template.replace(ID_PLACEHOLDER, "probe"))
            .map_err(|e| StageError::Config(format!("Invalid fetch.url_template: {e}")))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| StageError::Config(format!("Failed to create HTTP client: {e}")))?;

        info!("HttpFetcher initialized with template: {}", config.url_template);

        Ok(Self {
            client,
            url_template: config.url_template.clone(),
            chunk_size: config.chunk_size_bytes,
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    /// Source URL for `id`, with the ID percent-encoded.
    pub fn url_for(&self, id: &ObjectId) -> Result<Url> {
        let raw = self
            .url_template
            .replace(ID_PLACEHOLDER, &urlencoding::encode(id.as_str()));
        Url::parse(&raw).map_err(|e| StageError::FetchFailed(format!("Invalid URL {raw}: {e}")))
    }

    async fn open(&self, url: &Url) -> Result<Response> {
        let mut last_error = None;
        let mut delay = self.retry_backoff;
        let attempts = self.max_retries + 1;

        for attempt in 0..attempts {
            match self.client.get(url.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if !is_transient(status) {
                        return Err(StageError::FetchFailed(format!("{url} returned {status}")));
                    }
                    last_error = Some(format!("{url} returned {status}"));
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                }
            }

            if attempt + 1 < attempts {
                warn!(
                    "Fetch attempt {}/{} failed, retrying in {:?}: {}",
                    attempt + 1,
                    attempts,
                    delay,
                    last_error.as_deref().unwrap_or("unknown error")
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(StageError::FetchFailed(format!(
            "Failed after {} attempts: {}",
            attempts,
            last_error.unwrap_or_else(|| "Unknown error".to_string())
        )))
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

#[async_trait]
impl ContentSource for HttpFetcher {
    async fn fetch(&self, id: &ObjectId) -> Result<FetchedContent> {
        let url = self.url_for(id)?;
        debug!("Fetching {} from {}", id, url);

        let response = self.open(&url).await?;
        let content_length = response.content_length();
        let body = Box::pin(response.bytes_stream());

        Ok(FetchedContent {
            content_length,
            chunks: fixed_chunks(body, self.chunk_size, self.read_timeout),
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
