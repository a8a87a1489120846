//! Byte-source boundary: how image bytes reach the engine.
//!
//! The engine performs exactly one fetch per extraction and everything
//! after the fetch is synchronous, so this trait is the only async seam
//! in the crate. Implementations decide transport, timeouts and retries.

use crate::error::FetchError;
use async_trait::async_trait;
use std::time::Duration;

/// Default HTTP fetch timeout in seconds.
const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

/// Abstract "bytes for a URL" capability.
#[async_trait]
pub trait ByteSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// `reqwest`-backed byte source with a bounded request timeout.
///
/// The timeout covers the whole request. It defaults to
/// [`DEFAULT_TIMEOUT_SECONDS`] and can be overridden through the
/// `PROMPT_LENS_HTTP_TIMEOUT_SECS` environment variable, clamped to
/// 1..=600 seconds.
pub struct HttpByteSource {
    client: reqwest::Client,
}

impl HttpByteSource {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(fetch_timeout_seconds()))
            .build()
            .map_err(FetchError::Client)?;
        Ok(HttpByteSource { client })
    }
}

#[async_trait]
impl ByteSource for HttpByteSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        log::debug!("Fetching {}", url);
        let response = self.client.get(url).send().await.map_err(|source| {
            FetchError::Request {
                url: url.to_string(),
                source,
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }

        let bytes = response.bytes().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;
        Ok(bytes.to_vec())
    }
}

fn fetch_timeout_seconds() -> u64 {
    if let Ok(raw) = std::env::var("PROMPT_LENS_HTTP_TIMEOUT_SECS") {
        if let Ok(parsed) = raw.parse::<u64>() {
            return parsed.clamp(1, 600);
        }
        log::warn!(
            "Ignoring invalid PROMPT_LENS_HTTP_TIMEOUT_SECS value: {}",
            raw
        );
    }
    DEFAULT_TIMEOUT_SECONDS
}
