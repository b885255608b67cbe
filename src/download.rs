//! Single-attempt payload fetching.

use crate::error::{FetchError, PullError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Upper bound on the buffer reserved from a `Content-Length` header.
const PREALLOC_LIMIT: u64 = 8 * 1024 * 1024;

/// Raw result of one fetch attempt, before the integrity checks.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Bytes,
}

impl FetchResponse {
    /// Returns the body if the status is 2xx and the body is larger than `min_bytes`.
    ///
    /// Error pages are often served with a 200, so a tiny body is a failure too.
    pub fn into_usable(self, min_bytes: usize) -> Result<Bytes, FetchError> {
        if !(200..=299).contains(&self.status) {
            return Err(FetchError::Status(self.status));
        }
        if self.body.len() <= min_bytes {
            return Err(FetchError::Undersized {
                len: self.body.len(),
                min: min_bytes,
            });
        }
        Ok(self.body)
    }
}

/// Retrieves a URL once. Retries and fallbacks are the caller's business.
///
/// Dropping the returned future aborts the request. Not polling it suspends
/// the request in place.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<FetchResponse, FetchError>;
}

/// [`Fetcher`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(user_agent: &str) -> Result<Self, PullError> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self {
            client,
            max_body_bytes: usize::MAX,
        })
    }

    /// Rejects bodies larger than `limit` bytes.
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    async fn fetch_inner(&self, url: &Url) -> Result<FetchResponse, FetchError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status().as_u16();
        let limit = self.max_body_bytes;

        // The header is only a hint; never trust it for more than a small reservation
        let declared = response.content_length().unwrap_or(0);
        if declared > limit as u64 {
            debug!("{} declares {} bytes, over the limit", url, declared);
            return Err(FetchError::Oversized { limit });
        }
        let mut body = BytesMut::with_capacity(declared.min(PREALLOC_LIMIT) as usize);

        // Stream the body so a dropped future releases the connection promptly
        let mut byte_stream = response.bytes_stream();
        while let Some(piece) = byte_stream.next().await {
            let piece = piece?;
            if piece.len() > limit - body.len() {
                return Err(FetchError::Oversized { limit });
            }
            body.extend_from_slice(&piece);
        }

        debug!("Fetched {} bytes from {} (HTTP {})", body.len(), url, status);
        Ok(FetchResponse {
            status,
            body: body.freeze(),
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<FetchResponse, FetchError> {
        tokio::time::timeout(timeout, self.fetch_inner(url))
            .await
            .map_err(|_| FetchError::Timeout)?
    }
}
