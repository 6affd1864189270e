//! Byte transport for media locators.
//!
//! [`MediaTransport`] opens a stream of chunks for a locator, sending the
//! headers upstream asked for and optionally resuming at a byte offset.
//! [`HttpTransport`] implements it with `reqwest` and classifies failures
//! into transient and permanent network errors.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, HeaderName, HeaderValue, RANGE};
use tracing::{debug, warn};

use crate::config::NetworkConfig;
use crate::error::{Error, NetworkError, Result};

/// A stream of body chunks.
#[async_trait]
pub trait ChunkStream: Send {
    /// Total size of the whole resource, when the server reports it.
    fn content_length(&self) -> Option<u64>;

    /// Offset of the first byte this stream yields.
    ///
    /// Zero when the transport could not honor a requested offset and the
    /// body starts from the beginning.
    fn resumed_from(&self) -> u64;

    /// Next chunk, or `None` at the end of the body.
    ///
    /// # Errors
    ///
    /// Returns a `NetworkError` if the connection fails mid-body.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Opens byte streams for locators.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Open `locator` with `headers`, asking to start at byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns a `NetworkError` if the request fails or is refused.
    async fn open(
        &self,
        locator: &str,
        headers: &HashMap<String, String>,
        offset: u64,
    ) -> Result<Box<dyn ChunkStream>>;
}

/// HTTP(S) transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    read_timeout: Duration,
}

impl HttpTransport {
    /// Build a transport from network settings.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the HTTP client cannot be built.
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::from_client(
            client,
            Duration::from_secs(config.read_timeout_secs),
        ))
    }

    /// Wrap a preconfigured client.
    #[must_use]
    pub const fn from_client(client: reqwest::Client, read_timeout: Duration) -> Self {
        Self {
            client,
            read_timeout,
        }
    }
}

#[async_trait]
impl MediaTransport for HttpTransport {
    async fn open(
        &self,
        locator: &str,
        headers: &HashMap<String, String>,
        offset: u64,
    ) -> Result<Box<dyn ChunkStream>> {
        let mut request = self.client.get(locator);
        for (name, value) in headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) if name != RANGE => {
                    request = request.header(name, value);
                }
                _ => debug!("Skipping unusable header {}", name),
            }
        }
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = tokio::time::timeout(self.read_timeout, request.send())
            .await
            .map_err(|_| {
                Error::Network(NetworkError::Timeout {
                    reason: format!("no response within {}s", self.read_timeout.as_secs()),
                })
            })?
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            warn!("Server refused range at offset {}, restarting", offset);
            return self.open(locator, headers, 0).await;
        }
        if !status.is_success() {
            return Err(Error::Network(classify_status(status)));
        }

        let (resumed_from, total) = if status == StatusCode::PARTIAL_CONTENT && offset > 0 {
            let total = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .or_else(|| response.content_length().map(|len| len + offset));
            (offset, total)
        } else {
            if offset > 0 {
                debug!("Server ignored range request, body restarts at 0");
            }
            (0, response.content_length())
        };

        Ok(Box::new(HttpChunkStream {
            response,
            read_timeout: self.read_timeout,
            total,
            resumed_from,
        }))
    }
}

struct HttpChunkStream {
    response: reqwest::Response,
    read_timeout: Duration,
    total: Option<u64>,
    resumed_from: u64,
}

#[async_trait]
impl ChunkStream for HttpChunkStream {
    fn content_length(&self) -> Option<u64> {
        self.total
    }

    fn resumed_from(&self) -> u64 {
        self.resumed_from
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match tokio::time::timeout(self.read_timeout, self.response.chunk()).await {
            Ok(Ok(chunk)) => Ok(chunk),
            Ok(Err(e)) => Err(classify_reqwest_error(&e)),
            Err(_) => Err(Error::Network(NetworkError::Timeout {
                reason: format!("no data for {}s", self.read_timeout.as_secs()),
            })),
        }
    }
}

/// Map an HTTP failure status to a network error.
#[must_use]
pub fn classify_status(status: StatusCode) -> NetworkError {
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        NetworkError::ServerBusy {
            status: status.as_u16(),
        }
    } else {
        NetworkError::Rejected {
            status: status.as_u16(),
        }
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> Error {
    if err.is_builder() {
        return Error::Network(NetworkError::Rejected { status: 0 });
    }
    if err.is_timeout() {
        return Error::Network(NetworkError::Timeout {
            reason: err.to_string(),
        });
    }
    if let Some(status) = err.status() {
        return Error::Network(classify_status(status));
    }
    Error::Network(NetworkError::ConnectionReset {
        reason: err.to_string(),
    })
}

/// Total length from a `Content-Range: bytes a-b/total` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value
        .trim()
        .strip_prefix("bytes")?
        .rsplit_once('/')?
        .1
        .trim()
        .parse()
        .ok()
}
