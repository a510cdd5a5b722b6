//! Server-side fetch of remote resources referenced in chat.
//!
//! The browser cannot load arbitrary cross-origin resources itself, so it
//! asks the relay. Only `http`/`https` URLs are fetched and bodies are capped.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Url;
use tracing::debug;

use crate::protocol::ServerMessage;

const FETCH_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("resource exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub content_type: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ResourceFetcher {
    http: reqwest::Client,
    max_bytes: usize,
}

/// Parse `raw` and accept only http(s) URLs.
pub fn parse_fetchable(raw: &str) -> Result<Url, ResourceError> {
    let url = Url::parse(raw.trim()).map_err(|e| ResourceError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ResourceError::UnsupportedScheme(other.to_string())),
    }
}

impl ResourceFetcher {
    pub fn new(max_bytes: usize) -> Result<Self, ResourceError> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("clawtime-relay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, max_bytes })
    }

    pub async fn fetch(&self, raw_url: &str) -> Result<Resource, ResourceError> {
        let url = parse_fetchable(raw_url)?;
        debug!(url = %url, "Fetching resource");
        let mut response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ResourceError::Status(response.status().as_u16()));
        }
        if let Some(len) = response.content_length()
            && usize::try_from(len).unwrap_or(usize::MAX) > self.max_bytes
        {
            return Err(ResourceError::TooLarge {
                limit: self.max_bytes,
            });
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(ResourceError::TooLarge {
                    limit: self.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(Resource { content_type, body })
    }

    /// Fetch and express the outcome as the client reply.
    pub async fn fetch_message(&self, url: &str) -> ServerMessage {
        match self.fetch(url).await {
            Ok(resource) => ServerMessage::ResourceData {
                url: url.to_string(),
                content_type: resource.content_type,
                data: BASE64.encode(&resource.body),
            },
            Err(e) => ServerMessage::ResourceError {
                url: url.to_string(),
                error: e.to_string(),
            },
        }
    }
}
