// src/transport.rs

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

use crate::config::ManagerConfig;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{0}")]
    Other(String),
}

/// Body chunks, produced one at a time as the consumer polls for them.
pub type ChunkStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Response metadata plus the pull-based body.
pub struct TransportResponse {
    pub status: u16,
    /// Size hint from the response headers.
    pub content_length: Option<u64>,
    pub body: ChunkStream,
}

/// Fetches the bytes behind a source URL.
///
/// Non-success statuses are returned as data; only failures to obtain a
/// response at all are errors.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, source: &str) -> Result<TransportResponse, TransportError>;
}

/// `Transport` over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &ManagerConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, source: &str) -> Result<TransportResponse, TransportError> {
        let resp = self.client.get(source).send().await?;
        let status = resp.status().as_u16();
        let content_length = resp.content_length();
        let body = resp.bytes_stream().map_err(TransportError::from).boxed();
        Ok(TransportResponse {
            status,
            content_length,
            body,
        })
    }
}
