//! HTTP seam used by every endpoint call.
//!
//! The managers never talk to `reqwest` directly; they go through [`Transport`] so that an
//! alternative HTTP stack (or a scripted one in tests) can be plugged into
//! [`crate::subscribe::Client::with_transport`]. Cancellation is applied by the caller of
//! [`Transport::get`] by dropping the returned future.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

use crate::Result;

/// Status and raw body of a completed GET.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl Response {
    #[must_use]
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Issue a GET to `url`, failing once `timeout` elapses without a response.
    async fn get(&self, url: Url, timeout: Duration) -> Result<Response>;
}

/// [`Transport`] backed by a shared [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: Url, timeout: Duration) -> Result<Response> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        Ok(Response::new(status, body.to_vec()))
    }
}
