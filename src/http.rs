//! Unary and streaming HTTP transport.
//!
//! A thin wrapper over one shared [`reqwest::Client`] (connection pooling is
//! the client's job, not ours — see §5 "Shared resources"). Unary calls get
//! automatic retry/backoff on transport failures and 5xx/429 via `backon`,
//! mirroring the teacher's `upstream_retry` helper. Streaming calls open a
//! single request and hand the raw [`reqwest::Response`] to the Streaming
//! Engine, which owns the retry loop itself (§4.3) because a retry there
//! means a fresh parser state, not just a fresh HTTP attempt.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, IsRetryable};

/// Shared HTTP transport for unary requests and stream opens.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn raw(&self) -> &reqwest::Client {
        &self.client
    }

    /// POST a JSON body and decode a JSON response, retrying transport
    /// failures and 5xx/429 per §4.3's backoff formula. 4xx other than 429
    /// (including 401, which the caller handles via a refresh-and-retry one
    /// layer up) are never retried here.
    pub async fn post_json<B, R>(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        body: &B,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<R, Error>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        let policy = retry_policy(max_retries);
        let attempt = || async { self.try_post_json::<B, R>(url, headers, body, timeout).await };

        attempt
            .retry(policy)
            .when(|err: &Error| err.is_retryable())
            .await
    }

    async fn try_post_json<B, R>(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        body: &B,
        timeout: Duration,
    ) -> Result<R, Error>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        let mut request = self.client.post(url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        let response = request.json(body).send().await?;
        decode_or_classify(response).await
    }

    /// GET and decode a JSON response with the same retry policy as
    /// [`HttpClient::post_json`].
    pub async fn get_json<R>(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        timeout: Duration,
        max_retries: u32,
    ) -> Result<R, Error>
    where
        R: DeserializeOwned,
    {
        let policy = retry_policy(max_retries);
        let attempt = || async {
            let mut request = self.client.get(url).timeout(timeout);
            for (name, value) in headers {
                request = request.header(*name, value.as_str());
            }
            let response = request.send().await?;
            decode_or_classify::<R>(response).await
        };

        attempt
            .retry(policy)
            .when(|err: &Error| err.is_retryable())
            .await
    }

    /// Open a single streaming POST. No retry: the Streaming Engine drives
    /// its own retry loop (§4.3), opening a fresh request (and a fresh
    /// parser) on each attempt.
    pub async fn open_stream<B: Serialize>(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        body: &B,
    ) -> Result<reqwest::Response, Error> {
        let mut request = self
            .client
            .post(url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        let response = request.json(body).send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(classify_status(&response).await)
        }
    }
}

fn retry_policy(max_retries: u32) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(max_retries as usize)
        .with_jitter()
}

async fn decode_or_classify<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, Error> {
    if !response.status().is_success() {
        return Err(classify_status(&response).await);
    }
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| Error::parse(format!("invalid JSON response: {e}")))
}

async fn classify_status(response: &reqwest::Response) -> Error {
    let status = response.status();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    Error::from_status(status, retry_after).with_context("status", status.as_u16())
}
