//! HTTP transport: shared client, status mapping and a byte-stream backend.

use std::sync::OnceLock;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendRequest, ByteStream, ModelBackend};
use crate::error::{TurnError, UpstreamError};

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Get (or create) the shared reqwest client.
pub fn shared_client() -> &'static reqwest::Client {
    SHARED_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    })
}

/// Build default headers for a Bearer-token API.
pub fn bearer_headers(api_key: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(key) = api_key {
        if let Ok(val) = HeaderValue::from_str(&format!("Bearer {key}")) {
            headers.insert(AUTHORIZATION, val);
        }
    }
    headers
}

/// Map a non-success HTTP response to a structured upstream error.
///
/// A 429 is only flagged retryable when the server sent a retry hint and the
/// body does not describe quota exhaustion.
pub fn status_to_upstream(status: u16, body: &str, retry_after_header: Option<u64>) -> UpstreamError {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let error_obj = parsed.as_ref().and_then(|v| v.get("error"));
    let message = error_obj
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string());
    let code = error_obj
        .and_then(|e| e.get("code").or_else(|| e.get("type")))
        .and_then(|c| c.as_str())
        .map(str::to_string);
    let body_retry_after = error_obj
        .and_then(|e| e.get("retry_after"))
        .and_then(|r| r.as_f64())
        .map(|s| s.ceil() as u64);

    let mut error = UpstreamError::new(Some(status), message);
    if let Some(code) = code {
        error = error.with_code(code);
    }
    let retry_after = retry_after_header.or(body_retry_after);
    if status == 429 && retry_after.is_some() {
        error = error.with_retry(true, retry_after);
        // Quota exhaustion keeps its classification even with a hint.
        if matches!(error.classify(), crate::error::UpstreamFailure::QuotaExhausted) {
            error.should_retry = false;
        }
    }
    error
}

/// Convert a response into the crate byte stream, or an upstream error.
pub async fn response_byte_stream(resp: reqwest::Response) -> Result<ByteStream, TurnError> {
    let status = resp.status();
    if !status.is_success() {
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = resp.text().await.unwrap_or_default();
        return Err(TurnError::upstream(status_to_upstream(
            status.as_u16(),
            &body,
            retry_after,
        )));
    }
    let stream = resp
        .bytes_stream()
        .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(TurnError::Network));
    Ok(Box::pin(stream))
}

/// Backend that POSTs the request as JSON to an endpoint emitting
/// normalized event frames.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

#[async_trait]
impl ModelBackend for HttpBackend {
    async fn stream(
        &self,
        request: &BackendRequest,
        cancel: CancellationToken,
    ) -> Result<ByteStream, TurnError> {
        tracing::debug!(url = %self.url, model = %request.model_id, "opening upstream stream");
        let send = shared_client()
            .post(&self.url)
            .headers(bearer_headers(self.api_key.as_deref()))
            .json(request)
            .send();
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(TurnError::Canceled),
            resp = send => resp?,
        };
        response_byte_stream(resp).await
    }
}
