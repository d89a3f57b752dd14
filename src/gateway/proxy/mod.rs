//! Usage: Upstream inference client (shared transport, per-host concurrency cap, no retries).

mod error_code;
mod errors;

pub(in crate::gateway) use error_code::GatewayErrorCode;
pub(crate) use errors::GatewayError;

use crate::domain::models::EndpointKind;
use crate::shared::constants::{
    UPSTREAM_CLIENT_TIMEOUT, UPSTREAM_IDLE_TIMEOUT, UPSTREAM_MAX_CONNS_PER_HOST,
    UPSTREAM_MAX_IDLE_PER_HOST, UPSTREAM_REQUEST_TIMEOUT,
};
use crate::shared::error::{AppError, AppResult};
use axum::body::Bytes;
use futures_core::Stream;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

const UPSTREAM_ERROR_BODY_MAX_BYTES: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub(crate) enum UpstreamError {
    #[error("canceled before upstream responded")]
    Canceled,
    #[error("no response within the cold-start window")]
    ColdStart,
    #[error("upstream transport failed: {0}")]
    Network(#[source] reqwest::Error),
    #[error("upstream returned {status}")]
    Status { status: u16, body: String },
}

impl UpstreamError {
    pub(in crate::gateway) fn code(&self) -> GatewayErrorCode {
        match self {
            Self::Canceled => GatewayErrorCode::ClientCanceled,
            Self::ColdStart => GatewayErrorCode::ModelColdStart,
            Self::Network(err) => errors::classify_reqwest_error(err),
            Self::Status { .. } => GatewayErrorCode::UpstreamNon200,
        }
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(value: UpstreamError) -> Self {
        match value {
            UpstreamError::Canceled => GatewayError::UpstreamUnavailable(None),
            UpstreamError::ColdStart => GatewayError::ColdStart,
            UpstreamError::Network(err) if err.is_timeout() => GatewayError::ColdStart,
            UpstreamError::Network(err) => GatewayError::UpstreamUnavailable(Some(err)),
            UpstreamError::Status { status, body } => GatewayError::UpstreamStatus { status, body },
        }
    }
}

/// Upstream response body; holds its connection slot until dropped.
pub(crate) struct UpstreamBody {
    inner: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    _permit: OwnedSemaphorePermit,
}

impl UpstreamBody {
    /// Reads the whole body, e.g. for embeddings or `stream: false`.
    pub(crate) async fn collect(mut self) -> Result<Bytes, reqwest::Error> {
        let mut out = Vec::new();
        while let Some(chunk) = self.inner.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(out))
    }
}

impl Stream for UpstreamBody {
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[derive(Clone)]
pub(crate) struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    permits: Arc<Semaphore>,
    request_timeout: Duration,
}

pub(crate) fn build_http_client() -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(format!("sybil-gateway/{}", env!("CARGO_PKG_VERSION")))
        .pool_max_idle_per_host(UPSTREAM_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(UPSTREAM_IDLE_TIMEOUT)
        .timeout(UPSTREAM_CLIENT_TIMEOUT)
        .build()
        .map_err(|e| AppError::new("HTTP_CLIENT_INIT", e.to_string()))
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

impl UpstreamClient {
    pub(crate) fn new(client: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        Self {
            client,
            base_url: normalize_base_url(base_url),
            api_key: api_key.to_string(),
            permits: Arc::new(Semaphore::new(UPSTREAM_MAX_CONNS_PER_HOST)),
            request_timeout: UPSTREAM_REQUEST_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub(crate) fn url_for(&self, kind: EndpointKind) -> String {
        format!("{}{}", self.base_url, kind.upstream_path())
    }

    /// Sends the normalized body once. Non-200 answers are returned as errors with a
    /// truncated body; nothing is retried.
    pub(crate) async fn open(
        &self,
        kind: EndpointKind,
        model: &str,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<UpstreamBody, UpstreamError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpstreamError::Canceled),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| UpstreamError::Canceled)?
            }
        };

        let request = self
            .client
            .post(self.url_for(kind))
            .bearer_auth(&self.api_key)
            .header("X-Targon-Model", model)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpstreamError::Canceled),
            sent = tokio::time::timeout(self.request_timeout, request) => match sent {
                Err(_) => return Err(UpstreamError::ColdStart),
                Ok(Err(err)) => return Err(UpstreamError::Network(err)),
                Ok(Ok(response)) => response,
            },
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            let body = truncate_utf8(&body, UPSTREAM_ERROR_BODY_MAX_BYTES).to_string();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(UpstreamBody {
            inner: response.bytes_stream().boxed(),
            _permit: permit,
        })
    }
}

fn truncate_utf8(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn base_url_gets_scheme_and_loses_trailing_slash() {
        assert_eq!(normalize_base_url("hub:8080/"), "http://hub:8080");
        assert_eq!(normalize_base_url("https://hub"), "https://hub");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_utf8("héllo", 2), "h");
        assert_eq!(truncate_utf8("abc", 10), "abc");
    }

    #[tokio::test]
    async fn open_sends_auth_and_model_headers() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer upstream-key")
                    .header("x-targon-model", "m1")
                    .header("content-type", "application/json");
                then.status(200).body("data: [DONE]\n\n");
            })
            .await;

        let upstream = UpstreamClient::new(reqwest::Client::new(), &server.base_url(), "upstream-key");
        let body = upstream
            .open(
                EndpointKind::Chat,
                "m1",
                Bytes::from_static(b"{}"),
                &CancellationToken::new(),
            )
            .await
            .expect("open")
            .collect()
            .await
            .expect("collect");
        assert_eq!(&body[..], b"data: [DONE]\n\n");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_200_is_returned_without_retry() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/completions");
                then.status(500).body("boom");
            })
            .await;

        let upstream = UpstreamClient::new(reqwest::Client::new(), &server.base_url(), "k");
        let err = upstream
            .open(
                EndpointKind::Completion,
                "m1",
                Bytes::from_static(b"{}"),
                &CancellationToken::new(),
            )
            .await
            .err()
            .expect("non-200");
        assert!(matches!(err, UpstreamError::Status { status: 500, ref body } if body == "boom"));
        assert_eq!(err.code(), GatewayErrorCode::UpstreamNon200);
        mock.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn slow_upstream_is_a_cold_start() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).delay(Duration::from_millis(500));
            })
            .await;

        let upstream = UpstreamClient::new(reqwest::Client::new(), &server.base_url(), "k")
            .with_request_timeout(Duration::from_millis(50));
        let err = upstream
            .open(
                EndpointKind::Chat,
                "m1",
                Bytes::from_static(b"{}"),
                &CancellationToken::new(),
            )
            .await
            .err()
            .expect("timeout");
        assert!(matches!(err, UpstreamError::ColdStart));
    }

    #[tokio::test]
    async fn canceled_token_short_circuits() {
        let upstream = UpstreamClient::new(reqwest::Client::new(), "127.0.0.1:9", "k");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = upstream
            .open(EndpointKind::Chat, "m1", Bytes::new(), &cancel)
            .await
            .err()
            .expect("canceled");
        assert!(matches!(err, UpstreamError::Canceled));
    }
}
