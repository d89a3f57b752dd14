//! Usage: Caller-facing error kinds and their HTTP rendering.
//!
//! Auth failures answer with the bare canonical message; everything else uses an
//! OpenAI-style JSON error object so SDK clients can surface it.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use super::GatewayErrorCode;
use crate::domain::identity::ResolveError;
use crate::shared::error::AppError;

#[derive(Debug, thiserror::Error)]
pub(crate) enum GatewayError {
    #[error("missing authorization header")]
    MissingAuth,
    #[error("invalid authentication format")]
    InvalidAuthFormat,
    #[error("invalid API key length")]
    InvalidKeyLength,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("{0}")]
    BadRequest(String),
    #[error("insufficient requests or credits")]
    PaymentRequired,
    #[error("{0}")]
    NotFound(String),
    #[error("upstream unavailable")]
    UpstreamUnavailable(#[source] Option<reqwest::Error>),
    #[error("downstream request failed")]
    UpstreamStatus { status: u16, body: String },
    #[error("cold start detected, please try again in a few minutes")]
    ColdStart,
    #[error("failed to decode upstream response")]
    StreamDecode,
    #[error("internal server error")]
    Internal(#[source] AppError),
}

#[derive(Debug, Serialize)]
struct OpenAiErrorBody {
    error: OpenAiError,
}

#[derive(Debug, Serialize)]
struct OpenAiError {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    code: &'static str,
}

impl GatewayError {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            Self::MissingAuth | Self::InvalidAuthFormat | Self::InvalidKeyLength | Self::Unauthorized => {
                StatusCode::UNAUTHORIZED
            }
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PaymentRequired => StatusCode::PAYMENT_REQUIRED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::UpstreamUnavailable(_)
            | Self::UpstreamStatus { .. }
            | Self::StreamDecode => StatusCode::BAD_GATEWAY,
            Self::ColdStart => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable label for metrics and logs.
    pub(crate) fn code(&self) -> &'static str {
        match self {
            Self::MissingAuth => "missing_auth",
            Self::InvalidAuthFormat => "invalid_auth_format",
            Self::InvalidKeyLength => "invalid_key_length",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::BadRequest(_) => "bad_request",
            Self::PaymentRequired => "payment_required",
            Self::NotFound(_) => "not_found",
            Self::UpstreamUnavailable(_) => GatewayErrorCode::UpstreamUnavailable.as_str(),
            Self::UpstreamStatus { .. } => GatewayErrorCode::UpstreamNon200.as_str(),
            Self::ColdStart => GatewayErrorCode::ModelColdStart.as_str(),
            Self::StreamDecode => GatewayErrorCode::StreamDecode.as_str(),
            Self::Internal(_) => GatewayErrorCode::Internal.as_str(),
        }
    }

    fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::MissingAuth | Self::InvalidAuthFormat | Self::InvalidKeyLength | Self::Unauthorized
        )
    }

    fn error_type(&self) -> &'static str {
        match self.status().as_u16() {
            400 | 404 => "invalid_request_error",
            402 => "insufficient_quota",
            403 => "permission_error",
            _ => "server_error",
        }
    }
}

impl From<ResolveError> for GatewayError {
    fn from(value: ResolveError) -> Self {
        match value {
            ResolveError::MissingHeader => Self::MissingAuth,
            ResolveError::InvalidFormat => Self::InvalidAuthFormat,
            ResolveError::InvalidLength => Self::InvalidKeyLength,
            ResolveError::Unauthorized => Self::Unauthorized,
        }
    }
}

impl From<AppError> for GatewayError {
    fn from(value: AppError) -> Self {
        Self::Internal(value)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let Self::UpstreamStatus {
            status: upstream_status,
            body,
        } = &self
        {
            tracing::warn!(upstream_status, upstream_body = %body, "upstream returned non-200");
        } else if status.is_server_error() {
            tracing::warn!(code = self.code(), error = ?self, "request failed");
        }

        if self.is_auth() {
            let mut resp = (status, self.to_string()).into_response();
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            return resp;
        }

        let payload = OpenAiErrorBody {
            error: OpenAiError {
                message: self.to_string(),
                kind: self.error_type(),
                code: self.code(),
            },
        };
        (status, Json(payload)).into_response()
    }
}

/// Connect and transport failures before any byte arrived.
pub(super) fn classify_reqwest_error(err: &reqwest::Error) -> GatewayErrorCode {
    if err.is_timeout() {
        return GatewayErrorCode::ModelColdStart;
    }
    if err.is_decode() || err.is_body() {
        return GatewayErrorCode::StreamError;
    }
    GatewayErrorCode::UpstreamUnavailable
}
