//! Usage: Per-request tracking span, status metrics and panic recovery.

use super::auth::ServedCaller;
use crate::app::app_state::AppState;
use crate::infra::error_report::ErrorReporter;
use crate::shared::ids::new_request_id;
use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::any::Any;
use std::time::Instant;
use tower_http::catch_panic::ResponseForPanic;
use tracing::Instrument;

const EXTERNAL_REQUEST_ID_HEADER: &str = "x-external-request-id";
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Id minted by [`track`]; also the accounting record's `request_id`.
#[derive(Debug, Clone)]
pub(in crate::gateway) struct RequestId(pub(in crate::gateway) String);

/// Set on a 5xx response whose error count was already bumped closer to the cause.
#[derive(Debug, Clone, Copy)]
pub(in crate::gateway) struct ErrorCounted;

#[derive(Debug, Clone, Copy)]
struct Panicked;

/// Every 5xx moves `sybil_api_error_count` exactly once.
fn count_server_error(state: &AppState, path: &str, response: &Response) {
    let extensions = response.extensions();
    if extensions.get::<ErrorCounted>().is_some() {
        return;
    }
    let user_id = extensions.get::<ServedCaller>().map_or(0, |c| c.0);
    let from = if extensions.get::<Panicked>().is_some() {
        "panic"
    } else {
        "gateway"
    };
    state.metrics.error("", path, user_id, from);
}

pub(in crate::gateway) async fn track(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let request_id = new_request_id();
    let external_id = req
        .headers()
        .get(EXTERNAL_REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_default();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let method = req.method().clone();

    req.extensions_mut().insert(RequestId(request_id.clone()));

    let span = tracing::info_span!(
        "request",
        request_id = %format!("req_{request_id}"),
        externalid = %external_id,
        method = %method,
        path = %path,
        user_id = tracing::field::Empty,
    );

    let started = Instant::now();
    let mut response = next.run(req).instrument(span.clone()).await;
    let status = response.status().as_u16();
    let duration_ms = started.elapsed().as_millis() as u64;

    span.in_scope(|| match status {
        0..=299 => tracing::info!(status, duration_ms, "end_of_request"),
        300..=499 => tracing::warn!(status, duration_ms, "end_of_request"),
        _ => tracing::error!(status, duration_ms, "end_of_request"),
    });

    state.metrics.response_status(&path, status);
    if status >= 500 {
        count_server_error(&state, &path, &response);
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Turns a handler panic into a plain 500 and alerts the error-report sink.
#[derive(Clone)]
pub(in crate::gateway) struct PanicResponder {
    reporter: ErrorReporter,
}

impl PanicResponder {
    pub(in crate::gateway) fn new(reporter: ErrorReporter) -> Self {
        Self { reporter }
    }
}

fn panic_message<'a>(err: &'a (dyn Any + Send + 'static)) -> &'a str {
    if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic payload"
    }
}

impl ResponseForPanic for PanicResponder {
    type ResponseBody = Body;

    fn response_for_panic(&mut self, err: Box<dyn Any + Send + 'static>) -> Response<Body> {
        let message = panic_message(err.as_ref());
        tracing::error!("handler panicked: {message}");
        self.reporter.report("panic", format!("handler panicked: {message}"));

        let mut response = (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response.extensions_mut().insert(Panicked);
        response
    }
}
