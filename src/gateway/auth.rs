//! Usage: Caller authentication middleware (attach, require, admin gate) and the metrics key check.

use super::proxy::GatewayError;
use crate::app::app_state::AppState;
use crate::domain::caller::Caller;
use crate::domain::identity::{extract_api_key, ResolveError};
use axum::body::Body;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};

/// Why no caller was attached; read back by [`require_caller`].
#[derive(Debug, Clone, Copy)]
struct AuthFailure(ResolveError);

/// Caller id stamped on the response so the tracking layer can label error metrics.
#[derive(Debug, Clone, Copy)]
pub(in crate::gateway) struct ServedCaller(pub(in crate::gateway) u64);

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())
}

/// Never rejects: resolves the caller when the header allows it and records the reason otherwise.
pub(in crate::gateway) async fn attach_caller(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let resolved = match extract_api_key(authorization(req.headers())) {
        Ok(key) => state.resolver.resolve(key).await,
        Err(err) => Err(err),
    };
    let mut served = None;
    match resolved {
        Ok(caller) => {
            tracing::Span::current().record("user_id", caller.user_id);
            served = Some(ServedCaller(caller.user_id));
            req.extensions_mut().insert(caller);
        }
        Err(err) => {
            req.extensions_mut().insert(AuthFailure(err));
        }
    }
    let mut response = next.run(req).await;
    if let Some(served) = served {
        response.extensions_mut().insert(served);
    }
    response
}

pub(in crate::gateway) async fn require_caller(req: Request<Body>, next: Next) -> Response {
    if req.extensions().get::<Caller>().is_some() {
        return next.run(req).await;
    }
    let reason = req
        .extensions()
        .get::<AuthFailure>()
        .map(|f| f.0)
        .unwrap_or(ResolveError::MissingHeader);
    GatewayError::from(reason).into_response()
}

pub(in crate::gateway) async fn require_admin(req: Request<Body>, next: Next) -> Response {
    match req.extensions().get::<Caller>() {
        Some(caller) if caller.is_admin() => next.run(req).await,
        Some(caller) => {
            tracing::warn!(user_id = caller.user_id, "admin route refused");
            GatewayError::Forbidden.into_response()
        }
        None => GatewayError::MissingAuth.into_response(),
    }
}

/// Compares digests so the comparison time does not depend on the key prefix.
pub(in crate::gateway) fn metrics_key_matches(headers: &HeaderMap, expected: &str) -> bool {
    let Some(token) = authorization(headers)
        .map(str::trim)
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return false;
    };
    Sha256::digest(token.trim().as_bytes()) == Sha256::digest(expected.as_bytes())
}
