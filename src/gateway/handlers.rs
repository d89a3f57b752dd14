//! Usage: HTTP handlers (inference endpoints, model listing, admin catalog, metrics, liveness).

use super::auth::metrics_key_matches;
use super::middleware::{ErrorCounted, RequestId};
use super::normalize::normalize_request;
use super::proxy::{GatewayError, GatewayErrorCode, UpstreamError};
use super::streams::{spawn_usage_sse_relay_body, StreamFinalizeCtx, StreamState, UsageAccountant};
use crate::app::app_state::AppState;
use crate::domain::caller::Caller;
use crate::domain::models::{self, EndpointKind, ModelDescriptor, ModelUpdate, NewModel};
use crate::shared::blocking;
use crate::shared::error::AppError;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Instant;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

pub(in crate::gateway) async fn ping() -> StatusCode {
    StatusCode::OK
}

pub(in crate::gateway) async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !metrics_key_matches(&headers, &state.metrics_api_key) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    match state.metrics.render() {
        Ok(text) => ([(CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], text).into_response(),
        Err(err) => {
            tracing::error!("metrics encoding failed: {err}");
            GatewayError::Internal(AppError::new("METRICS", err.to_string())).into_response()
        }
    }
}

fn public_view(model: &ModelDescriptor) -> Value {
    json!({
        "id": model.name,
        "object": "model",
        "created": model.created_at,
        "owned_by": "sybil",
        "pricing": {
            "input": model.cost.input_cost_per_token,
            "output": model.cost.output_cost_per_token,
            "canceled": model.cost.canceled_request_cost,
        },
        "endpoints": model.endpoint_kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
    })
}

fn admin_view(model: &ModelDescriptor) -> Value {
    json!({
        "id": model.model_id,
        "name": model.name,
        "icpt": model.cost.input_cost_per_token,
        "ocpt": model.cost.output_cost_per_token,
        "crc": model.cost.canceled_request_cost,
        "supported_endpoints": model.endpoint_kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
        "enabled": model.enabled,
        "allowed_user_id": model.allowed_user_id,
        "created_at": model.created_at,
    })
}

pub(in crate::gateway) async fn list_models(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Value>, GatewayError> {
    let db = state.dbs.read.clone();
    let user_id = caller.user_id;
    let visible = blocking::run("list_models", move || models::list_visible(&db, user_id)).await?;
    Ok(Json(json!({
        "object": "list",
        "data": visible.iter().map(public_view).collect::<Vec<_>>(),
    })))
}

pub(in crate::gateway) async fn chat_completions(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Extension(request_id): Extension<RequestId>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    inference(state, EndpointKind::Chat, caller, request_id, body).await
}

pub(in crate::gateway) async fn completions(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Extension(request_id): Extension<RequestId>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    inference(state, EndpointKind::Completion, caller, request_id, body).await
}

pub(in crate::gateway) async fn embeddings(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Extension(request_id): Extension<RequestId>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    inference(state, EndpointKind::Embedding, caller, request_id, body).await
}

pub(in crate::gateway) async fn responses(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Extension(request_id): Extension<RequestId>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    inference(state, EndpointKind::Responses, caller, request_id, body).await
}

fn sse_response(body: Body) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// The error's accounting record (or an explicit metric call) already bumped the error count.
fn counted(err: GatewayError) -> Response {
    let mut response = err.into_response();
    response.extensions_mut().insert(ErrorCounted);
    response
}

/// Shared path for every inference endpoint. Once the accountant is open, every exit
/// (including this future being dropped) produces exactly one accounting record.
async fn inference(
    state: AppState,
    kind: EndpointKind,
    caller: Caller,
    RequestId(request_id): RequestId,
    raw: Bytes,
) -> Result<Response, GatewayError> {
    let started = Instant::now();
    let created_at = Utc::now();

    let request = normalize_request(kind, &caller, &raw)?;

    let model = match state.catalog.lookup(&request.model, caller.user_id).await {
        Ok(Some(model)) => model,
        Ok(None) => return Err(GatewayError::NotFound("model not found".into())),
        Err(err) => {
            state
                .metrics
                .error(&request.model, kind.as_str(), caller.user_id, "internal");
            return Ok(counted(err.into()));
        }
    };
    if !model.supports(kind) {
        return Err(GatewayError::BadRequest(format!(
            "model does not support {}",
            kind.as_str()
        )));
    }

    let model_name = model.name.clone();
    let mut accountant = UsageAccountant::open(StreamFinalizeCtx {
        request_id,
        user_id: caller.user_id,
        allow_overspend: caller.allow_overspend,
        model,
        endpoint: kind,
        started,
        created_at,
        sink: state.sink.clone(),
    });

    let cancel = state.cancel.child_token();
    let upstream = match state
        .upstream
        .open(kind, &model_name, request.body, &cancel)
        .await
    {
        Ok(upstream) => upstream,
        Err(UpstreamError::Canceled) => {
            accountant.cancel();
            return Err(UpstreamError::Canceled.into());
        }
        Err(err) => {
            accountant.fail_open(err.code());
            return Ok(counted(err.into()));
        }
    };

    if request.stream {
        let body = spawn_usage_sse_relay_body(upstream, accountant, cancel);
        return Ok(sse_response(body));
    }

    let collected = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            accountant.cancel();
            return Err(GatewayError::UpstreamUnavailable(None));
        }
        collected = upstream.collect() => collected,
    };
    match collected {
        Ok(bytes) => {
            accountant.on_complete_body(&bytes);
            if accountant.state() == StreamState::Errored {
                return Ok(counted(GatewayError::StreamDecode));
            }
            Ok(([(CONTENT_TYPE, "application/json")], bytes).into_response())
        }
        Err(err) => {
            let code = if err.is_timeout() {
                GatewayErrorCode::StreamAborted
            } else {
                GatewayErrorCode::StreamError
            };
            accountant.fail(code);
            Ok(counted(GatewayError::UpstreamUnavailable(Some(err))))
        }
    }
}

fn catalog_error(err: AppError) -> GatewayError {
    if err.code() == "SEC_INVALID_INPUT" {
        GatewayError::BadRequest(err.message().to_string())
    } else {
        GatewayError::Internal(err)
    }
}

fn parse_admin_body<T: serde::de::DeserializeOwned>(raw: &[u8]) -> Result<T, GatewayError> {
    serde_json::from_slice(raw).map_err(|_| GatewayError::BadRequest("malformed request".into()))
}

pub(in crate::gateway) async fn create_model(
    State(state): State<AppState>,
    raw: Bytes,
) -> Result<(StatusCode, Json<Value>), GatewayError> {
    let input: NewModel = parse_admin_body(&raw)?;
    let db = state.dbs.write.clone();
    let created = blocking::run("create_model", move || models::create(&db, &input))
        .await
        .map_err(catalog_error)?;
    state.catalog.invalidate(&created.name);
    tracing::info!(model_id = created.model_id, model = %created.name, "model created");
    Ok((StatusCode::CREATED, Json(admin_view(&created))))
}

pub(in crate::gateway) async fn update_model(
    State(state): State<AppState>,
    raw: Bytes,
) -> Result<Json<Value>, GatewayError> {
    let input: ModelUpdate = parse_admin_body(&raw)?;
    let id = input.id;
    let db = state.dbs.write.clone();
    let name = blocking::run("update_model", move || models::update(&db, &input))
        .await
        .map_err(catalog_error)?
        .ok_or_else(|| GatewayError::NotFound("model not found".into()))?;
    state.catalog.invalidate(&name);
    tracing::info!(model_id = id, model = %name, "model updated");
    Ok(Json(json!({ "id": id, "name": name })))
}

pub(in crate::gateway) async fn delete_model(
    State(state): State<AppState>,
    Path(uid): Path<u64>,
) -> Result<StatusCode, GatewayError> {
    let db = state.dbs.write.clone();
    let name = blocking::run("delete_model", move || models::delete(&db, uid))
        .await
        .map_err(catalog_error)?
        .ok_or_else(|| GatewayError::NotFound("model not found".into()))?;
    state.catalog.invalidate(&name);
    tracing::info!(model_id = uid, model = %name, "model deleted");
    Ok(StatusCode::NO_CONTENT)
}
