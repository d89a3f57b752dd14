//! Usage: Validate an inference body and apply per-endpoint defaults before it goes upstream.

use crate::domain::caller::Caller;
use crate::domain::models::EndpointKind;
use crate::gateway::proxy::GatewayError;
use crate::gateway::streams::codec_for;
use axum::body::Bytes;
use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub(in crate::gateway) struct NormalizedRequest {
    pub(in crate::gateway) model: String,
    pub(in crate::gateway) stream: bool,
    pub(in crate::gateway) body: Bytes,
}

/// Input validation runs first, then the balance gate, so a broken request never reads as 402.
pub(in crate::gateway) fn normalize_request(
    kind: EndpointKind,
    caller: &Caller,
    raw: &[u8],
) -> Result<NormalizedRequest, GatewayError> {
    let mut body: Map<String, Value> = match serde_json::from_slice(raw) {
        Ok(Value::Object(map)) => map,
        _ => return Err(GatewayError::BadRequest("malformed request".into())),
    };

    let model = match body.get("model") {
        Some(Value::String(name)) if !name.trim().is_empty() => name.trim().to_string(),
        _ => return Err(GatewayError::BadRequest("model is required".into())),
    };

    let stream = codec_for(kind).normalize_body(&mut body)?;

    if !caller.has_balance() {
        tracing::info!(
            user_id = caller.user_id,
            credits = caller.credits,
            plan_requests = caller.plan_requests,
            "insufficient requests or credits"
        );
        return Err(GatewayError::PaymentRequired);
    }

    let body = serde_json::to_vec(&Value::Object(body))
        .map_err(|e| GatewayError::Internal(e.into()))?;
    Ok(NormalizedRequest {
        model,
        stream,
        body: Bytes::from(body),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::caller::Role;

    fn caller(credits: u64, plan_requests: u32) -> Caller {
        Caller {
            user_id: 1,
            role: Role::User,
            credits,
            plan_requests,
            allow_overspend: false,
            api_key: "k".repeat(32),
        }
    }

    #[test]
    fn missing_model_is_bad_request() {
        let err = normalize_request(EndpointKind::Chat, &caller(10, 0), br#"{"messages":[]}"#)
            .expect_err("no model");
        assert_eq!(err.to_string(), "model is required");
    }

    #[test]
    fn non_object_body_is_malformed() {
        let err = normalize_request(EndpointKind::Chat, &caller(10, 0), b"[1,2]").expect_err("array");
        assert_eq!(err.to_string(), "malformed request");
    }

    #[test]
    fn empty_balance_is_payment_required_after_validation() {
        let err = normalize_request(EndpointKind::Chat, &caller(0, 0), br#"{"model":"m"}"#)
            .expect_err("broke");
        assert!(matches!(err, GatewayError::PaymentRequired));

        let err = normalize_request(EndpointKind::Embedding, &caller(0, 0), br#"{"model":"m"}"#)
            .expect_err("invalid first");
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[test]
    fn chat_body_is_rewritten_with_stream_defaults() {
        let out = normalize_request(
            EndpointKind::Chat,
            &caller(0, 2),
            br#"{"model":" m1 ","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .expect("normalize");
        assert_eq!(out.model, "m1");
        assert!(out.stream);
        let body: Value = serde_json::from_slice(&out.body).expect("json");
        assert_eq!(body["stream_options"]["include_usage"], Value::Bool(true));
        assert_eq!(body["messages"][0]["content"], "hi");
    }
}
