//! Usage: Per-endpoint capability set: body normalization, chunk decoding and usage extraction.

use crate::domain::models::EndpointKind;
use crate::gateway::proxy::GatewayError;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(in crate::gateway) struct UpstreamUsage {
    pub(in crate::gateway) prompt_tokens: u64,
    pub(in crate::gateway) completion_tokens: u64,
}

/// What one upstream `data:` payload means for the caller and the accountant.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(in crate::gateway) struct ChunkOutcome {
    pub(in crate::gateway) delta: Option<String>,
    pub(in crate::gateway) usage: Option<UpstreamUsage>,
    pub(in crate::gateway) done: bool,
    pub(in crate::gateway) error: bool,
}

pub(in crate::gateway) trait EndpointCodec: Send + Sync {
    /// Validates and rewrites the request body in place; returns whether the response streams.
    fn normalize_body(&self, body: &mut Map<String, Value>) -> Result<bool, GatewayError>;

    /// `event` is the most recent `event:` line, if the upstream sends them.
    fn decode_chunk(&self, event: Option<&str>, data: &Value) -> ChunkOutcome;

    /// Usage from a complete, non-streamed response body.
    fn finalize_usage(&self, response: &Value) -> Option<UpstreamUsage>;
}

pub(in crate::gateway) fn codec_for(kind: EndpointKind) -> &'static dyn EndpointCodec {
    match kind {
        EndpointKind::Chat => &ChatCodec,
        EndpointKind::Completion => &CompletionCodec,
        EndpointKind::Embedding => &EmbeddingCodec,
        EndpointKind::Responses => &ResponsesCodec,
    }
}

fn bad_request(message: &str) -> GatewayError {
    GatewayError::BadRequest(message.to_string())
}

fn default_stream(body: &mut Map<String, Value>) -> Result<bool, GatewayError> {
    match body.get("stream") {
        None | Some(Value::Null) => {
            body.insert("stream".into(), Value::Bool(true));
            Ok(true)
        }
        Some(Value::Bool(stream)) => Ok(*stream),
        Some(_) => Err(bad_request("stream must be a boolean")),
    }
}

/// Shared by chat and completions.
fn normalize_token_stream(body: &mut Map<String, Value>) -> Result<bool, GatewayError> {
    let stream = default_stream(body)?;
    if stream {
        let options = body
            .entry("stream_options")
            .or_insert_with(|| Value::Object(Map::new()));
        if !options.is_object() {
            *options = Value::Object(Map::new());
        }
        if let Value::Object(options) = options {
            options.insert("include_usage".into(), Value::Bool(true));
        }
    }
    if matches!(body.get("logprobs"), None | Some(Value::Null)) {
        body.insert("logprobs".into(), Value::Bool(false));
    }
    Ok(stream)
}

fn openai_usage(response: &Value) -> Option<UpstreamUsage> {
    let usage = response.get("usage")?.as_object()?;
    let prompt_tokens = usage.get("prompt_tokens").and_then(Value::as_u64)?;
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(UpstreamUsage {
        prompt_tokens,
        completion_tokens,
    })
}

fn responses_usage(response: &Value) -> Option<UpstreamUsage> {
    let usage = response.get("usage")?.as_object()?;
    Some(UpstreamUsage {
        prompt_tokens: usage.get("input_tokens").and_then(Value::as_u64)?,
        completion_tokens: usage
            .get("output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}

fn first_choice(data: &Value) -> Option<&Value> {
    data.get("choices")?.as_array()?.first()
}

struct ChatCodec;

impl EndpointCodec for ChatCodec {
    fn normalize_body(&self, body: &mut Map<String, Value>) -> Result<bool, GatewayError> {
        normalize_token_stream(body)
    }

    fn decode_chunk(&self, _event: Option<&str>, data: &Value) -> ChunkOutcome {
        ChunkOutcome {
            delta: first_choice(data)
                .and_then(|c| c.pointer("/delta/content"))
                .and_then(Value::as_str)
                .map(str::to_string),
            usage: openai_usage(data),
            done: false,
            error: data.get("error").is_some_and(|e| !e.is_null()),
        }
    }

    fn finalize_usage(&self, response: &Value) -> Option<UpstreamUsage> {
        openai_usage(response)
    }
}

struct CompletionCodec;

impl EndpointCodec for CompletionCodec {
    fn normalize_body(&self, body: &mut Map<String, Value>) -> Result<bool, GatewayError> {
        normalize_token_stream(body)
    }

    fn decode_chunk(&self, _event: Option<&str>, data: &Value) -> ChunkOutcome {
        ChunkOutcome {
            delta: first_choice(data)
                .and_then(|c| c.get("text"))
                .and_then(Value::as_str)
                .map(str::to_string),
            usage: openai_usage(data),
            done: false,
            error: data.get("error").is_some_and(|e| !e.is_null()),
        }
    }

    fn finalize_usage(&self, response: &Value) -> Option<UpstreamUsage> {
        openai_usage(response)
    }
}

struct ResponsesCodec;

impl EndpointCodec for ResponsesCodec {
    fn normalize_body(&self, body: &mut Map<String, Value>) -> Result<bool, GatewayError> {
        match body.get("input") {
            None => return Err(bad_request("input is required for responses")),
            Some(Value::Array(items)) if items.is_empty() => {
                return Err(bad_request("input array cannot be empty"))
            }
            Some(Value::Array(_)) => {}
            Some(_) => return Err(bad_request("input must be an array")),
        }
        default_stream(body)
    }

    fn decode_chunk(&self, event: Option<&str>, data: &Value) -> ChunkOutcome {
        let kind = data
            .get("type")
            .and_then(Value::as_str)
            .or(event)
            .unwrap_or_default();
        match kind {
            "response.output_text.delta" => ChunkOutcome {
                delta: data.get("delta").and_then(Value::as_str).map(str::to_string),
                ..ChunkOutcome::default()
            },
            "response.completed" => ChunkOutcome {
                usage: data.get("response").and_then(responses_usage),
                done: true,
                ..ChunkOutcome::default()
            },
            "response.failed" | "error" => ChunkOutcome {
                error: true,
                ..ChunkOutcome::default()
            },
            _ => ChunkOutcome::default(),
        }
    }

    fn finalize_usage(&self, response: &Value) -> Option<UpstreamUsage> {
        responses_usage(response)
    }
}

struct EmbeddingCodec;

impl EndpointCodec for EmbeddingCodec {
    fn normalize_body(&self, body: &mut Map<String, Value>) -> Result<bool, GatewayError> {
        match body.get("input") {
            None => return Err(bad_request("input is required for embeddings")),
            Some(Value::String(text)) if text.is_empty() => {
                return Err(bad_request("input cannot be empty"))
            }
            Some(Value::Array(items)) if items.is_empty() => {
                return Err(bad_request("input array cannot be empty"))
            }
            Some(Value::String(_) | Value::Array(_)) => {}
            Some(_) => return Err(bad_request("input must be string or array of strings")),
        }
        body.remove("stream");
        Ok(false)
    }

    fn decode_chunk(&self, _event: Option<&str>, _data: &Value) -> ChunkOutcome {
        ChunkOutcome::default()
    }

    fn finalize_usage(&self, response: &Value) -> Option<UpstreamUsage> {
        let usage = response.get("usage")?.as_object()?;
        Some(UpstreamUsage {
            prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_u64)?,
            completion_tokens: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn chat_defaults_to_stream_with_usage_and_no_logprobs() {
        let mut body = object(json!({"model": "m", "messages": []}));
        let stream = codec_for(EndpointKind::Chat)
            .normalize_body(&mut body)
            .expect("normalize");
        assert!(stream);
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["stream_options"]["include_usage"], json!(true));
        assert_eq!(body["logprobs"], json!(false));
    }

    #[test]
    fn chat_respects_explicit_values() {
        let mut body = object(json!({"model": "m", "stream": false, "logprobs": true}));
        let stream = codec_for(EndpointKind::Chat)
            .normalize_body(&mut body)
            .expect("normalize");
        assert!(!stream);
        assert!(body.get("stream_options").is_none());
        assert_eq!(body["logprobs"], json!(true));
    }

    #[test]
    fn embeddings_validate_input_and_never_stream() {
        let codec = codec_for(EndpointKind::Embedding);
        let mut ok = object(json!({"model": "e", "input": ["a"], "stream": true}));
        assert!(!codec.normalize_body(&mut ok).expect("valid"));
        assert!(ok.get("stream").is_none());

        for (body, message) in [
            (json!({"model": "e"}), "input is required for embeddings"),
            (json!({"model": "e", "input": ""}), "input cannot be empty"),
            (json!({"model": "e", "input": []}), "input array cannot be empty"),
            (json!({"model": "e", "input": 3}), "input must be string or array of strings"),
        ] {
            let err = codec.normalize_body(&mut object(body)).expect_err("invalid");
            assert_eq!(err.to_string(), message);
        }
    }

    #[test]
    fn responses_require_non_empty_array_input() {
        let codec = codec_for(EndpointKind::Responses);
        let err = codec
            .normalize_body(&mut object(json!({"model": "r", "input": "hi"})))
            .expect_err("string input");
        assert_eq!(err.to_string(), "input must be an array");
        assert!(codec
            .normalize_body(&mut object(json!({"model": "r", "input": [{"role": "user"}]})))
            .expect("valid"));
    }

    #[test]
    fn chat_chunk_yields_delta_and_terminal_usage() {
        let codec = codec_for(EndpointKind::Chat);
        let delta = codec.decode_chunk(None, &json!({"choices": [{"delta": {"content": "hi"}}]}));
        assert_eq!(delta.delta.as_deref(), Some("hi"));
        assert_eq!(delta.usage, None);

        let last = codec.decode_chunk(
            None,
            &json!({"choices": [], "usage": {"prompt_tokens": 50, "completion_tokens": 100, "total_tokens": 150}}),
        );
        assert_eq!(last.delta, None);
        assert_eq!(
            last.usage,
            Some(UpstreamUsage {
                prompt_tokens: 50,
                completion_tokens: 100
            })
        );
    }

    #[test]
    fn completion_chunk_reads_text() {
        let out = codec_for(EndpointKind::Completion)
            .decode_chunk(None, &json!({"choices": [{"text": "abc"}]}));
        assert_eq!(out.delta.as_deref(), Some("abc"));
    }

    #[test]
    fn responses_events_map_to_delta_and_done() {
        let codec = codec_for(EndpointKind::Responses);
        let delta = codec.decode_chunk(
            Some("response.output_text.delta"),
            &json!({"type": "response.output_text.delta", "delta": "x"}),
        );
        assert_eq!(delta.delta.as_deref(), Some("x"));

        let done = codec.decode_chunk(
            None,
            &json!({"type": "response.completed", "response": {"usage": {"input_tokens": 4, "output_tokens": 9}}}),
        );
        assert!(done.done);
        assert_eq!(
            done.usage,
            Some(UpstreamUsage {
                prompt_tokens: 4,
                completion_tokens: 9
            })
        );
    }

    #[test]
    fn embedding_usage_has_no_completion_tokens() {
        let usage = codec_for(EndpointKind::Embedding)
            .finalize_usage(&json!({"data": [], "usage": {"prompt_tokens": 8, "total_tokens": 8}}));
        assert_eq!(
            usage,
            Some(UpstreamUsage {
                prompt_tokens: 8,
                completion_tokens: 0
            })
        );
    }
}
