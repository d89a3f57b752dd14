//! Usage: Per-request usage state machine; produces exactly one accounting record.
//!
//! Init -> Streaming -> Done | Canceled | Errored. Whatever path ends the request,
//! including the accountant being dropped mid-flight, finalizes once.

use super::codec::{codec_for, EndpointCodec, UpstreamUsage};
use super::sse::{answer_frame, UpstreamLine};
use super::StreamFinalizeCtx;
use crate::domain::credits::credits_for_outcome;
use crate::domain::usage::{AccountingRecord, TokenUsage};
use crate::gateway::proxy::GatewayErrorCode;
use axum::body::Bytes;
use serde_json::Value;
use std::time::Duration;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(in crate::gateway) enum StreamState {
    Init,
    Streaming,
    Done,
    Canceled,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(in crate::gateway) enum LineOutcome {
    Skip,
    Emit(Bytes),
    /// Terminal frame; the relay stops reading after sending it.
    Finished(Bytes),
    Failed,
}

pub(in crate::gateway) struct UsageAccountant {
    ctx: StreamFinalizeCtx,
    codec: &'static dyn EndpointCodec,
    state: StreamState,
    event: Option<String>,
    time_to_first_token: Option<Duration>,
    streamed_tokens: u64,
    upstream_usage: Option<UpstreamUsage>,
    error_code: Option<GatewayErrorCode>,
    finalized: bool,
}

impl UsageAccountant {
    /// Counts the request as in flight until it is finalized.
    pub(in crate::gateway) fn open(ctx: StreamFinalizeCtx) -> Self {
        ctx.sink.opened(ctx.user_id);
        Self {
            codec: codec_for(ctx.endpoint),
            ctx,
            state: StreamState::Init,
            event: None,
            time_to_first_token: None,
            streamed_tokens: 0,
            upstream_usage: None,
            error_code: None,
            finalized: false,
        }
    }

    pub(in crate::gateway) fn tasks(&self) -> TaskTracker {
        self.ctx.sink.tasks()
    }

    pub(in crate::gateway) fn state(&self) -> StreamState {
        self.state
    }

    pub(in crate::gateway) fn is_terminal(&self) -> bool {
        !matches!(self.state, StreamState::Init | StreamState::Streaming)
    }

    pub(in crate::gateway) fn on_line(&mut self, line: &str) -> LineOutcome {
        if self.is_terminal() {
            return LineOutcome::Skip;
        }

        let payload = match UpstreamLine::parse(line) {
            UpstreamLine::Blank | UpstreamLine::Other => return LineOutcome::Skip,
            UpstreamLine::Event(name) => {
                self.event = Some(name.to_string());
                return LineOutcome::Skip;
            }
            UpstreamLine::Data("[DONE]") => return self.complete(),
            UpstreamLine::Data(payload) => payload,
        };

        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(request_id = %self.ctx.request_id, "malformed upstream chunk: {err}");
                self.fail(GatewayErrorCode::StreamDecode);
                return LineOutcome::Failed;
            }
        };

        let outcome = self.codec.decode_chunk(self.event.take().as_deref(), &value);
        if outcome.error {
            self.fail(GatewayErrorCode::StreamError);
            return LineOutcome::Failed;
        }
        if let Some(usage) = outcome.usage {
            self.upstream_usage = Some(usage);
        }
        if outcome.done {
            return self.complete();
        }

        match outcome.delta {
            Some(text) if !text.is_empty() => {
                self.on_token();
                LineOutcome::Emit(answer_frame(&text, false))
            }
            _ => LineOutcome::Skip,
        }
    }

    fn on_token(&mut self) {
        if self.state == StreamState::Init {
            self.state = StreamState::Streaming;
            self.time_to_first_token = Some(self.ctx.started.elapsed());
        }
        self.streamed_tokens = self.streamed_tokens.saturating_add(1);
    }

    fn complete(&mut self) -> LineOutcome {
        self.state = StreamState::Done;
        self.finalize();
        LineOutcome::Finished(answer_frame("", true))
    }

    /// Upstream closed cleanly; without a completion marker the request is errored.
    pub(in crate::gateway) fn on_upstream_end(&mut self) {
        if !self.is_terminal() {
            self.fail(GatewayErrorCode::MissingDoneToken);
        }
    }

    pub(in crate::gateway) fn fail(&mut self, code: GatewayErrorCode) {
        if self.is_terminal() {
            return;
        }
        self.state = StreamState::Errored;
        self.error_code = Some(code);
        self.finalize();
    }

    pub(in crate::gateway) fn cancel(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.state = StreamState::Canceled;
        self.finalize();
    }

    /// The upstream never produced a usable response; billed and rolled up as canceled.
    pub(in crate::gateway) fn fail_open(&mut self, code: GatewayErrorCode) {
        if self.is_terminal() {
            return;
        }
        self.state = StreamState::Canceled;
        self.error_code = Some(code);
        self.finalize();
    }

    /// Non-streamed response: usage comes from the single JSON body.
    pub(in crate::gateway) fn on_complete_body(&mut self, body: &[u8]) {
        if self.is_terminal() {
            return;
        }
        self.time_to_first_token = Some(self.ctx.started.elapsed());
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => {
                self.upstream_usage = self.codec.finalize_usage(&value);
                self.state = StreamState::Done;
                self.finalize();
            }
            Err(err) => {
                tracing::warn!(request_id = %self.ctx.request_id, "non-JSON upstream body: {err}");
                self.fail(GatewayErrorCode::StreamDecode);
            }
        }
    }

    fn usage(&self) -> TokenUsage {
        let canceled = self.state == StreamState::Canceled;
        match self.upstream_usage {
            Some(usage) => TokenUsage::new(usage.prompt_tokens, usage.completion_tokens, canceled),
            None => TokenUsage::new(0, self.streamed_tokens, canceled),
        }
    }

    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        let usage = self.usage();
        let errored = self.state == StreamState::Errored;
        let total_credits = credits_for_outcome(&usage, &self.ctx.model.cost, errored);

        let record = AccountingRecord {
            request_id: self.ctx.request_id.clone(),
            user_id: self.ctx.user_id,
            model_id: self.ctx.model.model_id,
            model_name: self.ctx.model.name.clone(),
            endpoint: self.ctx.endpoint,
            created_at: self.ctx.created_at,
            time_to_first_token: self.time_to_first_token,
            total_time: self.ctx.started.elapsed(),
            usage,
            total_credits,
            error_code: self.error_code.map(GatewayErrorCode::as_str),
            allow_overspend: self.ctx.allow_overspend,
        };
        self.ctx.sink.finish(record);
    }
}

impl Drop for UsageAccountant {
    fn drop(&mut self) {
        if !self.finalized {
            // Dropped before a terminal event: the caller went away or the relay died.
            self.state = StreamState::Canceled;
            self.finalize();
        }
    }
}
