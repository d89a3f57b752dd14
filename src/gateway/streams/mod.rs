//! Usage: Streaming relay: upstream decode, per-request accounting and SSE re-framing.

mod accountant;
mod codec;
mod request_end;
mod sse;
mod usage_tee;


pub(in crate::gateway) use accountant::{StreamState, UsageAccountant};
pub(in crate::gateway) use codec::codec_for;
pub(crate) use request_end::RequestEndSink;
pub(in crate::gateway) use usage_tee::spawn_usage_sse_relay_body;

use crate::domain::models::{EndpointKind, ModelDescriptor};
use axum::body::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

/// Everything needed to build the accounting record once the request ends.
pub(in crate::gateway) struct StreamFinalizeCtx {
    pub(in crate::gateway) request_id: String,
    pub(in crate::gateway) user_id: u64,
    pub(in crate::gateway) allow_overspend: bool,
    pub(in crate::gateway) model: ModelDescriptor,
    pub(in crate::gateway) endpoint: EndpointKind,
    pub(in crate::gateway) started: Instant,
    pub(in crate::gateway) created_at: DateTime<Utc>,
    pub(in crate::gateway) sink: Arc<RequestEndSink>,
}

pub(in crate::gateway) struct RelayBodyStream {
    rx: tokio::sync::mpsc::Receiver<Result<Bytes, Infallible>>,
}

impl RelayBodyStream {
    pub(in crate::gateway) fn new(rx: tokio::sync::mpsc::Receiver<Result<Bytes, Infallible>>) -> Self {
        Self { rx }
    }
}

impl Stream for RelayBodyStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        Pin::new(&mut this.rx).poll_recv(cx)
    }
}
