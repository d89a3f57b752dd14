//! Usage: Relay task that reads the upstream, feeds the accountant and writes SSE to the caller.

use super::accountant::{LineOutcome, UsageAccountant};
use super::sse::LineSplitter;
use super::RelayBodyStream;
use crate::gateway::proxy::{GatewayErrorCode, UpstreamBody};
use axum::body::{Body, Bytes};
use futures_util::StreamExt;
use std::convert::Infallible;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

const SSE_RELAY_BUFFER_CAPACITY: usize = 32;

enum Flow {
    Continue,
    Stop,
}

/// A caller that stops reading fills the channel; `cancel` still gets through.
async fn send_frame(
    tx: &Sender<Result<Bytes, Infallible>>,
    accountant: &mut UsageAccountant,
    cancel: &CancellationToken,
    frame: Bytes,
) -> Flow {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            accountant.cancel();
            Flow::Stop
        }
        sent = tx.send(Ok(frame)) => match sent {
            Ok(()) => Flow::Continue,
            Err(_) => {
                accountant.cancel();
                Flow::Stop
            }
        },
    }
}

async fn relay_line(
    tx: &Sender<Result<Bytes, Infallible>>,
    accountant: &mut UsageAccountant,
    cancel: &CancellationToken,
    line: &str,
) -> Flow {
    match accountant.on_line(line) {
        LineOutcome::Skip => Flow::Continue,
        LineOutcome::Emit(frame) => send_frame(tx, accountant, cancel, frame).await,
        LineOutcome::Finished(frame) => {
            // Already finalized; a closed or stalled receiver here changes nothing.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = tx.send(Ok(frame)) => {}
            }
            Flow::Stop
        }
        LineOutcome::Failed => Flow::Stop,
    }
}

/// Upstream deltas are re-framed in arrival order. Dropping the returned body (caller
/// disconnect) or firing `cancel` finalizes the request as canceled and closes the upstream.
pub(in crate::gateway) fn spawn_usage_sse_relay_body(
    upstream: UpstreamBody,
    accountant: UsageAccountant,
    cancel: CancellationToken,
) -> Body {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, Infallible>>(SSE_RELAY_BUFFER_CAPACITY);

    accountant.tasks().spawn(async move {
        let mut upstream = upstream;
        let mut accountant = accountant;
        let mut lines = LineSplitter::default();

        'relay: loop {
            tokio::select! {
                biased;
                _ = tx.closed() => {
                    accountant.cancel();
                    break 'relay;
                }
                _ = cancel.cancelled() => {
                    accountant.cancel();
                    break 'relay;
                }
                item = upstream.next() => match item {
                    Some(Ok(chunk)) => {
                        for line in lines.push(&chunk) {
                            if let Flow::Stop = relay_line(&tx, &mut accountant, &cancel, &line).await {
                                break 'relay;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        let code = if err.is_timeout() {
                            GatewayErrorCode::StreamAborted
                        } else {
                            GatewayErrorCode::StreamError
                        };
                        tracing::warn!("upstream stream failed: {err}");
                        accountant.fail(code);
                        break 'relay;
                    }
                    None => {
                        if let Some(line) = lines.finish() {
                            if let Flow::Stop = relay_line(&tx, &mut accountant, &cancel, &line).await {
                                break 'relay;
                            }
                        }
                        accountant.on_upstream_end();
                        break 'relay;
                    }
                },
            }
        }

        // Closes the upstream connection and releases its slot.
        drop(upstream);
    });

    Body::from_stream(RelayBodyStream::new(rx))
}
