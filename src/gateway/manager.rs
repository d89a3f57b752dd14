//! Usage: Own the HTTP server, the accounting flusher and the ordered shutdown sequence.

use super::routes::build_router;
use crate::app::app_state::AppServices;
use crate::infra::accounting::FlushOutcome;
use crate::shared::error::{AppError, AppResult};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Time given to streams after their cancel token fires before the server task is aborted.
const FORCED_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Serves until `shutdown` resolves, then: stop accepting, drain in-flight requests for up to
/// `drain_timeout`, cancel whatever is still streaming, wait for finalizers and debits, and
/// run one last accounting flush.
pub(crate) async fn serve(
    listener: TcpListener,
    services: AppServices,
    shutdown: impl Future<Output = ()> + Send + 'static,
    drain_timeout: Duration,
) -> AppResult<()> {
    let AppServices {
        state,
        buffer,
        flusher,
        tasks,
    } = services;

    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "gateway listening");
    }

    let flusher_stop = CancellationToken::new();
    let flusher_task = flusher.clone().spawn(flusher_stop.clone());

    let stop = CancellationToken::new();
    let server_stop = stop.clone();
    let router = build_router(state.clone());
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_stop.cancelled().await })
            .await
    });

    let mut server_result = None;
    tokio::select! {
        _ = shutdown => tracing::info!("shutdown requested, draining in-flight requests"),
        joined = &mut server => server_result = Some(joined),
    }
    stop.cancel();

    let joined = match server_result {
        Some(joined) => Some(joined),
        None => match tokio::time::timeout(drain_timeout, &mut server).await {
            Ok(joined) => Some(joined),
            Err(_) => {
                tracing::warn!(
                    timeout_secs = drain_timeout.as_secs(),
                    "drain window elapsed, cancelling in-flight requests"
                );
                state.cancel.cancel();
                match tokio::time::timeout(FORCED_CANCEL_GRACE, &mut server).await {
                    Ok(joined) => Some(joined),
                    Err(_) => {
                        server.abort();
                        None
                    }
                }
            }
        },
    };

    let serve_result = match joined {
        Some(Ok(Ok(()))) => Ok(()),
        Some(Ok(Err(err))) => Err(AppError::with_source("SERVE", "http server failed", err)),
        Some(Err(join_err)) => Err(AppError::new("SERVE", format!("server task failed: {join_err}"))),
        None => Ok(()),
    };

    // Anything still relaying now sees its cancel token fire and finalizes.
    state.cancel.cancel();

    flusher_stop.cancel();
    if let Err(err) = flusher_task.await {
        tracing::error!("flusher task failed: {err}");
    }

    tasks.close();
    if tokio::time::timeout(FORCED_CANCEL_GRACE, tasks.wait()).await.is_err() {
        tracing::warn!(
            outstanding = tasks.len(),
            "relay tasks still running after cancel, flushing without them"
        );
    }

    tracing::info!(pending = buffer.len(), "running final accounting flush");
    match flusher.flush_once().await {
        FlushOutcome::Dropped { records } => {
            tracing::error!(records, "final accounting flush failed, records lost");
        }
        outcome => tracing::info!(?outcome, "final accounting flush done"),
    }

    serve_result
}
