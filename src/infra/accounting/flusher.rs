//! Usage: Periodic task that drains the accounting buffer into SQLite.

use super::rollup::build_batch;
use super::store::{apply_batch, ApplyOutcome};
use super::AccountingBuffer;
use crate::infra::db::Db;
use crate::infra::error_report::ErrorReporter;
use crate::infra::metrics::GatewayMetrics;
use crate::shared::blocking;
use crate::shared::constants::{BUCKET_FLUSH_INTERVAL, BUCKET_RETRY_DELAY, MAX_FLUSH_RETRIES};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub interval: Duration,
    pub retry_delay: Duration,
    /// Extra attempts after the first failed write.
    pub max_retries: u32,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            interval: BUCKET_FLUSH_INTERVAL,
            retry_delay: BUCKET_RETRY_DELAY,
            max_retries: MAX_FLUSH_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    Applied { records: usize, attempts: u32 },
    AlreadyApplied,
    Dropped { records: usize },
}

pub struct AccountingFlusher {
    buffer: Arc<AccountingBuffer>,
    db: Db,
    metrics: Arc<GatewayMetrics>,
    reporter: ErrorReporter,
    policy: FlushPolicy,
}

impl AccountingFlusher {
    pub fn new(
        buffer: Arc<AccountingBuffer>,
        db: Db,
        metrics: Arc<GatewayMetrics>,
        reporter: ErrorReporter,
        policy: FlushPolicy,
    ) -> Self {
        Self {
            buffer,
            db,
            metrics,
            reporter,
            policy,
        }
    }

    /// Runs until `shutdown` fires. The final flush is left to the caller so it can
    /// run after in-flight finalizers have pushed their records.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.policy.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.flush_once().await;
                    }
                }
            }
            tracing::info!("accounting flusher stopped");
        })
    }

    pub async fn flush_once(&self) -> FlushOutcome {
        let records = self.buffer.drain();
        if records.is_empty() {
            return FlushOutcome::Empty;
        }
        let record_count = records.len();
        let batch = Arc::new(build_batch(uuid::Uuid::new_v4().to_string(), records));

        let mut last_error = String::new();
        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
            let db = self.db.clone();
            let job = batch.clone();
            let result = blocking::run("accounting_flush", move || {
                let mut conn = db.open_connection()?;
                apply_batch(&mut conn, &job)
            })
            .await;

            match result {
                Ok(ApplyOutcome::Applied { details, rollups }) => {
                    tracing::info!(
                        batch_id = %batch.batch_id,
                        records = record_count,
                        details,
                        rollups,
                        attempt = attempt + 1,
                        "accounting batch flushed"
                    );
                    return FlushOutcome::Applied {
                        records: record_count,
                        attempts: attempt + 1,
                    };
                }
                Ok(ApplyOutcome::AlreadyApplied) => {
                    tracing::warn!(batch_id = %batch.batch_id, "accounting batch already applied");
                    return FlushOutcome::AlreadyApplied;
                }
                Err(err) => {
                    tracing::warn!(
                        batch_id = %batch.batch_id,
                        attempt = attempt + 1,
                        "accounting flush failed: {err}"
                    );
                    last_error = err.to_string();
                }
            }
        }

        self.metrics.flush_failed();
        self.reporter
            .report_now(
                "accounting_flush",
                format!(
                    "dropped accounting batch {} ({record_count} records) after {} attempts: {last_error}",
                    batch.batch_id,
                    self.policy.max_retries + 1
                ),
            )
            .await;
        FlushOutcome::Dropped {
            records: record_count,
        }
    }
}
