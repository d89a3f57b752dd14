//! Usage: Hand a finalized accounting record to metrics, the credit engine and the buffer.

use crate::domain::credits::{CreditEngine, REQUESTS_PER_CALL};
use crate::domain::usage::AccountingRecord;
use crate::infra::accounting::AccountingBuffer;
use crate::infra::metrics::GatewayMetrics;
use std::sync::Arc;
use tokio_util::task::TaskTracker;

pub(crate) struct RequestEndSink {
    metrics: Arc<GatewayMetrics>,
    buffer: Arc<AccountingBuffer>,
    credits: CreditEngine,
    tasks: TaskTracker,
}

impl RequestEndSink {
    pub(crate) fn new(
        metrics: Arc<GatewayMetrics>,
        buffer: Arc<AccountingBuffer>,
        credits: CreditEngine,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            metrics,
            buffer,
            credits,
            tasks,
        }
    }

    /// Relay tasks and debits share this tracker; shutdown waits on it before the last flush.
    pub(crate) fn tasks(&self) -> TaskTracker {
        self.tasks.clone()
    }

    pub(crate) fn opened(&self, user_id: u64) {
        self.metrics.request_opened(user_id);
    }

    /// Debits run on the tracker so shutdown can wait for them before the final flush.
    pub(crate) fn finish(&self, record: AccountingRecord) {
        self.metrics.record_finalized(&record);

        tracing::info!(
            request_id = %record.request_id,
            user_id = record.user_id,
            model = %record.model_name,
            endpoint = record.endpoint.as_str(),
            prompt_tokens = record.usage.prompt_tokens,
            completion_tokens = record.usage.completion_tokens,
            total_credits = record.total_credits,
            canceled = record.is_canceled(),
            error_code = record.error_code.unwrap_or_default(),
            ttft_ms = record.time_to_first_token_or_zero().as_millis() as u64,
            total_ms = record.total_time.as_millis() as u64,
            "request finalized"
        );

        if tokio::runtime::Handle::try_current().is_ok() {
            let credits = self.credits.clone();
            let user_id = record.user_id;
            let request_id = record.request_id.clone();
            let amount = record.total_credits;
            self.tasks.spawn(async move {
                if let Err(err) = credits.charge(user_id, REQUESTS_PER_CALL, amount).await {
                    tracing::error!(
                        request_id = %request_id,
                        user_id,
                        credits = amount,
                        "credit charge failed: {err}"
                    );
                }
            });
        } else {
            tracing::error!(
                user_id = record.user_id,
                credits = record.total_credits,
                "no runtime available, credit charge skipped"
            );
        }

        self.buffer.push(record);
    }
}
