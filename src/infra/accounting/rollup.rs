//! Usage: Partition drained records into detail rows and per-(date, user, model) rollups.

use crate::domain::usage::AccountingRecord;
use crate::shared::time::duration_millis_i64;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RollupKey {
    pub date: String,
    pub user_id: u64,
    pub model_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollupValue {
    pub model_name: String,
    pub request_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_spend: u64,
    pub time_to_first_token_ms: u64,
    pub total_time_ms: u64,
    pub canceled_requests: u64,
}

impl RollupValue {
    fn add(&mut self, record: &AccountingRecord) {
        if self.model_name.is_empty() {
            self.model_name = record.model_name.clone();
        }
        self.request_count += 1;
        self.input_tokens = self.input_tokens.saturating_add(record.usage.prompt_tokens);
        self.output_tokens = self
            .output_tokens
            .saturating_add(record.usage.completion_tokens);
        self.total_spend = self.total_spend.saturating_add(record.total_credits);
        if record.is_canceled() {
            self.canceled_requests += 1;
            return;
        }
        self.time_to_first_token_ms = self.time_to_first_token_ms.saturating_add(
            duration_millis_i64(record.time_to_first_token_or_zero()) as u64,
        );
        self.total_time_ms = self
            .total_time_ms
            .saturating_add(duration_millis_i64(record.total_time) as u64);
    }
}

/// One flush worth of writes. The batch id makes a replay of the same batch a no-op.
#[derive(Debug, Clone)]
pub struct FlushBatch {
    pub batch_id: String,
    pub record_count: usize,
    pub details: Vec<AccountingRecord>,
    pub rollups: BTreeMap<RollupKey, RollupValue>,
}

pub fn build_batch(batch_id: String, records: Vec<AccountingRecord>) -> FlushBatch {
    let record_count = records.len();
    let mut rollups: BTreeMap<RollupKey, RollupValue> = BTreeMap::new();
    let mut details = Vec::with_capacity(record_count);

    for record in records {
        let key = RollupKey {
            date: record.rollup_date(),
            user_id: record.user_id,
            model_id: record.model_id,
        };
        rollups.entry(key).or_default().add(&record);
        if !record.is_canceled() {
            details.push(record);
        }
    }

    FlushBatch {
        batch_id,
        record_count,
        details,
        rollups,
    }
}
