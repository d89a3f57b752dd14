//! Usage: Token usage and the immutable per-request accounting record.

use super::models::EndpointKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub is_canceled: bool,
}

impl TokenUsage {
    /// `total_tokens` is always derived, never trusted from upstream.
    pub fn new(prompt_tokens: u64, completion_tokens: u64, is_canceled: bool) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            is_canceled,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountingRecord {
    pub request_id: String,
    pub user_id: u64,
    pub model_id: u64,
    pub model_name: String,
    pub endpoint: EndpointKind,
    pub created_at: DateTime<Utc>,
    /// `None` when no token ever reached the caller.
    pub time_to_first_token: Option<Duration>,
    pub total_time: Duration,
    pub usage: TokenUsage,
    pub total_credits: u64,
    pub error_code: Option<&'static str>,
    /// Carried for downstream billing only; the debit floors at zero either way.
    pub allow_overspend: bool,
}

impl AccountingRecord {
    pub fn is_canceled(&self) -> bool {
        self.usage.is_canceled
    }

    pub fn time_to_first_token_or_zero(&self) -> Duration {
        self.time_to_first_token.unwrap_or(Duration::ZERO)
    }

    /// UTC calendar day used as the rollup key.
    pub fn rollup_date(&self) -> String {
        self.created_at.format("%Y-%m-%d").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn total_is_sum_of_parts() {
        let usage = TokenUsage::new(50, 100, false);
        assert_eq!(usage.total_tokens, 150);
        let saturated = TokenUsage::new(u64::MAX, 1, false);
        assert_eq!(saturated.total_tokens, u64::MAX);
    }

    #[test]
    fn rollup_date_uses_utc_day() {
        let record = AccountingRecord {
            request_id: "r".into(),
            user_id: 1,
            model_id: 2,
            model_name: "m".into(),
            endpoint: EndpointKind::Chat,
            created_at: Utc.with_ymd_and_hms(2026, 3, 9, 23, 59, 59).unwrap(),
            time_to_first_token: None,
            total_time: Duration::from_secs(1),
            usage: TokenUsage::default(),
            total_credits: 0,
            error_code: None,
            allow_overspend: false,
        };
        assert_eq!(record.rollup_date(), "2026-03-09");
        assert_eq!(record.time_to_first_token_or_zero(), Duration::ZERO);
    }
}
