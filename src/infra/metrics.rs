//! Usage: Prometheus registry for per-request accounting metrics (`sybil_api_*`).

use crate::domain::usage::AccountingRecord;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

const REQUEST_DURATION_BUCKETS: [f64; 18] = [
    1.0, 2.5, 5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 40.0, 50.0, 75.0, 100.0, 150.0, 200.0, 350.0,
    400.0, 500.0, 600.0,
];
const TTFT_BUCKETS: [f64; 19] = [
    0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 40.0, 50.0, 75.0, 100.0, 150.0, 200.0, 350.0,
    400.0, 500.0, 600.0,
];
const TOKENS_PER_SECOND_BUCKETS: [f64; 14] = [
    1.0, 5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 35.0, 40.0, 45.0, 50.0, 60.0, 70.0, 80.0,
];

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ModelEndpointLabels {
    model: String,
    endpoint: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestCountLabels {
    model: String,
    endpoint: String,
    status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CreditLabels {
    model: String,
    endpoint: String,
    credit_type: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ErrorLabels {
    model: String,
    endpoint: String,
    user_id: String,
    from: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct UserLabels {
    user_id: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct StatusLabels {
    path: String,
    status_code: String,
}

fn request_duration_histogram() -> Histogram {
    Histogram::new(REQUEST_DURATION_BUCKETS.iter().copied())
}

fn ttft_histogram() -> Histogram {
    Histogram::new(TTFT_BUCKETS.iter().copied())
}

fn tokens_per_second_histogram() -> Histogram {
    Histogram::new(TOKENS_PER_SECOND_BUCKETS.iter().copied())
}

pub struct GatewayMetrics {
    registry: Registry,
    request_duration: Family<ModelEndpointLabels, Histogram, fn() -> Histogram>,
    time_to_first_token: Family<ModelEndpointLabels, Histogram, fn() -> Histogram>,
    tokens_per_second: Family<ModelEndpointLabels, Histogram, fn() -> Histogram>,
    prompt_tokens: Family<ModelEndpointLabels, Counter>,
    completion_tokens: Family<ModelEndpointLabels, Counter>,
    total_tokens: Family<ModelEndpointLabels, Counter>,
    credit_usage: Family<CreditLabels, Counter>,
    request_count: Family<RequestCountLabels, Counter>,
    error_count: Family<ErrorLabels, Counter>,
    inflight_requests: Family<UserLabels, Gauge>,
    canceled_requests: Family<UserLabels, Gauge>,
    status_codes: Family<StatusLabels, Counter>,
    accounting_dropped: Counter,
    flush_failures: Counter,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let request_duration =
            Family::<ModelEndpointLabels, Histogram, fn() -> Histogram>::new_with_constructor(
                request_duration_histogram,
            );
        let time_to_first_token =
            Family::<ModelEndpointLabels, Histogram, fn() -> Histogram>::new_with_constructor(
                ttft_histogram,
            );
        let tokens_per_second =
            Family::<ModelEndpointLabels, Histogram, fn() -> Histogram>::new_with_constructor(
                tokens_per_second_histogram,
            );
        let prompt_tokens = Family::<ModelEndpointLabels, Counter>::default();
        let completion_tokens = Family::<ModelEndpointLabels, Counter>::default();
        let total_tokens = Family::<ModelEndpointLabels, Counter>::default();
        let credit_usage = Family::<CreditLabels, Counter>::default();
        let request_count = Family::<RequestCountLabels, Counter>::default();
        let error_count = Family::<ErrorLabels, Counter>::default();
        let inflight_requests = Family::<UserLabels, Gauge>::default();
        let canceled_requests = Family::<UserLabels, Gauge>::default();
        let status_codes = Family::<StatusLabels, Counter>::default();
        let accounting_dropped = Counter::default();
        let flush_failures = Counter::default();

        registry.register(
            "sybil_api_request_duration_seconds",
            "Total time taken for requests in seconds",
            request_duration.clone(),
        );
        registry.register(
            "sybil_api_time_to_first_token_seconds",
            "Time to first token in seconds",
            time_to_first_token.clone(),
        );
        registry.register(
            "sybil_api_tokens_per_second",
            "Tokens per second",
            tokens_per_second.clone(),
        );
        registry.register(
            "sybil_api_prompt_tokens",
            "Total number of prompt tokens used",
            prompt_tokens.clone(),
        );
        registry.register(
            "sybil_api_completion_tokens",
            "Total number of completion tokens used",
            completion_tokens.clone(),
        );
        registry.register(
            "sybil_api_total_tokens",
            "Total number of tokens used",
            total_tokens.clone(),
        );
        registry.register(
            "sybil_api_credit_usage",
            "Total credits used",
            credit_usage.clone(),
        );
        registry.register(
            "sybil_api_request_count",
            "Total number of requests processed",
            request_count.clone(),
        );
        registry.register("sybil_api_error_count", "Error count", error_count.clone());
        registry.register(
            "sybil_api_inflight_requests",
            "Current inflight requests",
            inflight_requests.clone(),
        );
        registry.register(
            "sybil_api_canceled_requests",
            "Canceled requests",
            canceled_requests.clone(),
        );
        registry.register("sybil_api_status_code", "Status codes", status_codes.clone());
        registry.register(
            "sybil_api_accounting_dropped",
            "Accounting records evicted from a full buffer",
            accounting_dropped.clone(),
        );
        registry.register(
            "sybil_api_flush_failures",
            "Accounting batches dropped after exhausting retries",
            flush_failures.clone(),
        );

        Self {
            registry,
            request_duration,
            time_to_first_token,
            tokens_per_second,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            credit_usage,
            request_count,
            error_count,
            inflight_requests,
            canceled_requests,
            status_codes,
            accounting_dropped,
            flush_failures,
        }
    }

    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }

    pub fn request_opened(&self, user_id: u64) {
        self.inflight_requests
            .get_or_create(&UserLabels {
                user_id: user_id.to_string(),
            })
            .inc();
    }

    /// One-shot per-request metrics, emitted when the record is finalized.
    pub fn record_finalized(&self, record: &AccountingRecord) {
        let user = UserLabels {
            user_id: record.user_id.to_string(),
        };
        self.inflight_requests.get_or_create(&user).dec();

        let labels = ModelEndpointLabels {
            model: record.model_name.clone(),
            endpoint: record.endpoint.as_str().to_string(),
        };
        let total_secs = record.total_time.as_secs_f64();
        self.request_duration
            .get_or_create(&labels)
            .observe(total_secs);
        if let Some(ttft) = record.time_to_first_token {
            self.time_to_first_token
                .get_or_create(&labels)
                .observe(ttft.as_secs_f64());
        }
        if !record.is_canceled() && record.usage.completion_tokens > 0 && total_secs > 0.0 {
            self.tokens_per_second
                .get_or_create(&labels)
                .observe(record.usage.completion_tokens as f64 / total_secs);
        }

        self.prompt_tokens
            .get_or_create(&labels)
            .inc_by(record.usage.prompt_tokens);
        self.completion_tokens
            .get_or_create(&labels)
            .inc_by(record.usage.completion_tokens);
        self.total_tokens
            .get_or_create(&labels)
            .inc_by(record.usage.total_tokens);
        self.credit_usage
            .get_or_create(&CreditLabels {
                model: labels.model.clone(),
                endpoint: labels.endpoint.clone(),
                credit_type: "total".to_string(),
            })
            .inc_by(record.total_credits);

        let status = if record.is_canceled() {
            "canceled"
        } else if record.error_code.is_some() {
            "error"
        } else {
            "success"
        };
        self.request_count
            .get_or_create(&RequestCountLabels {
                model: labels.model.clone(),
                endpoint: labels.endpoint.clone(),
                status: status.to_string(),
            })
            .inc();

        if record.is_canceled() {
            self.canceled_requests.get_or_create(&user).inc();
        }
        if let Some(code) = record.error_code {
            self.error(&record.model_name, record.endpoint.as_str(), record.user_id, code);
        }
    }

    pub fn error(&self, model: &str, endpoint: &str, user_id: u64, from: &str) {
        self.error_count
            .get_or_create(&ErrorLabels {
                model: model.to_string(),
                endpoint: endpoint.to_string(),
                user_id: user_id.to_string(),
                from: from.to_string(),
            })
            .inc();
    }

    pub fn response_status(&self, path: &str, status: u16) {
        self.status_codes
            .get_or_create(&StatusLabels {
                path: path.to_string(),
                status_code: status.to_string(),
            })
            .inc();
    }

    pub fn accounting_dropped(&self, count: u64) {
        self.accounting_dropped.inc_by(count);
    }

    pub fn flush_failed(&self) {
        self.flush_failures.inc();
    }

    pub fn accounting_dropped_total(&self) -> u64 {
        self.accounting_dropped.get()
    }

    pub fn flush_failures_total(&self) -> u64 {
        self.flush_failures.get()
    }
}
