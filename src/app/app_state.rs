//! Usage: Long-lived process singletons, wired once at startup and shared by every handler.

use crate::domain::credits::CreditEngine;
use crate::domain::identity::{CallerCache, IdentityResolver};
use crate::domain::models::ModelCatalog;
use crate::gateway::proxy::UpstreamClient;
use crate::gateway::streams::RequestEndSink;
use crate::infra::accounting::{AccountingBuffer, AccountingFlusher, FlushPolicy};
use crate::infra::callers::SqliteCallerStore;
use crate::infra::db::Databases;
use crate::infra::error_report::ErrorReporter;
use crate::infra::metrics::GatewayMetrics;
use crate::shared::constants::{ACCOUNTING_BUFFER_MAX_RECORDS, SERVICE_NAME};
use crate::shared::time::SharedClock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) resolver: IdentityResolver,
    pub(crate) catalog: Arc<ModelCatalog>,
    pub(crate) dbs: Databases,
    pub(crate) upstream: UpstreamClient,
    pub(crate) metrics: Arc<GatewayMetrics>,
    pub(crate) sink: Arc<RequestEndSink>,
    pub(crate) reporter: ErrorReporter,
    pub(crate) metrics_api_key: Arc<str>,
    /// Parent of every per-request token; cancelled when the drain window runs out.
    pub(crate) cancel: CancellationToken,
}

pub(crate) struct AppDeps {
    pub(crate) dbs: Databases,
    pub(crate) cache: Arc<dyn CallerCache>,
    pub(crate) http: reqwest::Client,
    pub(crate) upstream_url: String,
    pub(crate) upstream_api_key: String,
    pub(crate) metrics_api_key: String,
    pub(crate) report_url: Option<String>,
    pub(crate) flush_policy: FlushPolicy,
    pub(crate) clock: SharedClock,
}

/// State for the router plus the background pieces the server loop owns.
#[derive(Clone)]
pub(crate) struct AppServices {
    pub(crate) state: AppState,
    pub(crate) buffer: Arc<AccountingBuffer>,
    pub(crate) flusher: Arc<AccountingFlusher>,
    pub(crate) tasks: TaskTracker,
}

impl AppServices {
    pub(crate) fn build(deps: AppDeps) -> Self {
        let AppDeps {
            dbs,
            cache,
            http,
            upstream_url,
            upstream_api_key,
            metrics_api_key,
            report_url,
            flush_policy,
            clock,
        } = deps;

        let metrics = Arc::new(GatewayMetrics::new());
        let reporter = ErrorReporter::new(http.clone(), report_url, SERVICE_NAME);
        let buffer = Arc::new(AccountingBuffer::new(
            ACCOUNTING_BUFFER_MAX_RECORDS,
            metrics.clone(),
        ));
        let tasks = TaskTracker::new();

        let sink = Arc::new(RequestEndSink::new(
            metrics.clone(),
            buffer.clone(),
            CreditEngine::new(dbs.write.clone()),
            tasks.clone(),
        ));
        let flusher = Arc::new(AccountingFlusher::new(
            buffer.clone(),
            dbs.write.clone(),
            metrics.clone(),
            reporter.clone(),
            flush_policy,
        ));

        let resolver = IdentityResolver::new(
            cache,
            Arc::new(SqliteCallerStore::new(dbs.read.clone())),
        );
        let catalog = Arc::new(ModelCatalog::new(dbs.read.clone(), clock));
        let upstream = UpstreamClient::new(http, &upstream_url, &upstream_api_key);

        let state = AppState {
            resolver,
            catalog,
            dbs,
            upstream,
            metrics,
            sink,
            reporter,
            metrics_api_key: Arc::from(metrics_api_key),
            cancel: CancellationToken::new(),
        };

        Self {
            state,
            buffer,
            flusher,
            tasks,
        }
    }
}
