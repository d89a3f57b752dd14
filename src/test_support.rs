//! Usage: Public test helpers for integration tests (in-process gateway over a SQLite file).

use crate::app::app_state::{AppDeps, AppServices};
use crate::domain::identity::CallerCache;
use crate::infra::accounting::FlushPolicy;
use crate::infra::db::{from_sql_int, to_sql_int, Databases};
use crate::infra::identity_cache::MemoryCallerCache;
use crate::shared::error::{db_err, AppResult};
use crate::shared::time::SystemClock;
use axum::Router;
use rusqlite::params;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use crate::infra::accounting::FlushOutcome;

pub const TEST_METRICS_API_KEY: &str = "test-metrics-key";
pub const TEST_UPSTREAM_API_KEY: &str = "test-upstream-key";

#[derive(Debug, Clone)]
pub struct SeedUser<'a> {
    pub api_key: &'a str,
    pub role: &'a str,
    pub credits: u64,
    pub plan_requests: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailRow {
    pub request_id: String,
    pub user_id: u64,
    pub model_id: u64,
    pub endpoint: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_credits: u64,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyStatsRow {
    pub user_id: u64,
    pub model: String,
    pub model_id: u64,
    pub request_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_spend: u64,
    pub canceled_requests: u64,
}

/// A fully wired gateway with an in-memory caller cache and no periodic flushing.
pub struct TestGateway {
    services: AppServices,
}

impl TestGateway {
    pub fn new(db_path: &Path, upstream_url: &str) -> AppResult<Self> {
        let path = db_path.to_string_lossy().to_string();
        let dbs = Databases::open(&path, &path)?;
        let clock = SystemClock::shared();
        let cache: Arc<dyn CallerCache> = Arc::new(MemoryCallerCache::new(clock.clone()));

        let services = AppServices::build(AppDeps {
            dbs,
            cache,
            http: reqwest::Client::new(),
            upstream_url: upstream_url.to_string(),
            upstream_api_key: TEST_UPSTREAM_API_KEY.to_string(),
            metrics_api_key: TEST_METRICS_API_KEY.to_string(),
            report_url: None,
            flush_policy: FlushPolicy {
                interval: Duration::from_secs(3600),
                retry_delay: Duration::from_millis(10),
                max_retries: 1,
            },
            clock,
        });
        Ok(Self { services })
    }

    #[cfg(test)]
    pub(crate) fn app_state(&self) -> crate::app::app_state::AppState {
        self.services.state.clone()
    }

    pub fn router(&self) -> Router {
        crate::gateway::routes::build_router(self.services.state.clone())
    }

    pub fn seed_user(&self, user: SeedUser<'_>) -> AppResult<u64> {
        let conn = self.services.state.dbs.write.open_connection()?;
        conn.execute(
            "INSERT INTO user(role, credits, plan_requests) VALUES (?1, ?2, ?3)",
            params![user.role, to_sql_int(user.credits), i64::from(user.plan_requests)],
        )
        .map_err(|e| db_err!("failed to seed user: {e}"))?;
        let user_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO api_key(id, user_id) VALUES (?1, ?2)",
            params![user.api_key, user_id],
        )
        .map_err(|e| db_err!("failed to seed api key: {e}"))?;
        Ok(from_sql_int(user_id))
    }

    pub fn seed_model(
        &self,
        name: &str,
        icpt: u64,
        ocpt: u64,
        crc: u64,
        endpoints: &str,
    ) -> AppResult<u64> {
        let conn = self.services.state.dbs.write.open_connection()?;
        conn.execute(
            "INSERT INTO model(name, icpt, ocpt, crc, supported_endpoints) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, to_sql_int(icpt), to_sql_int(ocpt), to_sql_int(crc), endpoints],
        )
        .map_err(|e| db_err!("failed to seed model: {e}"))?;
        Ok(from_sql_int(conn.last_insert_rowid()))
    }

    /// Waits until every relay task and credit debit spawned so far has finished.
    pub async fn wait_idle(&self) {
        let tasks = &self.services.tasks;
        tasks.close();
        tasks.wait().await;
        tasks.reopen();
    }

    pub fn buffered_records(&self) -> usize {
        self.services.buffer.len()
    }

    pub async fn flush(&self) -> FlushOutcome {
        self.services.flusher.flush_once().await
    }

    /// Cancels every in-flight request as the drain deadline would.
    pub fn cancel_in_flight(&self) {
        self.services.state.cancel.cancel();
    }

    pub async fn serve(
        &self,
        listener: tokio::net::TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
        drain_timeout: Duration,
    ) -> AppResult<()> {
        crate::gateway::manager::serve(listener, self.services.clone(), shutdown, drain_timeout)
            .await
    }

    pub fn user_balance(&self, user_id: u64) -> AppResult<(u64, u32)> {
        let conn = self.services.state.dbs.write.open_connection()?;
        conn.query_row(
            "SELECT credits, plan_requests FROM user WHERE id = ?1",
            params![to_sql_int(user_id)],
            |row| {
                let credits: i64 = row.get(0)?;
                let plan: i64 = row.get(1)?;
                Ok((from_sql_int(credits), u32::try_from(plan).unwrap_or(0)))
            },
        )
        .map_err(|e| db_err!("failed to read balance: {e}"))
    }

    pub fn detail_rows(&self) -> AppResult<Vec<DetailRow>> {
        let conn = self.services.state.dbs.write.open_connection()?;
        let mut stmt = conn
            .prepare(
                r#"
SELECT request_id, user_id, model_id, endpoint, prompt_tokens, completion_tokens, total_credits, error_code
FROM request
ORDER BY created_at, request_id
"#,
            )
            .map_err(|e| db_err!("failed to prepare detail query: {e}"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DetailRow {
                    request_id: row.get(0)?,
                    user_id: from_sql_int(row.get(1)?),
                    model_id: from_sql_int(row.get(2)?),
                    endpoint: row.get(3)?,
                    prompt_tokens: from_sql_int(row.get(4)?),
                    completion_tokens: from_sql_int(row.get(5)?),
                    total_credits: from_sql_int(row.get(6)?),
                    error_code: row.get(7)?,
                })
            })
            .map_err(|e| db_err!("failed to query details: {e}"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| db_err!("failed to read details: {e}"))?;
        Ok(rows)
    }

    pub fn daily_stats(&self) -> AppResult<Vec<DailyStatsRow>> {
        let conn = self.services.state.dbs.write.open_connection()?;
        let mut stmt = conn
            .prepare(
                r#"
SELECT user_id, model, model_id, request_count, input_tokens, output_tokens, total_spend, canceled_requests
FROM daily_stats
ORDER BY date, user_id, model_id
"#,
            )
            .map_err(|e| db_err!("failed to prepare rollup query: {e}"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DailyStatsRow {
                    user_id: from_sql_int(row.get(0)?),
                    model: row.get(1)?,
                    model_id: from_sql_int(row.get(2)?),
                    request_count: from_sql_int(row.get(3)?),
                    input_tokens: from_sql_int(row.get(4)?),
                    output_tokens: from_sql_int(row.get(5)?),
                    total_spend: from_sql_int(row.get(6)?),
                    canceled_requests: from_sql_int(row.get(7)?),
                })
            })
            .map_err(|e| db_err!("failed to query rollups: {e}"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| db_err!("failed to read rollups: {e}"))?;
        Ok(rows)
    }
}
