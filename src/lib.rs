mod app;
mod domain;
mod gateway;
mod infra;
mod shared;
pub mod test_support;

pub use app::config::Config;
pub use app::logging;
pub use shared::error::{AppError, AppResult};

use app::app_state::{AppDeps, AppServices};
use domain::identity::CallerCache;
use infra::accounting::FlushPolicy;
use infra::db::Databases;
use infra::identity_cache::{MemoryCallerCache, RedisCallerCache};
use shared::constants::DEFAULT_SHUTDOWN_TIMEOUT;
use shared::time::SystemClock;
use std::sync::Arc;

/// Opens the stores, wires the services and serves until SIGTERM or Ctrl-C.
pub async fn run(config: Config) -> AppResult<()> {
    let dbs = Databases::open(&config.dsn, &config.read_dsn)?;
    let clock = SystemClock::shared();

    let redis_addr = config.redis_addr();
    let cache: Arc<dyn CallerCache> = match RedisCallerCache::connect(&redis_addr).await {
        Ok(cache) => Arc::new(cache),
        Err(err) => {
            tracing::warn!(
                addr = %redis_addr,
                "redis unavailable, using in-process caller cache: {err}"
            );
            Arc::new(MemoryCallerCache::new(clock.clone()))
        }
    };

    let http = gateway::proxy::build_http_client()?;
    let services = AppServices::build(AppDeps {
        dbs,
        cache,
        http,
        upstream_url: config.fallback_server.clone(),
        upstream_api_key: config.fallback_server_api_key.clone(),
        metrics_api_key: config.metrics_api_key.clone(),
        report_url: config.endon_url.clone(),
        flush_policy: FlushPolicy::default(),
        clock,
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .map_err(|e| {
            AppError::with_source("BIND", format!("failed to bind {}", config.listen_addr), e)
        })?;

    gateway::manager::serve(
        listener,
        services,
        app::shutdown::signal(),
        DEFAULT_SHUTDOWN_TIMEOUT,
    )
    .await
}
