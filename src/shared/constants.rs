//! Usage: Process-wide timing and sizing constants.

use std::time::Duration;

pub(crate) const API_KEY_LEN: usize = 32;

pub(crate) const CALLER_CACHE_TTL: Duration = Duration::from_secs(60);
pub(crate) const CALLER_CACHE_KEY_PREFIX: &str = "v4:user:apikey:";
pub(crate) const MODEL_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

pub(crate) const BUCKET_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
pub(crate) const BUCKET_RETRY_DELAY: Duration = Duration::from_secs(30);
pub(crate) const MAX_FLUSH_RETRIES: u32 = 3;
pub(crate) const ACCOUNTING_BUFFER_MAX_RECORDS: usize = 200_000;

pub(crate) const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub(crate) const UPSTREAM_MAX_IDLE_PER_HOST: usize = 10;
pub(crate) const UPSTREAM_MAX_CONNS_PER_HOST: usize = 50;
pub(crate) const UPSTREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
pub(crate) const UPSTREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub(crate) const UPSTREAM_CLIENT_TIMEOUT: Duration = Duration::from_secs(180);

pub(crate) const SSE_RETRY_MILLIS: u64 = 1500;
pub(crate) const SSE_EVENT_NAME: &str = "new_message";

pub(crate) const SERVICE_NAME: &str = "sybil-api";
