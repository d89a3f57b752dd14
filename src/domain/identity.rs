//! Usage: API key -> caller resolution (cache first, one read-replica query on miss).

use super::caller::Caller;
use crate::shared::constants::{API_KEY_LEN, CALLER_CACHE_KEY_PREFIX, CALLER_CACHE_TTL};
use crate::shared::error::AppResult;
use crate::shared::ids::key_fingerprint;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("missing authorization header")]
    MissingHeader,
    #[error("invalid authentication format")]
    InvalidFormat,
    #[error("invalid API key length")]
    InvalidLength,
    #[error("unauthorized")]
    Unauthorized,
}

/// Parses `Authorization: Bearer <key>` without touching any store.
pub fn extract_api_key(header: Option<&str>) -> Result<&str, ResolveError> {
    let raw = header.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Err(ResolveError::MissingHeader);
    }
    let mut parts = raw.split_whitespace();
    let (Some(scheme), Some(key), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ResolveError::InvalidFormat);
    };
    if scheme != "Bearer" {
        return Err(ResolveError::InvalidFormat);
    }
    if key.len() != API_KEY_LEN {
        return Err(ResolveError::InvalidLength);
    }
    Ok(key)
}

pub(crate) fn cache_key(api_key: &str) -> String {
    format!("{CALLER_CACHE_KEY_PREFIX}{api_key}")
}

#[async_trait]
pub trait CallerCache: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> AppResult<()>;
}

#[async_trait]
pub trait CallerStore: Send + Sync {
    async fn find_by_api_key(&self, api_key: &str) -> AppResult<Option<Caller>>;
}

#[derive(Clone)]
pub struct IdentityResolver {
    cache: Arc<dyn CallerCache>,
    store: Arc<dyn CallerStore>,
}

impl IdentityResolver {
    pub fn new(cache: Arc<dyn CallerCache>, store: Arc<dyn CallerStore>) -> Self {
        Self { cache, store }
    }

    pub async fn resolve(&self, api_key: &str) -> Result<Caller, ResolveError> {
        if api_key.len() != API_KEY_LEN {
            return Err(ResolveError::InvalidLength);
        }
        let key = cache_key(api_key);

        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Caller>(&raw) {
                Ok(caller) => return Ok(caller),
                Err(err) => {
                    tracing::debug!(key = %key_fingerprint(api_key), "cached caller undecodable: {err}");
                }
            },
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(key = %key_fingerprint(api_key), "caller cache read failed: {err}");
            }
        }

        let caller = match self.store.find_by_api_key(api_key).await {
            Ok(Some(caller)) => caller,
            Ok(None) => {
                tracing::debug!(key = %key_fingerprint(api_key), "api key not found");
                return Err(ResolveError::Unauthorized);
            }
            Err(err) => {
                tracing::error!(key = %key_fingerprint(api_key), "caller lookup failed: {err}");
                return Err(ResolveError::Unauthorized);
            }
        };

        match serde_json::to_string(&caller) {
            Ok(payload) => {
                let cache = Arc::clone(&self.cache);
                let fingerprint = key_fingerprint(api_key);
                tokio::spawn(async move {
                    if let Err(err) = cache.set(&key, payload, CALLER_CACHE_TTL).await {
                        tracing::warn!(key = %fingerprint, "caller cache write failed: {err}");
                    }
                });
            }
            Err(err) => tracing::warn!("caller serialization failed: {err}"),
        }

        Ok(caller)
    }
}

#[cfg(test)]
mod tests;
