use super::*;
use crate::domain::caller::Role;
use crate::infra::identity_cache::MemoryCallerCache;
use crate::shared::error::AppError;
use crate::shared::time::ManualClock;
use std::sync::atomic::{AtomicUsize, Ordering};

struct CountingStore {
    callers: Vec<Caller>,
    queries: AtomicUsize,
    fail: bool,
}

impl CountingStore {
    fn with(callers: Vec<Caller>) -> Arc<Self> {
        Arc::new(Self {
            callers,
            queries: AtomicUsize::new(0),
            fail: false,
        })
    }

    fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CallerStore for CountingStore {
    async fn find_by_api_key(&self, api_key: &str) -> AppResult<Option<Caller>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AppError::new("DB_ERROR", "replica down"));
        }
        Ok(self.callers.iter().find(|c| c.api_key == api_key).cloned())
    }
}

fn caller(key: &str) -> Caller {
    Caller {
        user_id: 11,
        role: Role::User,
        credits: 1_000,
        plan_requests: 0,
        allow_overspend: false,
        api_key: key.to_string(),
    }
}

async fn wait_for_cache_fill(cache: &MemoryCallerCache) {
    for _ in 0..100 {
        if !cache.is_empty() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("cache was never populated");
}

#[test]
fn extract_api_key_boundaries() {
    let key = "k".repeat(32);
    let header = format!("Bearer {key}");
    assert_eq!(extract_api_key(Some(header.as_str())), Ok(key.as_str()));
    assert_eq!(extract_api_key(None), Err(ResolveError::MissingHeader));
    assert_eq!(extract_api_key(Some("  ")), Err(ResolveError::MissingHeader));
    assert_eq!(
        extract_api_key(Some("Token abc")),
        Err(ResolveError::InvalidFormat)
    );
    assert_eq!(extract_api_key(Some("Bearer")), Err(ResolveError::InvalidFormat));
    let short = format!("Bearer {}", "k".repeat(31));
    assert_eq!(
        extract_api_key(Some(short.as_str())),
        Err(ResolveError::InvalidLength)
    );
    let long = format!("Bearer {}", "k".repeat(33));
    assert_eq!(extract_api_key(Some(long.as_str())), Err(ResolveError::InvalidLength));
}

#[test]
fn resolve_errors_render_canonical_messages() {
    assert_eq!(
        ResolveError::MissingHeader.to_string(),
        "missing authorization header"
    );
    assert_eq!(
        ResolveError::InvalidFormat.to_string(),
        "invalid authentication format"
    );
    assert_eq!(ResolveError::InvalidLength.to_string(), "invalid API key length");
    assert_eq!(ResolveError::Unauthorized.to_string(), "unauthorized");
}

#[tokio::test]
async fn cache_ttl_bounds_db_queries() {
    let key = "x".repeat(32);
    let clock = ManualClock::new();
    let cache = Arc::new(MemoryCallerCache::new(clock.clone()));
    let store = CountingStore::with(vec![caller(&key)]);
    let resolver = IdentityResolver::new(cache.clone(), store.clone());

    let first = resolver.resolve(&key).await.expect("first");
    assert_eq!(first.user_id, 11);
    assert_eq!(store.queries(), 1);
    wait_for_cache_fill(&cache).await;

    clock.advance(Duration::from_secs(30));
    resolver.resolve(&key).await.expect("second");
    assert_eq!(store.queries(), 1);

    clock.advance(Duration::from_secs(31));
    resolver.resolve(&key).await.expect("third");
    assert_eq!(store.queries(), 2);
}

#[tokio::test]
async fn unknown_key_is_unauthorized_and_not_cached() {
    let cache = Arc::new(MemoryCallerCache::new(ManualClock::new()));
    let store = CountingStore::with(Vec::new());
    let resolver = IdentityResolver::new(cache.clone(), store.clone());

    let err = resolver.resolve(&"u".repeat(32)).await.expect_err("unknown");
    assert_eq!(err, ResolveError::Unauthorized);
    tokio::task::yield_now().await;
    assert!(cache.is_empty());
}

#[tokio::test]
async fn store_failure_is_reported_as_unauthorized() {
    let cache = Arc::new(MemoryCallerCache::new(ManualClock::new()));
    let store = Arc::new(CountingStore {
        callers: Vec::new(),
        queries: AtomicUsize::new(0),
        fail: true,
    });
    let resolver = IdentityResolver::new(cache, store);

    let err = resolver.resolve(&"f".repeat(32)).await.expect_err("down");
    assert_eq!(err, ResolveError::Unauthorized);
}

#[tokio::test]
async fn wrong_length_never_reaches_the_store() {
    let cache = Arc::new(MemoryCallerCache::new(ManualClock::new()));
    let store = CountingStore::with(Vec::new());
    let resolver = IdentityResolver::new(cache, store.clone());

    let err = resolver.resolve("short").await.expect_err("short");
    assert_eq!(err, ResolveError::InvalidLength);
    assert_eq!(store.queries(), 0);
}

#[tokio::test]
async fn undecodable_cache_entry_falls_through_to_store() {
    let key = "d".repeat(32);
    let cache = Arc::new(MemoryCallerCache::new(ManualClock::new()));
    cache
        .set(&cache_key(&key), "not json".to_string(), Duration::from_secs(60))
        .await
        .expect("seed");
    let store = CountingStore::with(vec![caller(&key)]);
    let resolver = IdentityResolver::new(cache, store.clone());

    resolver.resolve(&key).await.expect("resolve");
    assert_eq!(store.queries(), 1);
}
