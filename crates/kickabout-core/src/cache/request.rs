use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::FetchError;

// ============================================================================
// Constants
// ============================================================================

/// Fallback entry lifetime when a key matches nothing in the resource table.
const DEFAULT_TTL_SECS: i64 = 300;

/// Entry lifetime by resource-type fragment, first match wins.
/// Venue and sport catalogs barely change; match listings churn constantly.
const TTL_BY_RESOURCE: [(&str, i64); 4] = [
    ("/venues", 3600),
    ("/sports", 21_600),
    ("/users", 600),
    ("/matches", 120),
];

/// Maximum retry count for retryable failures.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds.
const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Backoff growth factor between attempts.
const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;

/// Ceiling on a single backoff delay in milliseconds.
const MAX_BACKOFF_DELAY_MS: u64 = 10_000;

/// Upper bound on a single fetch attempt.
const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 15;

// ============================================================================
// Options
// ============================================================================

/// Exponential backoff schedule: `base * multiplier^attempt`, capped.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: u32,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay_ms: MAX_BACKOFF_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let factor = u64::from(self.multiplier.saturating_pow(attempt));
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        std::time::Duration::from_millis(ms)
    }
}

/// Per-call knobs for `RequestCache::get`.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Entry lifetime override; resolved against the resource table otherwise.
    pub ttl: Option<Duration>,
    /// Skip the live-entry check and go to the network.
    pub force: bool,
    pub retry: RetryPolicy,
    pub attempt_timeout: std::time::Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            force: false,
            retry: RetryPolicy::default(),
            attempt_timeout: std::time::Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SECS),
        }
    }
}

impl FetchOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Debug, Clone)]
struct CacheEntry {
    data: Value,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_live(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Value, FetchError>>>;

/// In-flight fetch for a key; concurrent callers join it instead of
/// issuing their own.
#[derive(Clone)]
struct PendingRequest {
    future: SharedFetch,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    pending: HashMap<String, PendingRequest>,
}

/// TTL cache with request deduplication, retry and stale fallback.
///
/// Entries are stored as JSON values, so one instance fronts every
/// resource type the client reads. The internal lock is never held across
/// an await point.
#[derive(Default)]
pub struct RequestCache {
    state: Arc<Mutex<CacheState>>,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `key` through the cache, running `fetcher` at most once per
    /// key at a time.
    ///
    /// Lookup order: live cache entry (unless `options.force`), then an
    /// in-flight request for the same key, then a fresh attempt under the
    /// retry policy. When every retry fails on a transient error but an
    /// earlier entry exists for the key, that entry is served instead of
    /// the error; non-retryable rejections always surface.
    pub async fn get<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        options: FetchOptions,
    ) -> Result<T, FetchError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let future = {
            let mut state = lock(&self.state);

            if !options.force {
                if let Some(entry) = state.entries.get(key) {
                    if entry.is_live() {
                        debug!(key, created_at = %entry.created_at, "Cache hit");
                        return decode(entry.data.clone());
                    }
                }
            }

            if let Some(pending) = state.pending.get(key) {
                debug!(key, started_at = %pending.started_at, "Joining in-flight request");
                pending.future.clone()
            } else {
                let future = self.start_fetch(key.to_string(), fetcher, &options);
                state.pending.insert(
                    key.to_string(),
                    PendingRequest {
                        future: future.clone(),
                        started_at: Utc::now(),
                    },
                );
                future
            }
        };

        decode(future.await?)
    }

    fn start_fetch<T, F, Fut>(&self, key: String, fetcher: F, options: &FetchOptions) -> SharedFetch
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let ttl = resolve_ttl(&key, options.ttl);
        let retry = options.retry.clone();
        let attempt_timeout = options.attempt_timeout;

        async move {
            let result = run_attempts(&key, &fetcher, &retry, attempt_timeout).await;

            let mut state = lock(&state);
            state.pending.remove(&key);

            match result {
                Ok(value) => {
                    let now = Utc::now();
                    state.entries.insert(
                        key,
                        CacheEntry {
                            data: value.clone(),
                            created_at: now,
                            expires_at: now + ttl,
                        },
                    );
                    Ok(value)
                }
                Err(error) => {
                    // Best-effort data beats a hard failure, but only for
                    // transient errors; rejections surface to the caller.
                    match state.entries.get(&key) {
                        Some(entry) if error.is_retryable() => {
                            warn!(key = %key, error = %error, "Fetch failed, serving stale cache entry");
                            Ok(entry.data.clone())
                        }
                        _ => Err(error),
                    }
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Evict one key, used after mutations that make its cached read stale.
    pub fn invalidate(&self, key: &str) {
        let mut state = lock(&self.state);
        state.entries.remove(key);
    }

    /// Evict every key the predicate matches.
    pub fn invalidate_matching<P>(&self, predicate: P)
    where
        P: Fn(&str) -> bool,
    {
        let mut state = lock(&self.state);
        state.entries.retain(|key, _| !predicate(key));
    }

    /// Drop expired entries. Purely a memory bound; lookups check expiry
    /// themselves.
    pub fn gc(&self) {
        let now = Utc::now();
        let mut state = lock(&self.state);
        state.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn run_attempts<T, F, Fut>(
    key: &str,
    fetcher: &F,
    retry: &RetryPolicy,
    attempt_timeout: std::time::Duration,
) -> Result<Value, FetchError>
where
    T: Serialize + Send + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, FetchError>> + Send,
{
    let mut attempt = 0;
    loop {
        let outcome = match tokio::time::timeout(attempt_timeout, fetcher()).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        };

        match outcome {
            Ok(data) => {
                return serde_json::to_value(data).map_err(|e| FetchError::Parse(e.to_string()));
            }
            Err(error) if error.is_retryable() && attempt < retry.max_retries => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying fetch after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

fn resolve_ttl(key: &str, override_ttl: Option<Duration>) -> Duration {
    if let Some(ttl) = override_ttl {
        return ttl;
    }
    for (fragment, secs) in TTL_BY_RESOURCE {
        if key.contains(fragment) {
            return Duration::seconds(secs);
        }
    }
    Duration::seconds(DEFAULT_TTL_SECS)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, FetchError> {
    serde_json::from_value(value).map_err(|e| FetchError::Parse(e.to_string()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cache key for a request: `METHOD:URL:bodyFingerprint`.
///
/// The fingerprint keeps differing payloads against the same URL from
/// colliding; bodyless requests use `-`.
pub fn request_key(method: &str, url: &str, body: Option<&Value>) -> String {
    let fingerprint = match body {
        Some(body) => {
            let mut hasher = Sha256::new();
            hasher.update(body.to_string().as_bytes());
            format!("{:x}", hasher.finalize())
        }
        None => "-".to_string(),
    };
    format!("{}:{}:{}", method.to_ascii_uppercase(), url, fingerprint)
}

// ============================================================================
// Tests
// ============================================================================
