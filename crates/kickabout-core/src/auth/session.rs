//! Session orchestration: one authoritative, race-free view of "is the
//! user logged in, and as whom".
//!
//! The controller owns the login-state machine and everything that feeds
//! it: the redundant token store, the request cache in front of the
//! current-user endpoint, the cross-context storage watcher, and the
//! periodic revalidation timer. Consumers read state through a watch
//! channel and call `refresh`/`logout`; nothing in here ever surfaces an
//! error to them - every path settles on a definite state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::UserApi;
use crate::auth::token::{self, TokenStore};
use crate::cache::{FetchOptions, RequestCache};
use crate::error::FetchError;
use crate::models::SessionUser;
use crate::storage::{keys, SharedStorage, StorageEvent};

/// Default interval between silent background revalidations.
const DEFAULT_REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

/// Value stored under `session.loggingOut` while logout cleanup runs.
const LOGGING_OUT_MARKER: &str = "true";

/// Login-state phases. `Initializing` only exists until `init()` settles;
/// afterwards the session moves between the other two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Initializing,
    Authenticated,
    Unauthenticated,
}

/// Published session state.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub user: Option<SessionUser>,
}

impl SessionSnapshot {
    fn initializing() -> Self {
        Self {
            phase: SessionPhase::Initializing,
            user: None,
        }
    }

    fn unauthenticated() -> Self {
        Self {
            phase: SessionPhase::Unauthenticated,
            user: None,
        }
    }

    fn authenticated(user: SessionUser) -> Self {
        Self {
            phase: SessionPhase::Authenticated,
            user: Some(user),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == SessionPhase::Authenticated
    }
}

/// Tuning knobs for the controller.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub refresh_interval: std::time::Duration,
    /// Template for current-user fetches; `force` is set per call.
    pub fetch: FetchOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            fetch: FetchOptions::default(),
        }
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Option<SessionUser>>>;

/// Orchestrates login-state transitions for one client context.
pub struct SessionController {
    inner: Arc<SessionInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    watchers_started: AtomicBool,
}

struct SessionInner {
    storage: SharedStorage,
    tokens: TokenStore,
    cache: Arc<RequestCache>,
    api: Arc<dyn UserApi>,
    state: watch::Sender<SessionSnapshot>,
    /// Single-slot reentrancy guard: concurrent refreshes join this future.
    refresh_slot: Mutex<Option<SharedRefresh>>,
    logging_out: AtomicBool,
    mounted: AtomicBool,
    /// Bumped by logout; completions captured under an older epoch may not
    /// write state.
    epoch: AtomicU64,
    options: SessionOptions,
}

impl SessionController {
    pub fn new(storage: SharedStorage, cache: Arc<RequestCache>, api: Arc<dyn UserApi>) -> Self {
        Self::with_options(storage, cache, api, SessionOptions::default())
    }

    pub fn with_options(
        storage: SharedStorage,
        cache: Arc<RequestCache>,
        api: Arc<dyn UserApi>,
        options: SessionOptions,
    ) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::initializing());
        let tokens = TokenStore::new(storage.clone());

        Self {
            inner: Arc::new(SessionInner {
                storage,
                tokens,
                cache,
                api,
                state,
                refresh_slot: Mutex::new(None),
                logging_out: AtomicBool::new(false),
                mounted: AtomicBool::new(true),
                epoch: AtomicU64::new(0),
                options,
            }),
            tasks: Mutex::new(Vec::new()),
            watchers_started: AtomicBool::new(false),
        }
    }

    /// Resolve the stored session once, on startup.
    ///
    /// With a token and a cached profile snapshot the controller settles
    /// `Authenticated` immediately and revalidates behind the scenes, so
    /// consumers never wait on the network for a returning user.
    pub async fn init(&self) -> SessionSnapshot {
        let inner = &self.inner;

        // A marker left behind by an interrupted logout: finish that
        // logout instead of resurrecting the session.
        if inner.storage.get(keys::LOGGING_OUT).is_some() {
            info!("Found interrupted logout, settling unauthenticated");
            if let Err(e) = inner.storage.remove(keys::LOGGING_OUT) {
                warn!(error = %e, "Failed to clear logout marker");
            }
            inner.set_state(SessionSnapshot::unauthenticated());
            self.spawn_watchers();
            return self.snapshot();
        }

        let Some(token) = inner.tokens.read() else {
            debug!("No stored token, settling unauthenticated");
            inner.set_state(SessionSnapshot::unauthenticated());
            self.spawn_watchers();
            return self.snapshot();
        };

        let cached_user = inner
            .storage
            .get(keys::USER_SNAPSHOT)
            .and_then(|raw| SessionUser::from_json(&raw));

        if let Some(user) = cached_user {
            // Unblock consumers with the cached profile and revalidate
            // behind it; a failed revalidation keeps the snapshot.
            inner.set_state(SessionSnapshot::authenticated(user));
            let background = Arc::clone(inner);
            self.push_task(tokio::spawn(async move {
                SessionInner::run_refresh(background).await;
            }));
            self.spawn_watchers();
            return self.snapshot();
        }

        // Token but no snapshot: the profile has to come from the network
        // before anything can render.
        match inner.fetch_user(&token, false).await {
            Ok(user) => {
                inner.persist_snapshot(&user);
                inner.set_state(SessionSnapshot::authenticated(user));
            }
            Err(e) => {
                warn!(error = %e, "Initial profile fetch failed, clearing session");
                inner.clear_session(inner.current_epoch());
            }
        }
        self.spawn_watchers();
        self.snapshot()
    }

    /// Revalidate the session against the server.
    ///
    /// Reentrant callers join the in-flight result. Resolves to the
    /// current user or `None`, never an error.
    pub async fn refresh(&self) -> Option<SessionUser> {
        SessionInner::run_refresh(Arc::clone(&self.inner)).await
    }

    /// Drop the session. State flips synchronously before any cleanup so
    /// racing `init`/`refresh` completions observe the logout and abort.
    pub fn logout(&self) {
        let inner = &self.inner;

        inner.epoch.fetch_add(1, Ordering::SeqCst);
        inner.logging_out.store(true, Ordering::SeqCst);
        inner.set_state(SessionSnapshot::unauthenticated());
        info!("Logging out");

        if let Err(e) = inner.storage.set(keys::LOGGING_OUT, LOGGING_OUT_MARKER) {
            warn!(error = %e, "Failed to write logout marker");
        }
        inner.tokens.clear();
        if let Err(e) = inner.storage.remove(keys::USER_SNAPSHOT) {
            warn!(error = %e, "Failed to remove user snapshot");
        }
        inner.cache.invalidate(&inner.api.cache_key());
        if let Err(e) = inner.storage.remove(keys::LOGGING_OUT) {
            warn!(error = %e, "Failed to clear logout marker");
        }
        inner.logging_out.store(false, Ordering::SeqCst);
    }

    /// Current published state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.borrow().clone()
    }

    /// Watch state transitions. The receiver always holds the latest
    /// snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.state.subscribe()
    }

    /// Tear the controller down. Pending async completions become no-ops.
    pub fn shutdown(&self) {
        self.inner.mounted.store(false, Ordering::SeqCst);
        let mut tasks = lock(&self.tasks);
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    fn spawn_watchers(&self) {
        if self.watchers_started.swap(true, Ordering::SeqCst) {
            return;
        }

        // Subscribe before the task runs so no event published after
        // init() can slip past the watcher.
        let events = self.inner.storage.subscribe();
        let watcher = Arc::clone(&self.inner);
        self.push_task(tokio::spawn(async move {
            SessionInner::watch_storage(watcher, events).await;
        }));

        let timer = Arc::clone(&self.inner);
        self.push_task(tokio::spawn(async move {
            SessionInner::run_revalidation_timer(timer).await;
        }));
    }

    fn push_task(&self, handle: JoinHandle<()>) {
        lock(&self.tasks).push(handle);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SessionInner {
    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    fn set_state(&self, snapshot: SessionSnapshot) {
        if !self.is_mounted() {
            return;
        }
        self.state.send_replace(snapshot);
    }

    /// State write for async completions: dropped when the controller was
    /// torn down or a logout superseded the operation that produced it.
    fn set_state_if_current(&self, snapshot: SessionSnapshot, epoch: u64) -> bool {
        if !self.is_mounted() || self.current_epoch() != epoch {
            debug!("Dropping superseded state write");
            return false;
        }
        self.state.send_replace(snapshot);
        true
    }

    async fn fetch_user(&self, bearer: &str, force: bool) -> Result<SessionUser, FetchError> {
        let key = self.api.cache_key();
        let api = Arc::clone(&self.api);
        let bearer = bearer.to_string();
        let mut options = self.options.fetch.clone();
        options.force = force;

        self.cache
            .get(
                &key,
                move || {
                    let api = Arc::clone(&api);
                    let bearer = bearer.clone();
                    async move { api.fetch_current_user(&bearer).await }
                },
                options,
            )
            .await
    }

    fn persist_snapshot(&self, user: &SessionUser) {
        match serde_json::to_string(user) {
            Ok(raw) => {
                if let Err(e) = self.storage.set(keys::USER_SNAPSHOT, &raw) {
                    warn!(error = %e, "Failed to persist user snapshot");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize user snapshot"),
        }
    }

    fn clear_session(&self, epoch: u64) {
        self.tokens.clear();
        if let Err(e) = self.storage.remove(keys::USER_SNAPSHOT) {
            warn!(error = %e, "Failed to remove user snapshot");
        }
        self.cache.invalidate(&self.api.cache_key());
        self.set_state_if_current(SessionSnapshot::unauthenticated(), epoch);
    }

    async fn run_refresh(inner: Arc<Self>) -> Option<SessionUser> {
        if inner.logging_out.load(Ordering::SeqCst) || !inner.is_mounted() {
            return None;
        }
        Self::refresh_future(&inner).await
    }

    fn refresh_future(inner: &Arc<Self>) -> SharedRefresh {
        let mut slot = lock(&inner.refresh_slot);
        if let Some(pending) = slot.as_ref() {
            debug!("Joining in-flight session refresh");
            return pending.clone();
        }

        let task = Arc::clone(inner);
        let future = async move {
            let result = task.do_refresh().await;
            *lock(&task.refresh_slot) = None;
            result
        }
        .boxed()
        .shared();

        *slot = Some(future.clone());
        future
    }

    async fn do_refresh(&self) -> Option<SessionUser> {
        let epoch = self.current_epoch();

        let Some(bearer) = self.tokens.read() else {
            // Nothing valid left in any location: scrub the expired copies
            // and drop the session.
            self.clear_session(epoch);
            return None;
        };

        match self.fetch_user(&bearer, true).await {
            Ok(user) => {
                if !self.set_state_if_current(SessionSnapshot::authenticated(user.clone()), epoch) {
                    return None;
                }
                self.persist_snapshot(&user);
                Some(user)
            }
            Err(FetchError::AuthExpired) | Err(FetchError::Client { .. }) => {
                info!("Server rejected the session, clearing");
                self.clear_session(epoch);
                None
            }
            Err(error) => {
                warn!(error = %error, "Session refresh failed");
                if self.tokens.read().is_some() {
                    // Transient failure with a live token: keep whatever
                    // profile we were already showing.
                    let user = self.state.borrow().user.clone();
                    user
                } else {
                    self.clear_session(epoch);
                    None
                }
            }
        }
    }

    async fn watch_storage(inner: Arc<Self>, mut events: broadcast::Receiver<StorageEvent>) {
        let own_origin = inner.storage.origin();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Storage event listener lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if !inner.is_mounted() {
                break;
            }
            if event.origin == own_origin {
                continue;
            }
            inner.apply_remote_event(&event);
        }
    }

    /// Mirror a mutation another context made to the shared store.
    fn apply_remote_event(&self, event: &StorageEvent) {
        match event.key.as_str() {
            keys::TOKEN_PRIMARY => {
                let gone = match event.new_value.as_deref() {
                    Some(value) => !token::is_valid(value),
                    None => true,
                };
                if gone {
                    info!("Token removed in another context, mirroring logout");
                    self.mirror_logout();
                }
            }
            keys::LOGGING_OUT if event.new_value.is_some() => {
                info!("Logout signalled from another context");
                self.mirror_logout();
            }
            keys::USER_SNAPSHOT => {
                let Some(user) = event
                    .new_value
                    .as_deref()
                    .and_then(SessionUser::from_json)
                else {
                    return;
                };
                // Last writer wins across contexts, whole-snapshot replace.
                if self.tokens.read().is_some() {
                    debug!("Mirroring user snapshot from another context");
                    self.set_state(SessionSnapshot::authenticated(user));
                }
            }
            _ => {}
        }
    }

    /// Local-state half of a logout another context performed; the other
    /// context owns the storage cleanup.
    fn mirror_logout(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cache.invalidate(&self.api.cache_key());
        self.set_state(SessionSnapshot::unauthenticated());
    }

    async fn run_revalidation_timer(inner: Arc<Self>) {
        let mut ticker = tokio::time::interval(inner.options.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; init already revalidated.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if !inner.is_mounted() {
                break;
            }
            if inner.logging_out.load(Ordering::SeqCst) {
                continue;
            }
            if inner.state.borrow().phase != SessionPhase::Authenticated {
                continue;
            }

            let report = inner.tokens.verify_consistency();
            if report.repaired {
                info!("Repaired divergent token copies");
            }

            debug!("Periodic session revalidation");
            Self::run_refresh(Arc::clone(&inner)).await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;

    use crate::auth::token::token_with_ttl;
    use crate::cache::RetryPolicy;

    /// Opt-in log output for debugging: `RUST_LOG=debug cargo test`.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    struct ScriptedApi {
        calls: AtomicUsize,
        delay: Option<StdDuration>,
        responses: Mutex<VecDeque<Result<SessionUser, FetchError>>>,
    }

    impl ScriptedApi {
        fn new(responses: Vec<Result<SessionUser, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: None,
                responses: Mutex::new(responses.into()),
            })
        }

        fn with_delay(
            responses: Vec<Result<SessionUser, FetchError>>,
            delay: StdDuration,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Some(delay),
                responses: Mutex::new(responses.into()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UserApi for ScriptedApi {
        async fn fetch_current_user(&self, _token: &str) -> Result<SessionUser, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            lock(&self.responses)
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Network("script exhausted".into())))
        }

        fn cache_key(&self) -> String {
            "GET:test://users/me:-".to_string()
        }
    }

    fn player(name: &str) -> SessionUser {
        SessionUser {
            user_id: 1,
            display_name: name.to_string(),
            email: None,
            avatar_url: None,
            home_city: None,
            sports: vec!["football".to_string()],
        }
    }

    fn fast_options() -> SessionOptions {
        SessionOptions {
            refresh_interval: StdDuration::from_secs(300),
            fetch: FetchOptions {
                retry: RetryPolicy {
                    base_delay_ms: 1,
                    max_delay_ms: 2,
                    ..RetryPolicy::default()
                },
                ..FetchOptions::default()
            },
        }
    }

    fn controller(storage: &SharedStorage, api: Arc<ScriptedApi>) -> SessionController {
        SessionController::with_options(
            storage.clone(),
            Arc::new(RequestCache::new()),
            api,
            fast_options(),
        )
    }

    fn seed_session(storage: &SharedStorage, user: &SessionUser) {
        TokenStore::new(storage.clone()).save(&token_with_ttl(600));
        storage
            .set(
                keys::USER_SNAPSHOT,
                &serde_json::to_string(user).expect("serialize"),
            )
            .expect("seed snapshot");
    }

    #[tokio::test]
    async fn test_init_without_token_settles_unauthenticated() {
        let storage = SharedStorage::in_memory();
        let api = ScriptedApi::new(vec![]);
        let session = controller(&storage, Arc::clone(&api));

        let snapshot = session.init().await;
        assert_eq!(snapshot.phase, SessionPhase::Unauthenticated);
        assert_eq!(snapshot.user, None);
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn test_init_with_expired_token_settles_unauthenticated() {
        let storage = SharedStorage::in_memory();
        TokenStore::new(storage.clone()).save(&token_with_ttl(-1));
        let api = ScriptedApi::new(vec![]);
        let session = controller(&storage, Arc::clone(&api));

        let snapshot = session.init().await;
        assert_eq!(snapshot.phase, SessionPhase::Unauthenticated);
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn test_init_with_cached_snapshot_is_optimistic() {
        init_tracing();
        let storage = SharedStorage::in_memory();
        seed_session(&storage, &player("Cached Casey"));
        let api = ScriptedApi::with_delay(
            vec![Ok(player("Fresh Farah"))],
            StdDuration::from_millis(40),
        );
        let session = controller(&storage, Arc::clone(&api));

        // Settles before the network answers.
        let snapshot = session.init().await;
        assert_eq!(snapshot.phase, SessionPhase::Authenticated);
        assert_eq!(
            snapshot.user.as_ref().map(|u| u.display_name.as_str()),
            Some("Cached Casey")
        );

        // The background revalidation replaces the snapshot.
        tokio::time::sleep(StdDuration::from_millis(150)).await;
        let snapshot = session.snapshot();
        assert_eq!(
            snapshot.user.as_ref().map(|u| u.display_name.as_str()),
            Some("Fresh Farah")
        );
        let stored = storage.get(keys::USER_SNAPSHOT).expect("snapshot");
        assert!(stored.contains("Fresh Farah"));
    }

    #[tokio::test]
    async fn test_background_revalidation_failure_keeps_snapshot() {
        let storage = SharedStorage::in_memory();
        seed_session(&storage, &player("Cached Casey"));
        let api = ScriptedApi::new(vec![]);
        let session = controller(&storage, Arc::clone(&api));

        session.init().await;
        tokio::time::sleep(StdDuration::from_millis(100)).await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.phase, SessionPhase::Authenticated);
        assert_eq!(
            snapshot.user.as_ref().map(|u| u.display_name.as_str()),
            Some("Cached Casey")
        );
    }

    #[tokio::test]
    async fn test_init_without_snapshot_fetches_before_settling() {
        let storage = SharedStorage::in_memory();
        TokenStore::new(storage.clone()).save(&token_with_ttl(600));
        let api = ScriptedApi::new(vec![Ok(player("Net Noor"))]);
        let session = controller(&storage, Arc::clone(&api));

        let snapshot = session.init().await;
        assert_eq!(snapshot.phase, SessionPhase::Authenticated);
        assert_eq!(
            snapshot.user.as_ref().map(|u| u.display_name.as_str()),
            Some("Net Noor")
        );
        assert!(storage.get(keys::USER_SNAPSHOT).is_some());
    }

    #[tokio::test]
    async fn test_init_without_snapshot_clears_session_on_failure() {
        let storage = SharedStorage::in_memory();
        TokenStore::new(storage.clone()).save(&token_with_ttl(600));
        let api = ScriptedApi::new(vec![]);
        let session = controller(&storage, Arc::clone(&api));

        let snapshot = session.init().await;
        assert_eq!(snapshot.phase, SessionPhase::Unauthenticated);
        assert_eq!(storage.get(keys::TOKEN_PRIMARY), None);
    }

    #[tokio::test]
    async fn test_init_clears_leftover_logout_marker() {
        let storage = SharedStorage::in_memory();
        seed_session(&storage, &player("Cached Casey"));
        storage
            .set(keys::LOGGING_OUT, LOGGING_OUT_MARKER)
            .expect("marker");
        let api = ScriptedApi::new(vec![]);
        let session = controller(&storage, Arc::clone(&api));

        let snapshot = session.init().await;
        assert_eq!(snapshot.phase, SessionPhase::Unauthenticated);
        assert_eq!(storage.get(keys::LOGGING_OUT), None);
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_fetch() {
        init_tracing();
        let storage = SharedStorage::in_memory();
        TokenStore::new(storage.clone()).save(&token_with_ttl(600));
        let api = ScriptedApi::with_delay(
            vec![Ok(player("First")), Ok(player("Second"))],
            StdDuration::from_millis(30),
        );
        let session = controller(&storage, Arc::clone(&api));
        session.init().await;
        assert_eq!(api.calls(), 1);

        let (a, b) = tokio::join!(session.refresh(), session.refresh());
        assert_eq!(a, b);
        assert_eq!(
            a.map(|u| u.display_name),
            Some("Second".to_string())
        );
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test]
    async fn test_logout_wins_over_inflight_refresh() {
        init_tracing();
        let storage = SharedStorage::in_memory();
        TokenStore::new(storage.clone()).save(&token_with_ttl(600));
        let api = ScriptedApi::with_delay(
            vec![Ok(player("First")), Ok(player("Late Luka"))],
            StdDuration::from_millis(80),
        );
        let session = Arc::new(controller(&storage, Arc::clone(&api)));
        session.init().await;

        let refreshing = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.refresh().await })
        };
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        session.logout();

        let refreshed = refreshing.await.expect("join");
        assert_eq!(refreshed, None);
        assert_eq!(session.snapshot().phase, SessionPhase::Unauthenticated);
        assert_eq!(storage.get(keys::USER_SNAPSHOT), None);
        assert_eq!(storage.get(keys::TOKEN_PRIMARY), None);
    }

    #[tokio::test]
    async fn test_refresh_without_token_clears_session() {
        let storage = SharedStorage::in_memory();
        let api = ScriptedApi::new(vec![]);
        let session = controller(&storage, Arc::clone(&api));
        session.init().await;

        assert_eq!(session.refresh().await, None);
        assert_eq!(session.snapshot().phase, SessionPhase::Unauthenticated);
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn test_refresh_falls_back_to_cached_user_on_network_failure() {
        let storage = SharedStorage::in_memory();
        TokenStore::new(storage.clone()).save(&token_with_ttl(600));
        let api = ScriptedApi::new(vec![Ok(player("Resilient Riley"))]);
        let session = controller(&storage, Arc::clone(&api));
        session.init().await;

        // Script exhausted: every further fetch fails with a network error,
        // but the request cache still holds the last good payload.
        let refreshed = session.refresh().await;
        assert_eq!(
            refreshed.map(|u| u.display_name),
            Some("Resilient Riley".to_string())
        );
        assert!(session.snapshot().is_authenticated());
    }

    #[tokio::test]
    async fn test_refresh_clears_session_on_auth_rejection() {
        let storage = SharedStorage::in_memory();
        TokenStore::new(storage.clone()).save(&token_with_ttl(600));
        let api = ScriptedApi::new(vec![
            Ok(player("Shortlived Sam")),
            Err(FetchError::AuthExpired),
        ]);
        let session = controller(&storage, Arc::clone(&api));
        session.init().await;
        assert!(session.snapshot().is_authenticated());

        assert_eq!(session.refresh().await, None);
        assert_eq!(session.snapshot().phase, SessionPhase::Unauthenticated);
        assert_eq!(storage.get(keys::TOKEN_PRIMARY), None);
    }

    #[tokio::test]
    async fn test_token_removal_in_other_context_mirrors_logout() {
        let storage = SharedStorage::in_memory();
        seed_session(&storage, &player("Tab One"));
        let api = ScriptedApi::new(vec![Ok(player("Tab One"))]);
        let session = controller(&storage, Arc::clone(&api));
        session.init().await;
        assert!(session.snapshot().is_authenticated());

        let other_tab = storage.new_handle();
        TokenStore::new(other_tab).clear();

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(session.snapshot().phase, SessionPhase::Unauthenticated);
    }

    #[tokio::test]
    async fn test_snapshot_update_in_other_context_is_mirrored() {
        let storage = SharedStorage::in_memory();
        seed_session(&storage, &player("Old Display Name"));
        let api = ScriptedApi::new(vec![Ok(player("Old Display Name"))]);
        let session = controller(&storage, Arc::clone(&api));
        session.init().await;
        // Let the background revalidation settle before the other tab writes.
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let other_tab = storage.new_handle();
        other_tab
            .set(
                keys::USER_SNAPSHOT,
                &serde_json::to_string(&player("Renamed Remy")).expect("serialize"),
            )
            .expect("set");

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        let snapshot = session.snapshot();
        assert_eq!(
            snapshot.user.as_ref().map(|u| u.display_name.as_str()),
            Some("Renamed Remy")
        );
    }

    #[tokio::test]
    async fn test_periodic_revalidation_runs_while_authenticated() {
        let storage = SharedStorage::in_memory();
        TokenStore::new(storage.clone()).save(&token_with_ttl(600));
        let api = ScriptedApi::new(vec![
            Ok(player("P1")),
            Ok(player("P2")),
            Ok(player("P3")),
            Ok(player("P4")),
            Ok(player("P5")),
        ]);
        let mut options = fast_options();
        options.refresh_interval = StdDuration::from_millis(25);
        let session = SessionController::with_options(
            storage.clone(),
            Arc::new(RequestCache::new()),
            Arc::clone(&api) as Arc<dyn UserApi>,
            options,
        );
        session.init().await;

        tokio::time::sleep(StdDuration::from_millis(120)).await;
        assert!(api.calls() >= 2, "expected periodic refreshes, saw {}", api.calls());

        session.shutdown();
        let after_shutdown = api.calls();
        tokio::time::sleep(StdDuration::from_millis(80)).await;
        assert_eq!(api.calls(), after_shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_makes_late_completions_inert() {
        let storage = SharedStorage::in_memory();
        TokenStore::new(storage.clone()).save(&token_with_ttl(600));
        let api = ScriptedApi::with_delay(
            vec![Ok(player("First")), Ok(player("Ghost"))],
            StdDuration::from_millis(60),
        );
        let session = Arc::new(controller(&storage, Arc::clone(&api)));
        session.init().await;

        let refreshing = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.refresh().await })
        };
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        session.shutdown();

        assert_eq!(refreshing.await.expect("join"), None);
        // State was frozen at teardown, not overwritten by the completion.
        assert_eq!(
            session.snapshot().user.map(|u| u.display_name),
            Some("First".to_string())
        );
    }
}
