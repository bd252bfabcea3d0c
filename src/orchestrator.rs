use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::events::{EventBus, SessionEvent, SessionEventKind};
use crate::gateway::AuthGateway;
use crate::store::{keys, StoreChange, TokenStore};
use crate::token::{
    expiry_from_millis, ActivitySignal, SessionPhase, SessionState, TokenData, UserProfile,
};

/// How long to wait after a foreign store change before resyncing, so a
/// burst of key writes (a login touches five keys) is read as a whole.
const RESYNC_SETTLE_MS: u64 = 100;

/// Outcome of one pass through the refresh path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshOutcome {
    /// New access token persisted.
    Refreshed,
    /// The refresh token was rejected; the session has been ended.
    Rejected,
    /// Transient failure; nothing changed, retry later.
    Unavailable,
}

/// Owner of the session state machine for one application instance.
///
/// The orchestrator reads and writes credentials through its [`TokenStore`],
/// calls out through its [`AuthGateway`], and announces committed state
/// transitions on its event bus. Instances never share memory directly;
/// multiple instances over one store converge through the store's change
/// notifications.
///
/// Explicit lifecycle: construct, [`init`](Self::init), use,
/// [`destroy`](Self::destroy). Construct one per application root and pass
/// it by reference.
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn TokenStore>,
    gateway: Arc<dyn AuthGateway>,
    config: SessionConfig,
    events: EventBus,
    state: RwLock<SessionState>,
    phase: RwLock<SessionPhase>,
    /// Last observed user interaction, epoch ms.
    last_activity_ms: AtomicI64,
    /// Bumped by `destroy()`; in-flight responses from an older generation
    /// are discarded instead of applied.
    generation: AtomicU64,
    destroyed: AtomicBool,
    started: AtomicBool,
    /// Single-flight guard: concurrent refresh triggers await the same
    /// in-progress attempt instead of issuing duplicate network calls.
    refresh_flight: AsyncMutex<Option<Shared<BoxFuture<'static, RefreshOutcome>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionOrchestrator {
    pub fn new(
        store: Arc<dyn TokenStore>,
        gateway: Arc<dyn AuthGateway>,
        config: SessionConfig,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                store,
                gateway,
                config,
                events,
                state: RwLock::new(SessionState::default()),
                phase: RwLock::new(SessionPhase::Uninitialized),
                last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
                generation: AtomicU64::new(0),
                destroyed: AtomicBool::new(false),
                started: AtomicBool::new(false),
                refresh_flight: AsyncMutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Restore session state from the store and start the background tasks
    /// (refresh check, inactivity check, store-change listener). Idempotent.
    pub async fn init(&self) {
        if self.inner.destroyed.load(Ordering::SeqCst)
            || self.inner.started.swap(true, Ordering::SeqCst)
        {
            return;
        }
        info!("initializing session orchestrator");
        self.inner.touch_activity();
        self.inner.sync_from_store().await;
        self.spawn_background_tasks();
    }

    /// Authenticate with the remote service. On success the credentials are
    /// persisted and a `login` event is emitted; on failure the error is
    /// returned and mirrored into [`SessionState::error`], and an existing
    /// authenticated session is left untouched.
    pub async fn login(&self, username: &str, password: &str) -> SessionResult<UserProfile> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return Err(SessionError::Terminated);
        }
        let gen = inner.generation.load(Ordering::SeqCst);
        inner.commit_state(|s| {
            s.is_loading = true;
            s.error = None;
        });

        let result = inner.try_login(username, password, gen).await;
        if let Err(e) = &result {
            debug!(username, error = %e, "login failed");
            let was_active = inner.phase() == SessionPhase::Authenticated;
            inner.commit_state(|s| {
                s.is_loading = false;
                s.error = Some(e.to_string());
            });
            if !was_active {
                inner.set_phase(SessionPhase::LoggedOut);
            }
        }
        result
    }

    /// End the session: best-effort server logout, clear the store, emit
    /// `logout`. Calling this twice has the same effect as calling it once.
    pub async fn logout(&self) {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.inner
            .logout_internal(SessionEventKind::Logout, "user logout")
            .await;
    }

    /// Manually trigger the refresh path, e.g. before an operation known to
    /// need a fresh token. Joins any refresh already in flight. Returns
    /// whether a fresh access token is now persisted.
    pub async fn force_refresh(&self) -> bool {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.refresh_once().await == RefreshOutcome::Refreshed
    }

    /// Report user interaction, resetting the inactivity clock.
    pub fn record_activity(&self, signal: ActivitySignal) {
        trace!(?signal, "user activity");
        self.inner.touch_activity();
    }

    /// Snapshot of the current session state.
    pub fn state(&self) -> SessionState {
        let mut state = self.inner.state.read().clone();
        state.last_activity = millis_to_datetime(self.inner.last_activity_ms.load(Ordering::SeqCst));
        state
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.phase()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.read().is_authenticated
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.inner.state.read().user.clone()
    }

    /// Subscribe to committed session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Tear down this instance: cancel all scheduled work and stop applying
    /// results of any still-outstanding network call. The store is left
    /// untouched. Terminal.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }
        *self.inner.phase.write() = SessionPhase::Destroyed;
        debug!("session orchestrator destroyed");
    }

    fn spawn_background_tasks(&self) {
        let mut tasks = self.inner.tasks.lock();

        let refresh = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh.config.refresh_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // consume the immediate first tick
            loop {
                ticker.tick().await;
                refresh.refresh_tick().await;
            }
        }));

        let inactivity = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inactivity.config.inactivity_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                inactivity.inactivity_tick().await;
            }
        }));

        // Subscribe before spawning: a broadcast receiver only sees changes
        // sent after it exists, and a foreign write may land the moment
        // init() returns.
        let changes = self.inner.store.subscribe();
        let watcher = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move {
            watcher.watch_store(changes).await;
        }));
    }
}

impl Clone for SessionOrchestrator {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Inner {
    fn phase(&self) -> SessionPhase {
        *self.phase.read()
    }

    /// Swap the phase, returning the previous one. A destroyed instance
    /// never leaves `Destroyed`.
    fn set_phase(&self, phase: SessionPhase) -> SessionPhase {
        let mut guard = self.phase.write();
        if *guard == SessionPhase::Destroyed {
            return SessionPhase::Destroyed;
        }
        std::mem::replace(&mut *guard, phase)
    }

    fn commit_state(&self, f: impl FnOnce(&mut SessionState)) {
        let mut state = self.state.write();
        f(&mut state);
    }

    /// Publish an event describing a transition that has already committed.
    fn emit(&self, kind: SessionEventKind, data: serde_json::Value) {
        self.events.publish(SessionEvent::new(kind, data));
    }

    fn touch_activity(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    fn still_active(&self, gen: u64) -> bool {
        !self.destroyed.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == gen
    }

    /// Read and validate the persisted credential record.
    ///
    /// `Ok(None)` means nothing is persisted; `Err(CorruptState)` means
    /// something is persisted but unusable, including a token pair with one
    /// half missing.
    fn read_token_data(&self) -> SessionResult<Option<TokenData>> {
        let access = non_empty(self.store.get(keys::ACCESS_TOKEN));
        let refresh = non_empty(self.store.get(keys::REFRESH_TOKEN));
        let (access, refresh) = match (access, refresh) {
            (None, None) => return Ok(None),
            (Some(a), Some(r)) => (a, r),
            _ => {
                return Err(SessionError::CorruptState(
                    "credential pair is incomplete".into(),
                ))
            }
        };

        let expires_raw = non_empty(self.store.get(keys::EXPIRES_AT)).ok_or_else(|| {
            SessionError::CorruptState("expires_at is missing".into())
        })?;
        let expires_at = expires_raw
            .parse::<i64>()
            .ok()
            .and_then(expiry_from_millis)
            .ok_or_else(|| {
                SessionError::CorruptState(format!("expires_at is not epoch ms: {expires_raw:?}"))
            })?;

        let user = match self.store.get(keys::USER) {
            Some(raw) => Some(serde_json::from_str::<UserProfile>(&raw).map_err(|e| {
                SessionError::CorruptState(format!("user profile is unparseable: {e}"))
            })?),
            None => None,
        };

        Ok(Some(TokenData {
            access_token: access,
            refresh_token: refresh,
            expires_at,
            user,
        }))
    }

    fn clear_credentials(&self) {
        for key in keys::CREDENTIAL_KEYS {
            self.store.remove(key);
        }
    }

    fn persist_user(&self, user: &UserProfile) {
        match serde_json::to_string(user) {
            Ok(raw) => self.store.set(keys::USER, &raw),
            Err(e) => warn!(error = %e, "failed to encode user profile"),
        }
    }

    fn current_expiry(&self) -> Option<DateTime<Utc>> {
        non_empty(self.store.get(keys::EXPIRES_AT))
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(expiry_from_millis)
    }

    /// Commit the Authenticated state. Returns whether this was a visible
    /// transition (previously unauthenticated, or a different user).
    fn enter_authenticated(&self, user: UserProfile) -> bool {
        let changed = {
            let mut state = self.state.write();
            let changed = !state.is_authenticated
                || state.user.as_ref().map(|u| u.id.as_str()) != Some(user.id.as_str());
            state.is_authenticated = true;
            state.user = Some(user);
            state.is_loading = false;
            state.error = None;
            changed
        };
        self.set_phase(SessionPhase::Authenticated);
        self.touch_activity();
        changed
    }

    /// Commit the LoggedOut state, returning the previous phase.
    fn enter_logged_out(&self) -> SessionPhase {
        self.commit_state(|state| {
            state.is_authenticated = false;
            state.user = None;
            state.is_loading = false;
        });
        self.set_phase(SessionPhase::LoggedOut)
    }

    /// Session-expired path: clear the store, go LoggedOut, announce it.
    fn expire_session(&self, reason: &str) {
        self.clear_credentials();
        let prev = self.enter_logged_out();
        if prev != SessionPhase::LoggedOut {
            info!(reason, "session expired");
            self.emit(
                SessionEventKind::SessionExpired,
                json!({ "reason": reason }),
            );
        }
    }

    async fn logout_internal(&self, kind: SessionEventKind, reason: &str) {
        let gen = self.generation.load(Ordering::SeqCst);
        if let Some(access) = non_empty(self.store.get(keys::ACCESS_TOKEN)) {
            // Best-effort; the local session ends regardless.
            if let Err(e) = self.gateway.logout(&access).await {
                debug!(error = %e, "server logout failed, continuing");
            }
        }
        if !self.still_active(gen) {
            debug!("discarding logout completion for a destroyed instance");
            return;
        }
        self.clear_credentials();
        let prev = self.enter_logged_out();
        if prev != SessionPhase::LoggedOut {
            info!(reason, "logged out");
            self.emit(kind, json!({ "reason": reason }));
        }
    }

    async fn try_login(
        self: &Arc<Self>,
        username: &str,
        password: &str,
        gen: u64,
    ) -> SessionResult<UserProfile> {
        let tokens = self.gateway.login(username, password).await?;
        let user = self.gateway.verify(&tokens.access_token).await?;
        if !self.still_active(gen) {
            return Err(SessionError::Terminated);
        }

        let expires_at = Utc::now() + chrono_duration(self.config.assumed_token_ttl);
        self.store.set(keys::ACCESS_TOKEN, &tokens.access_token);
        self.store.set(keys::REFRESH_TOKEN, &tokens.refresh_token);
        self.store
            .set(keys::EXPIRES_AT, &expires_at.timestamp_millis().to_string());
        self.persist_user(&user);
        self.store
            .set(keys::SESSION_ID, &uuid::Uuid::new_v4().to_string());

        info!(username, user_id = %user.id, "login succeeded");
        if self.enter_authenticated(user.clone()) {
            self.emit(SessionEventKind::Login, json!({ "user": user }));
        }
        Ok(user)
    }

    /// The initialization sequence: rebuild session state from whatever the
    /// store currently holds. Also re-run whenever another instance changes
    /// the shared credentials.
    async fn sync_from_store(self: &Arc<Self>) {
        let gen = self.generation.load(Ordering::SeqCst);
        let prior = self.set_phase(SessionPhase::Verifying);
        self.commit_state(|s| s.is_loading = true);

        let token = match self.read_token_data() {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "clearing corrupt persisted session data");
                self.clear_credentials();
                self.enter_logged_out();
                self.emit(SessionEventKind::Error, json!({ "message": e.to_string() }));
                return;
            }
        };

        let Some(token) = token else {
            debug!("no persisted credentials");
            self.enter_logged_out();
            if matches!(
                prior,
                SessionPhase::Authenticated | SessionPhase::Refreshing
            ) {
                // Another instance signed out; mirror it here.
                self.emit(
                    SessionEventKind::Logout,
                    json!({ "reason": "signed out elsewhere" }),
                );
            }
            return;
        };

        if !token.is_expired() {
            match self.gateway.verify(&token.access_token).await {
                Ok(user) => {
                    if !self.still_active(gen) {
                        return;
                    }
                    self.persist_user(&user);
                    if self.enter_authenticated(user.clone()) {
                        self.emit(SessionEventKind::Login, json!({ "user": user }));
                    }
                }
                Err(e) => {
                    if !self.still_active(gen) {
                        return;
                    }
                    // One verify failure is not the end: try a refresh first.
                    debug!(error = %e, "verify failed, attempting token refresh");
                    self.refresh_then_verify(gen).await;
                }
            }
            return;
        }

        debug!("persisted access token is expired, attempting refresh");
        self.refresh_then_verify(gen).await;
    }

    /// Refresh path used during initialization: a refresh followed by a
    /// verify for the fresh profile. Any failure ends the session.
    async fn refresh_then_verify(self: &Arc<Self>, gen: u64) {
        match self.refresh_once().await {
            RefreshOutcome::Refreshed => {
                let Some(access) = non_empty(self.store.get(keys::ACCESS_TOKEN)) else {
                    self.expire_session("credentials vanished during refresh");
                    return;
                };
                match self.gateway.verify(&access).await {
                    Ok(user) => {
                        if !self.still_active(gen) {
                            return;
                        }
                        self.persist_user(&user);
                        if self.enter_authenticated(user.clone()) {
                            self.emit(SessionEventKind::Login, json!({ "user": user }));
                        }
                    }
                    Err(e) => {
                        if !self.still_active(gen) {
                            return;
                        }
                        warn!(error = %e, "verify failed after refresh");
                        self.expire_session("verification failed after refresh");
                    }
                }
            }
            // The refresh path already ended the session.
            RefreshOutcome::Rejected => {}
            RefreshOutcome::Unavailable => {
                if self.still_active(gen) {
                    self.expire_session("token refresh unavailable");
                }
            }
        }
    }

    /// Single-flight wrapper: join the in-progress refresh attempt if there
    /// is one, otherwise start it.
    async fn refresh_once(self: &Arc<Self>) -> RefreshOutcome {
        if self.destroyed.load(Ordering::SeqCst) {
            return RefreshOutcome::Unavailable;
        }
        let shared = {
            let mut flight = self.refresh_flight.lock().await;
            if let Some(existing) = flight.as_ref() {
                debug!("joining in-flight token refresh");
                existing.clone()
            } else {
                let inner = Arc::clone(self);
                let fut = async move {
                    let outcome = Arc::clone(&inner).do_refresh().await;
                    *inner.refresh_flight.lock().await = None;
                    outcome
                }
                .boxed()
                .shared();
                *flight = Some(fut.clone());
                fut
            }
        };
        shared.await
    }

    /// One refresh network call plus the bookkeeping around it.
    async fn do_refresh(self: Arc<Self>) -> RefreshOutcome {
        let gen = self.generation.load(Ordering::SeqCst);
        let Some(refresh_token) = non_empty(self.store.get(keys::REFRESH_TOKEN)) else {
            debug!("no refresh token available");
            self.expire_session("no refresh token");
            return RefreshOutcome::Rejected;
        };

        let was_authenticated = self.phase() == SessionPhase::Authenticated;
        if was_authenticated {
            self.set_phase(SessionPhase::Refreshing);
        }

        match self.gateway.refresh(&refresh_token).await {
            Ok(tokens) => {
                if !self.still_active(gen) {
                    debug!("discarding refresh response for a destroyed instance");
                    return RefreshOutcome::Unavailable;
                }
                let mut expires_at = Utc::now() + chrono_duration(self.config.assumed_token_ttl);
                // expires_at never decreases across refreshes of one session.
                if let Some(prev) = self.current_expiry() {
                    if prev > expires_at {
                        expires_at = prev;
                    }
                }
                self.store.set(keys::ACCESS_TOKEN, &tokens.access_token);
                self.store
                    .set(keys::EXPIRES_AT, &expires_at.timestamp_millis().to_string());
                if was_authenticated {
                    self.set_phase(SessionPhase::Authenticated);
                }
                info!(expires_at = %expires_at, "access token refreshed");
                self.emit(
                    SessionEventKind::TokenRefresh,
                    json!({ "expires_at": expires_at.timestamp_millis() }),
                );
                RefreshOutcome::Refreshed
            }
            Err(e) if e.is_auth_error() => {
                if self.still_active(gen) {
                    warn!(error = %e, "refresh token rejected, ending session");
                    self.expire_session("refresh token rejected");
                }
                RefreshOutcome::Rejected
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed, will retry");
                if was_authenticated && self.still_active(gen) {
                    self.set_phase(SessionPhase::Authenticated);
                }
                RefreshOutcome::Unavailable
            }
        }
    }

    /// Periodic check: expire a dead session, proactively refresh one that
    /// is close to expiry.
    async fn refresh_tick(self: &Arc<Self>) {
        if self.phase() != SessionPhase::Authenticated {
            return;
        }
        let token = match self.read_token_data() {
            Ok(Some(token)) => token,
            Ok(None) => {
                self.expire_session("credentials missing");
                return;
            }
            Err(e) => {
                warn!(error = %e, "corrupt credentials found by refresh check");
                self.clear_credentials();
                self.expire_session("corrupt credentials");
                return;
            }
        };
        if token.is_expired() {
            self.expire_session("access token expired");
        } else if token.expires_within(chrono_duration(self.config.refresh_ahead)) {
            let _ = self.refresh_once().await;
        }
    }

    /// Periodic check: end the session after too long without interaction.
    /// A session mid-refresh is still a live session and still times out.
    async fn inactivity_tick(self: &Arc<Self>) {
        if !matches!(
            self.phase(),
            SessionPhase::Authenticated | SessionPhase::Refreshing
        ) {
            return;
        }
        let last = self.last_activity_ms.load(Ordering::SeqCst);
        let idle_ms = Utc::now().timestamp_millis() - last;
        if idle_ms >= self.config.inactivity_timeout.as_millis() as i64 {
            info!(idle_ms, "inactivity timeout reached, ending session");
            self.logout_internal(SessionEventKind::SessionExpired, "inactivity timeout")
                .await;
        }
    }

    /// Listen for credential changes made by other instances and re-run the
    /// initialization sequence to converge on them.
    async fn watch_store(self: Arc<Self>, mut rx: broadcast::Receiver<StoreChange>) {
        loop {
            match rx.recv().await {
                Ok(change) => {
                    if !change.is_credential_key() {
                        continue;
                    }
                    // A login or logout writes several keys; wait for the
                    // burst to settle, drain it, and resync once.
                    tokio::time::sleep(std::time::Duration::from_millis(RESYNC_SETTLE_MS)).await;
                    while rx.try_recv().is_ok() {}
                    debug!(key = %change.key, "credentials changed elsewhere, resyncing");
                    self.sync_from_store().await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "store change listener lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}
