use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::config::SessionConfig;
use super::error::{AuthError, AuthErrorKind};
use super::store::SessionStore;
use super::traits::{AuthProvider, SessionStorage};
use super::types::EnhancedSession;
use crate::broadcast::{CrossTabChannel, SessionEvent, SuspicionReason, TabMessage};
use crate::clock::{Clock, SystemClock};
use crate::error::Error;
use crate::fingerprint::{EnvironmentSignals, FingerprintValidator};
use crate::types::{AuthUser, ProviderSession, SessionId, TabId};

type SharedRefresh = Shared<BoxFuture<'static, Result<EnhancedSession, AuthError>>>;

struct PendingRefresh {
    id: u64,
    future: SharedRefresh,
}

/// Owns the session of one tab.
///
/// Construct once at application start-up with [`SessionManager::builder`],
/// call [`start`](Self::start) to listen to other tabs and sweep expired
/// sessions, and [`shutdown`](Self::shutdown) (or drop) on teardown.
pub struct SessionManager<P, S> {
    provider: Arc<P>,
    store: SessionStore<S>,
    channel: CrossTabChannel,
    fingerprints: FingerprintValidator,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    tab_id: TabId,
    current: watch::Sender<Option<EnhancedSession>>,
    // Serializes read-modify-write cycles on stored records.
    write_lock: tokio::sync::Mutex<()>,
    pending_refresh: Mutex<Option<PendingRefresh>>,
    refresh_seq: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Builder for [`SessionManager`]. Provider and storage are required;
/// everything else has a default.
pub struct SessionManagerBuilder<P, S> {
    provider: P,
    storage: S,
    config: SessionConfig,
    channel: CrossTabChannel,
    signals: EnvironmentSignals,
    clock: Arc<dyn Clock>,
    tab_id: TabId,
}

impl<P: AuthProvider, S: SessionStorage> SessionManagerBuilder<P, S> {
    /// Settings (default: [`SessionConfig::default`]).
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Channel shared with the other tabs. Defaults to a private channel,
    /// i.e. no other tab.
    #[must_use]
    pub fn with_channel(mut self, channel: CrossTabChannel) -> Self {
        self.channel = channel;
        self
    }

    /// Environment the session fingerprint is computed from.
    #[must_use]
    pub fn with_environment(mut self, signals: EnvironmentSignals) -> Self {
        self.signals = signals;
        self
    }

    /// Source of "now" (default: [`SystemClock`]).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Identity on the cross-tab channel (default: random).
    #[must_use]
    pub fn with_tab_id(mut self, tab_id: TabId) -> Self {
        self.tab_id = tab_id;
        self
    }

    /// Create the manager. Background tasks wait for
    /// [`start`](SessionManager::start).
    #[must_use]
    pub fn build(self) -> Arc<SessionManager<P, S>> {
        let fingerprints =
            FingerprintValidator::new(self.signals).with_enabled(self.config.fingerprinting);
        let (current, _) = watch::channel(None);
        Arc::new(SessionManager {
            provider: Arc::new(self.provider),
            store: SessionStore::new(self.storage, self.config.storage_prefix.clone()),
            channel: self.channel,
            fingerprints,
            config: self.config,
            clock: self.clock,
            tab_id: self.tab_id,
            current,
            write_lock: tokio::sync::Mutex::new(()),
            pending_refresh: Mutex::new(None),
            refresh_seq: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

impl<P: AuthProvider, S: SessionStorage> SessionManager<P, S> {
    /// Start building a manager over `provider` and `storage`.
    #[must_use]
    pub fn builder(provider: P, storage: S) -> SessionManagerBuilder<P, S> {
        SessionManagerBuilder {
            provider,
            storage,
            config: SessionConfig::default(),
            channel: CrossTabChannel::new(),
            signals: EnvironmentSignals::default(),
            clock: Arc::new(SystemClock),
            tab_id: TabId::generate(),
        }
    }

    /// Settings this manager was built with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// This tab's identity on the cross-tab channel.
    #[must_use]
    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    /// Current time according to the configured clock.
    #[must_use]
    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// This tab's view of the current session.
    #[must_use]
    pub fn current_session(&self) -> Option<EnhancedSession> {
        self.current.borrow().clone()
    }

    /// Watch this tab's view of the current session.
    #[must_use]
    pub fn subscribe_session(&self) -> watch::Receiver<Option<EnhancedSession>> {
        self.current.subscribe()
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Spawn the cross-tab listener and the expired-session sweep.
    ///
    /// Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            tracing::debug!(tab = %self.tab_id, "Session manager already started");
            return;
        }

        if self.config.cross_tab_sync {
            tasks.push(self.spawn_listener());
        }
        if let Some(period) = self.config.cleanup_interval {
            tasks.push(self.spawn_sweep(period));
        }
        tracing::info!(tab = %self.tab_id, "Session manager started");
    }

    /// Abort background tasks. An in-flight refresh still completes.
    pub fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            task.abort();
        }
        tracing::info!(tab = %self.tab_id, "Session manager stopped");
    }

    fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        // Subscribe before returning so nothing published after `start` is missed.
        let mut subscription = self.channel.subscribe(self.tab_id.clone());
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.handle_message(message).await;
            }
        })
    }

    fn spawn_sweep(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                match manager.cleanup_expired_sessions().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "Swept expired sessions"),
                    Err(e) => tracing::warn!(error = %e, "Expired-session sweep failed"),
                }
            }
        })
    }

    // ── Session operations ─────────────────────────────────────────

    /// Build, fingerprint and persist a session from fresh provider
    /// credentials, making it the current session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] or [`Error::Serialization`] if the session
    /// cannot be persisted.
    pub async fn initialize_from_session(
        &self,
        raw: ProviderSession,
        user: AuthUser,
    ) -> Result<EnhancedSession, Error> {
        let session = EnhancedSession::new(raw, user, self.fingerprints.generate(), self.now());
        {
            let _guard = self.write_lock.lock().await;
            self.store.save_current(&session).await?;
            self.set_current(Some(session.clone()));
        }

        self.publish(updated_event(&session));
        tracing::info!(
            session_id = %session.session_id,
            user_id = %session.user_id,
            "Session established"
        );
        Ok(session)
    }

    /// Look up the user behind fresh credentials, then
    /// [`initialize_from_session`](Self::initialize_from_session).
    ///
    /// # Errors
    ///
    /// Returns the provider's error if the user lookup fails, or a storage
    /// error if the session cannot be persisted.
    pub async fn establish(&self, raw: ProviderSession) -> Result<EnhancedSession, Error> {
        let user = self.provider.get_user(&raw.access_token).await.map_err(|e| {
            tracing::error!(error = %e, "User lookup failed");
            e
        })?;
        self.initialize_from_session(raw, user).await
    }

    /// Adopt the persisted current session on start-up, if it validates.
    pub async fn restore(&self) -> Option<EnhancedSession> {
        self.require_session().await.ok()
    }

    /// Check the stored current session: present, active, unexpired and
    /// bound to this environment.
    ///
    /// A session failing any check is removed; a fingerprint mismatch is
    /// also reported to the other tabs. A valid session has its last
    /// activity bumped. Storage failures count as invalid.
    pub async fn validate_session(&self) -> bool {
        self.require_session().await.is_ok()
    }

    /// [`validate_session`](Self::validate_session), returning the session or
    /// the reason it was rejected.
    ///
    /// # Errors
    ///
    /// [`AuthErrorKind::NoSession`] when nothing readable is stored,
    /// [`AuthErrorKind::SessionExpired`] for an expired or deactivated
    /// session, [`AuthErrorKind::FingerprintMismatch`] when it was created in
    /// another environment, and a storage-derived kind if the store fails.
    pub async fn require_session(&self) -> Result<EnhancedSession, AuthError> {
        self.check_stored_session().await.inspect_err(|e| {
            let rejected = matches!(
                e.kind(),
                AuthErrorKind::NoSession
                    | AuthErrorKind::SessionExpired
                    | AuthErrorKind::FingerprintMismatch
            );
            if !rejected {
                tracing::warn!(error = %e, "Session validation failed");
            }
        })
    }

    async fn check_stored_session(&self) -> Result<EnhancedSession, AuthError> {
        let _guard = self.write_lock.lock().await;

        let Some(mut session) = self.store.load_current().await? else {
            self.set_current(None);
            return Err(AuthError::no_session());
        };
        let now = self.now();

        if !session.is_active {
            tracing::debug!(session_id = %session.session_id, "Stored session inactive");
            self.discard(&session.session_id).await?;
            return Err(AuthError::new(
                AuthErrorKind::SessionExpired,
                "session was deactivated",
            ));
        }

        if session.is_expired_at(now) {
            tracing::info!(session_id = %session.session_id, "Session expired");
            self.discard(&session.session_id).await?;
            return Err(AuthError::new(
                AuthErrorKind::SessionExpired,
                format!("session expired at {}", session.expires_at),
            ));
        }

        if !self.fingerprints.verify(&session.fingerprint) {
            tracing::warn!(
                session_id = %session.session_id,
                stored_user_agent = %session.fingerprint.user_agent,
                user_agent = %self.fingerprints.signals().user_agent,
                "Session fingerprint mismatch"
            );
            self.discard(&session.session_id).await?;
            self.publish(SessionEvent::SuspiciousActivity {
                reason: SuspicionReason::FingerprintMismatch,
                session_id: Some(session.session_id),
            });
            return Err(AuthError::new(
                AuthErrorKind::FingerprintMismatch,
                "session was created in another environment",
            ));
        }

        session.last_activity = now;
        self.store.save(&session).await?;
        self.set_current(Some(session.clone()));
        Ok(session)
    }

    /// Refresh the current session's credentials through the provider.
    ///
    /// Concurrent callers share one provider request and observe the same
    /// result. The request runs in its own task, so dropping the returned
    /// future does not cancel it. On failure the stored session is left as
    /// it was.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] classifying the provider or storage failure,
    /// or [`AuthErrorKind::NoSession`] if there is nothing to refresh.
    pub async fn refresh_token(self: &Arc<Self>) -> Result<EnhancedSession, AuthError> {
        let future = {
            let mut pending = self.pending_refresh.lock();
            match pending.as_ref() {
                Some(in_flight) => {
                    tracing::debug!(refresh = in_flight.id, "Joining in-flight token refresh");
                    in_flight.future.clone()
                }
                None => {
                    let id = self.refresh_seq.fetch_add(1, Ordering::Relaxed);
                    let manager = Arc::clone(self);
                    let task = tokio::spawn(async move {
                        // Released on completion, panic or abort alike.
                        let _pending = PendingGuard {
                            manager: Arc::clone(&manager),
                            id,
                        };
                        manager.perform_refresh().await
                    });
                    let future = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(AuthError::new(
                                AuthErrorKind::Unknown,
                                format!("refresh task failed: {e}"),
                            ))
                        })
                    }
                    .boxed()
                    .shared();
                    *pending = Some(PendingRefresh {
                        id,
                        future: future.clone(),
                    });
                    future
                }
            }
        };
        future.await
    }

    /// `true` while a provider refresh is outstanding.
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.pending_refresh.lock().is_some()
    }

    async fn perform_refresh(&self) -> Result<EnhancedSession, AuthError> {
        // Storage, not the local view: another tab may have rotated the refresh token.
        let session = self
            .store
            .load_current()
            .await
            .map_err(AuthError::from)?
            .ok_or_else(AuthError::no_session)?;

        tracing::debug!(session_id = %session.session_id, "Refreshing access token");
        let raw = self
            .provider
            .refresh_session(&session.refresh_token)
            .await
            .map_err(|e| {
                let err = AuthError::from(&e);
                tracing::warn!(
                    session_id = %session.session_id,
                    kind = %err.kind(),
                    error = %e,
                    "Token refresh request failed"
                );
                err
            })?;

        let refreshed = {
            let _guard = self.write_lock.lock().await;
            let still_current =
                self.store.current_id().await.map_err(AuthError::from)? == Some(session.session_id);
            let latest = if still_current {
                self.store
                    .load(&session.session_id)
                    .await
                    .map_err(AuthError::from)?
            } else {
                None
            };
            let Some(latest) = latest else {
                tracing::info!(
                    session_id = %session.session_id,
                    "Session cleared during refresh, discarding new tokens"
                );
                return Err(AuthError::new(
                    AuthErrorKind::NoSession,
                    "session was cleared during refresh",
                ));
            };

            let refreshed = latest.refreshed(raw, self.now());
            self.store.save(&refreshed).await.map_err(AuthError::from)?;
            self.set_current(Some(refreshed.clone()));
            refreshed
        };

        self.publish(updated_event(&refreshed));
        tracing::info!(
            session_id = %refreshed.session_id,
            expires_at = %refreshed.expires_at,
            "Access token refreshed"
        );
        Ok(refreshed)
    }

    /// Remove the current session and tell the other tabs. Clearing when
    /// there is no session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the record cannot be removed.
    pub async fn clear_session(&self) -> Result<(), Error> {
        let cleared = {
            let _guard = self.write_lock.lock().await;
            let id = match self.store.current_id().await? {
                Some(id) => Some(id),
                None => self.current_session().map(|s| s.session_id),
            };
            if let Some(id) = &id {
                self.store.remove(id).await?;
            }
            self.set_current(None);
            id
        };

        if let Some(session_id) = cleared {
            self.publish(SessionEvent::Logout {
                session_id: Some(session_id),
            });
            tracing::info!(session_id = %session_id, "Session cleared");
        }
        Ok(())
    }

    /// Remove every stored session and tell the other tabs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if a record cannot be removed.
    pub async fn clear_all_sessions(&self) -> Result<(), Error> {
        let removed = {
            let _guard = self.write_lock.lock().await;
            let removed = self.store.remove_all().await?;
            self.set_current(None);
            removed
        };
        self.publish(SessionEvent::Logout { session_id: None });
        tracing::info!(removed, "All sessions cleared");
        Ok(())
    }

    /// Stored sessions that are active and not expired.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the store cannot be listed.
    pub async fn get_active_sessions(&self) -> Result<Vec<EnhancedSession>, Error> {
        let now = self.now();
        let sessions = self.store.load_all().await?;
        Ok(sessions.into_iter().filter(|s| s.is_live_at(now)).collect())
    }

    /// Remove stored sessions that are expired or inactive. Returns how many
    /// were removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the store cannot be listed or a record
    /// cannot be removed.
    pub async fn cleanup_expired_sessions(&self) -> Result<usize, Error> {
        let _guard = self.write_lock.lock().await;
        let now = self.now();
        let mut removed = 0;
        for session in self.store.load_all().await? {
            if session.is_live_at(now) {
                continue;
            }
            self.discard(&session.session_id).await?;
            removed += 1;
        }
        Ok(removed)
    }

    // ── Cross-tab ──────────────────────────────────────────────────

    async fn handle_message(&self, message: TabMessage) {
        let local = self.current_session().map(|s| s.session_id);
        match message.event {
            SessionEvent::Logout { session_id } => {
                if local.is_some() && (session_id.is_none() || session_id == local) {
                    tracing::info!(origin = %message.origin, "Logged out by another tab");
                    self.set_current(None);
                }
            }
            SessionEvent::SessionUpdated { session_id, .. } => {
                match self.store.load_current().await {
                    Ok(Some(session)) if session.session_id == session_id && session.is_active => {
                        tracing::debug!(
                            origin = %message.origin,
                            session_id = %session_id,
                            "Session updated by another tab"
                        );
                        self.set_current(Some(session));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to reload session updated by another tab");
                    }
                }
            }
            SessionEvent::SuspiciousActivity { reason, session_id } => {
                tracing::warn!(
                    origin = %message.origin,
                    reason = ?reason,
                    "Suspicious session activity reported by another tab"
                );
                if local.is_some() && (session_id.is_none() || session_id == local) {
                    self.set_current(None);
                }
            }
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn set_current(&self, session: Option<EnhancedSession>) {
        self.current.send_replace(session);
    }

    async fn discard(&self, id: &SessionId) -> Result<(), Error> {
        self.store.remove(id).await?;
        if self.current_session().is_some_and(|s| &s.session_id == id) {
            self.set_current(None);
        }
        Ok(())
    }

    fn publish(&self, event: SessionEvent) {
        if self.config.cross_tab_sync {
            self.channel.publish(&self.tab_id, event);
        }
    }
}

impl<P, S> SessionManager<P, S> {
    fn finish_refresh(&self, id: u64) {
        let mut pending = self.pending_refresh.lock();
        if pending.as_ref().is_some_and(|p| p.id == id) {
            *pending = None;
        }
    }
}

/// Clears the pending refresh it was created for when dropped.
struct PendingGuard<P, S> {
    manager: Arc<SessionManager<P, S>>,
    id: u64,
}

impl<P, S> Drop for PendingGuard<P, S> {
    fn drop(&mut self) {
        self.manager.finish_refresh(self.id);
    }
}

impl<P, S> Drop for SessionManager<P, S> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn updated_event(session: &EnhancedSession) -> SessionEvent {
    SessionEvent::SessionUpdated {
        session_id: session.session_id,
        user_id: session.user_id.clone(),
        expires_at: session.expires_at,
    }
}
