//! Proactive token refresh.
//!
//! [`TokenRefresher`] decides when a session needs new credentials, retries
//! transient provider failures with exponential backoff, and keeps two
//! timers per session: a primary one firing `refresh_threshold` before
//! expiry, and a background one refreshing on a fixed period while expiry
//! is still far away.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::session::{AuthError, AuthProvider, EnhancedSession, SessionManager, SessionStorage};
use crate::types::SessionId;

/// Outcome of a refresh, as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RefreshEvent {
    Refreshed {
        session_id: SessionId,
        expires_at: OffsetDateTime,
    },
    /// Retries exhausted or a terminal failure. Callers typically clear the
    /// session and send the user back to sign-in.
    Failed(AuthError),
}

/// Shortest wait between two timer-driven refreshes.
const MIN_REARM_DELAY: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Timers {
    primary: Option<JoinHandle<()>>,
    background: Option<JoinHandle<()>>,
}

impl Timers {
    fn abort(&mut self) -> bool {
        let mut aborted = false;
        for task in [self.primary.take(), self.background.take()].into_iter().flatten() {
            task.abort();
            aborted = true;
        }
        aborted
    }
}

/// Keeps one [`SessionManager`]'s session fresh: on demand with
/// [`refresh_token_with_retry`](Self::refresh_token_with_retry), or on timers
/// armed by [`start_auto_refresh`](Self::start_auto_refresh).
pub struct TokenRefresher<P, S> {
    manager: Arc<SessionManager<P, S>>,
    events: broadcast::Sender<RefreshEvent>,
    timers: Mutex<Timers>,
}

impl<P: AuthProvider, S: SessionStorage> TokenRefresher<P, S> {
    /// Create a refresher for `manager`. No timer runs until
    /// [`start_auto_refresh`](Self::start_auto_refresh).
    #[must_use]
    pub fn new(manager: Arc<SessionManager<P, S>>) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            manager,
            events,
            timers: Mutex::new(Timers::default()),
        })
    }

    /// The manager whose session is refreshed.
    #[must_use]
    pub fn manager(&self) -> &Arc<SessionManager<P, S>> {
        &self.manager
    }

    /// Refresh outcomes, including failures of timer-driven refreshes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.events.subscribe()
    }

    /// `true` when auto refresh is enabled and `session` expires within the
    /// refresh threshold. Always `false` without a session.
    #[must_use]
    pub fn should_refresh(&self, session: Option<&EnhancedSession>) -> bool {
        self.should_refresh_at(session, self.manager.now())
    }

    fn should_refresh_at(&self, session: Option<&EnhancedSession>, now: OffsetDateTime) -> bool {
        let config = self.manager.config();
        let Some(session) = session else {
            return false;
        };
        if !config.auto_refresh() {
            return false;
        }
        // A threshold beyond `time::Duration`'s range covers any expiry.
        time::Duration::try_from(config.refresh_threshold())
            .map_or(true, |threshold| session.time_to_expiry(now) <= threshold)
    }

    /// When the primary timer for `session` fires. A threshold reaching
    /// before the representable range saturates to the Unix epoch, i.e. "now".
    #[must_use]
    pub fn next_refresh_at(&self, session: &EnhancedSession) -> OffsetDateTime {
        time::Duration::try_from(self.manager.config().refresh_threshold())
            .ok()
            .and_then(|threshold| session.expires_at.checked_sub(threshold))
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    /// Refresh through the manager, retrying retryable failures with
    /// exponential backoff up to `max_retries` times.
    ///
    /// # Errors
    ///
    /// Returns the last [`AuthError`], with [`attempts`](AuthError::attempts)
    /// set to the number of refresh attempts made. A `Failed` event is
    /// published as well.
    pub async fn refresh_token_with_retry(&self) -> Result<EnhancedSession, AuthError> {
        let config = self.manager.config();
        let mut attempt: u32 = 0;
        loop {
            match self.manager.refresh_token().await {
                Ok(session) => {
                    let _ = self.events.send(RefreshEvent::Refreshed {
                        session_id: session.session_id,
                        expires_at: session.expires_at,
                    });
                    return Ok(session);
                }
                Err(err) if err.is_retryable() && attempt < config.max_retries() => {
                    let delay = config.retry_delay(attempt);
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max_retries = config.max_retries(),
                        delay_ms = delay.as_millis() as u64,
                        kind = %err.kind(),
                        "Token refresh failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    let err = err.with_attempts(attempt + 1);
                    tracing::error!(
                        attempts = err.attempts(),
                        kind = %err.kind(),
                        error = %err,
                        "Token refresh failed"
                    );
                    let _ = self.events.send(RefreshEvent::Failed(err.clone()));
                    return Err(err);
                }
            }
        }
    }

    /// Arm the primary and background timers for `session`, replacing any
    /// running ones. Does nothing when auto refresh is disabled.
    pub fn start_auto_refresh(self: &Arc<Self>, session: &EnhancedSession) {
        if !self.manager.config().auto_refresh() {
            tracing::debug!("Auto refresh disabled");
            return;
        }

        let mut timers = self.timers.lock();
        timers.abort();
        timers.primary = Some(self.spawn_primary(session.clone()));
        if let Some(period) = self.manager.config().background_refresh_interval {
            timers.background = Some(self.spawn_background(period));
        }
        tracing::debug!(
            session_id = %session.session_id,
            refresh_at = %self.next_refresh_at(session),
            "Auto refresh armed"
        );
    }

    /// Cancel pending timers. A refresh already sent to the provider still
    /// completes.
    pub fn stop_auto_refresh(&self) {
        if self.timers.lock().abort() {
            tracing::debug!("Auto refresh stopped");
        }
    }

    /// `true` while a primary or background timer is armed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        let timers = self.timers.lock();
        timers.primary.as_ref().is_some_and(|t| !t.is_finished())
            || timers.background.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn spawn_primary(self: &Arc<Self>, session: EnhancedSession) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut session = session;
            let mut just_refreshed = false;
            loop {
                let delay = {
                    let Some(refresher) = weak.upgrade() else {
                        return;
                    };
                    let now = refresher.manager.now();
                    let wait = refresher.next_refresh_at(&session) - now;
                    let delay = Duration::try_from(wait).unwrap_or(Duration::ZERO);
                    if just_refreshed && delay.is_zero() {
                        // Fresh tokens already inside the threshold: back off to
                        // half their lifetime instead of refreshing back to back.
                        let ttl = session.time_to_expiry(now);
                        tracing::warn!(
                            session_id = %session.session_id,
                            ttl_secs = ttl.whole_seconds(),
                            "Provider issued tokens inside the refresh threshold"
                        );
                        Duration::try_from(ttl / 2)
                            .unwrap_or(Duration::ZERO)
                            .max(MIN_REARM_DELAY)
                    } else {
                        delay
                    }
                };
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let Some(refresher) = weak.upgrade() else {
                    return;
                };
                let Some(current) = refresher.manager.current_session() else {
                    tracing::debug!("No session left to refresh, primary timer done");
                    return;
                };
                // Renewed meanwhile (background timer or another tab): re-arm.
                if !refresher.should_refresh(Some(&current)) {
                    session = current;
                    just_refreshed = false;
                    continue;
                }
                match refresher.refresh_token_with_retry().await {
                    Ok(refreshed) => {
                        session = refreshed;
                        just_refreshed = true;
                    }
                    Err(_) => return,
                }
            }
        })
    }

    fn spawn_background(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(refresher) = weak.upgrade() else {
                    return;
                };
                let current = refresher.manager.current_session();
                // Imminent expiry belongs to the primary timer.
                if current.is_none() || refresher.should_refresh(current.as_ref()) {
                    continue;
                }
                if let Err(e) = refresher.refresh_token_with_retry().await {
                    tracing::warn!(kind = %e.kind(), "Background token refresh failed");
                }
            }
        })
    }
}

impl<P, S> Drop for TokenRefresher<P, S> {
    fn drop(&mut self) {
        self.timers.get_mut().abort();
    }
}
