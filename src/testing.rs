//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, const_mutex};

use crate::clock::{Clock, MonotonicClock};
use crate::error::Error;
use crate::fingerprint::EnvironmentSignals;
use crate::session::{AuthProvider, MemoryStorage, SessionConfig, SessionManager};
use crate::types::{AuthUser, ProviderSession};

/// How the mock answers one refresh call.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// New tokens valid for this long.
    Tokens(Duration),
    /// Provider error with this HTTP status and body.
    Status(u16, &'static str),
    /// Provider error without a status, e.g. "Network error".
    Message(&'static str),
    /// The provider call panics.
    Panic,
}

#[derive(Debug)]
pub(crate) struct MockProvider {
    clock: MonotonicClock,
    refresh_calls: AtomicUsize,
    user_calls: AtomicUsize,
    queued: Mutex<VecDeque<Reply>>,
    default_reply: Mutex<Reply>,
    latency: Mutex<Duration>,
}

impl MockProvider {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            clock: MonotonicClock::new(),
            refresh_calls: AtomicUsize::new(0),
            user_calls: AtomicUsize::new(0),
            queued: Mutex::new(VecDeque::new()),
            default_reply: Mutex::new(Reply::Tokens(Duration::from_secs(3600))),
            latency: Mutex::new(Duration::ZERO),
        })
    }

    /// Answer every unqueued call with `reply`.
    pub(crate) fn always(&self, reply: Reply) {
        *self.default_reply.lock() = reply;
    }

    /// Answer the next call with `reply`.
    pub(crate) fn then(&self, reply: Reply) {
        self.queued.lock().push_back(reply);
    }

    pub(crate) fn with_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn user_calls(&self) -> usize {
        self.user_calls.load(Ordering::SeqCst)
    }

    /// Credentials as the provider would issue them at sign-in.
    pub(crate) fn sign_in(&self, ttl: Duration) -> ProviderSession {
        ProviderSession::new("at-0", "rt-0", self.clock.now() + ttl)
    }
}

impl AuthProvider for MockProvider {
    async fn refresh_session(&self, refresh_token: &str) -> Result<ProviderSession, Error> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let reply = self
            .queued
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_reply.lock().clone());
        match reply {
            Reply::Tokens(ttl) => {
                assert!(!refresh_token.is_empty(), "refresh token must be sent");
                Ok(ProviderSession::new(
                    format!("at-{n}"),
                    format!("rt-{n}"),
                    self.clock.now() + ttl,
                ))
            }
            Reply::Status(status, detail) => Err(Error::Provider {
                operation: "token refresh",
                status: Some(status),
                detail: detail.into(),
            }),
            Reply::Message(detail) => Err(Error::Provider {
                operation: "token refresh",
                status: None,
                detail: detail.into(),
            }),
            Reply::Panic => panic!("provider crashed"),
        }
    }

    async fn get_user(&self, _access_token: &str) -> Result<AuthUser, Error> {
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        Ok(AuthUser::new("client-1").with_email("events@example.com"))
    }
}

pub(crate) fn desktop() -> EnvironmentSignals {
    EnvironmentSignals::new("Mozilla/5.0 (Macintosh; Intel Mac OS X 14_5) Safari/605.1.15")
        .with_language("en-US")
        .with_platform("MacIntel")
        .with_timezone("America/New_York")
}

pub(crate) type TestManager = SessionManager<Arc<MockProvider>, MemoryStorage>;

/// A manager ("tab") over shared storage and channel, on a tokio-anchored clock.
pub(crate) fn tab(
    provider: &Arc<MockProvider>,
    storage: &MemoryStorage,
    channel: &crate::broadcast::CrossTabChannel,
    config: SessionConfig,
    signals: EnvironmentSignals,
) -> Arc<TestManager> {
    SessionManager::builder(Arc::clone(provider), storage.clone())
        .with_config(config)
        .with_channel(channel.clone())
        .with_environment(signals)
        .with_clock(Arc::new(MonotonicClock::new()))
        .build()
}

static ENV_LOCK: Mutex<()> = const_mutex(());

/// Run `f` with `vars` set, holding the process-wide env lock. The variables
/// are removed again afterwards.
pub(crate) fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
    let _guard = ENV_LOCK.lock();
    for (key, value) in vars {
        // SAFETY: every env access in the tests goes through ENV_LOCK.
        unsafe { std::env::set_var(key, value) };
    }
    let result = f();
    for (key, _) in vars {
        // SAFETY: as above.
        unsafe { std::env::remove_var(key) };
    }
    result
}
