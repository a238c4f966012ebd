#![doc = include_str!("../README.md")]

pub mod broadcast;
pub mod clock;
pub mod error;
pub mod fingerprint;
#[cfg(feature = "http")]
pub mod provider;
pub mod refresh;
pub mod session;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use broadcast::{CrossTabChannel, SessionEvent, SuspicionReason, TabMessage, TabSubscription};
pub use clock::{Clock, MonotonicClock, SystemClock};
pub use error::Error;
pub use fingerprint::{EnvironmentSignals, Fingerprint, FingerprintValidator};
#[cfg(feature = "http")]
pub use provider::{HttpAuthProvider, ProviderConfig};
pub use refresh::{RefreshEvent, TokenRefresher};
pub use session::{
    AuthError, AuthErrorKind, AuthProvider, EnhancedSession, FileStorage, MemoryStorage,
    SessionConfig, SessionManager, SessionManagerBuilder, SessionStorage,
};
pub use types::{AuthUser, ProviderSession, SessionId, TabId, UserId};
