//! Session lifecycle for one application instance ("tab").
//!
//! [`SessionManager`] owns the tab's current [`EnhancedSession`]: it
//! persists it through a [`SessionStorage`], checks it against the
//! environment fingerprint, refreshes it through an [`AuthProvider`] and
//! keeps other tabs informed over a [`CrossTabChannel`](crate::broadcast::CrossTabChannel).
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use catering_session::session::{MemoryStorage, SessionConfig, SessionManager};
//!
//! let manager = SessionManager::builder(provider, MemoryStorage::new())
//!     .with_config(SessionConfig::from_env()?)
//!     .with_environment(signals)
//!     .build();
//! manager.start();
//!
//! let session = manager.establish(provider_session).await?;
//! assert!(manager.validate_session().await);
//! ```

mod config;
mod error;
mod manager;
mod storage;
mod store;
mod traits;
mod types;

pub use config::SessionConfig;
pub use error::{AuthError, AuthErrorKind};
pub use manager::{SessionManager, SessionManagerBuilder};
pub use storage::{FileStorage, MemoryStorage};
pub use traits::{AuthProvider, SessionStorage};
pub use types::EnhancedSession;
