use std::future::Future;
use std::sync::Arc;

use crate::error::Error;
use crate::types::{AuthUser, ProviderSession};

/// External credential service.
///
/// [`HttpAuthProvider`](crate::provider::HttpAuthProvider) talks to a
/// GoTrue-compatible endpoint; tests and other backends implement it directly.
///
/// # Example
///
/// ```rust,ignore
/// impl AuthProvider for MyIdp {
///     async fn refresh_session(&self, refresh_token: &str) -> Result<ProviderSession, Error> {
///         let tokens = self.client.refresh(refresh_token).await?;
///         Ok(ProviderSession::new(tokens.access, tokens.refresh, tokens.expires_at))
///     }
///
///     async fn get_user(&self, access_token: &str) -> Result<AuthUser, Error> {
///         self.client.user(access_token).await
///     }
/// }
/// ```
pub trait AuthProvider: Send + Sync + 'static {
    /// Exchange a refresh token for new credentials.
    fn refresh_session(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = Result<ProviderSession, Error>> + Send;

    /// Look up the user an access token belongs to.
    fn get_user(&self, access_token: &str) -> impl Future<Output = Result<AuthUser, Error>> + Send;
}

/// Durable key-value store shared by every tab of one application.
///
/// Values are opaque strings; the session store
/// layers the JSON session records on top.
pub trait SessionStorage: Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, Error>> + Send;

    fn set(&self, key: &str, value: String) -> impl Future<Output = Result<(), Error>> + Send;

    /// Remove a key. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// All keys starting with `prefix`.
    fn keys(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>, Error>> + Send;
}

impl<T: AuthProvider> AuthProvider for Arc<T> {
    fn refresh_session(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = Result<ProviderSession, Error>> + Send {
        (**self).refresh_session(refresh_token)
    }

    fn get_user(&self, access_token: &str) -> impl Future<Output = Result<AuthUser, Error>> + Send {
        (**self).get_user(access_token)
    }
}

impl<T: SessionStorage> SessionStorage for Arc<T> {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, Error>> + Send {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: String) -> impl Future<Output = Result<(), Error>> + Send {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> impl Future<Output = Result<(), Error>> + Send {
        (**self).remove(key)
    }

    fn keys(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>, Error>> + Send {
        (**self).keys(prefix)
    }
}
