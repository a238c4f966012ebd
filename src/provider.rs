use std::sync::Arc;

use serde::Deserialize;
use time::OffsetDateTime;
use url::Url;

use crate::clock::{Clock, SystemClock};
use crate::error::Error;
use crate::session::AuthProvider;
use crate::types::{AuthUser, ProviderSession, UserId};

/// Connection settings for a GoTrue-compatible auth service.
///
/// ```rust,ignore
/// use catering_session::provider::ProviderConfig;
///
/// let config = ProviderConfig::new("https://project.supabase.co".parse()?, "anon-key");
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ProviderConfig {
    pub(crate) base_url: Url,
    pub(crate) api_key: String,
}

impl ProviderConfig {
    /// Required fields are parameters; endpoints are derived from `base_url`.
    #[must_use]
    pub fn new(mut base_url: Url, api_key: impl Into<String>) -> Self {
        // `Url::join` replaces the last segment unless the path ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            api_key: api_key.into(),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `AUTH_URL`: base URL of the auth service
    /// - `AUTH_API_KEY`: project API key sent as the `apikey` header
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is missing or `AUTH_URL` is
    /// not a valid URL.
    pub fn from_env() -> Result<Self, Error> {
        let url_str = std::env::var("AUTH_URL")
            .map_err(|_| Error::Config("AUTH_URL is required".into()))?;
        let base_url: Url = url_str
            .parse()
            .map_err(|e| Error::Config(format!("AUTH_URL: {e}")))?;
        let api_key = std::env::var("AUTH_API_KEY")
            .map_err(|_| Error::Config("AUTH_API_KEY is required".into()))?;
        Ok(Self::new(base_url, api_key))
    }

    /// Base URL, always ending in `/`.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Project API key sent as the `apikey` header.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// `{base}/auth/v1/token?grant_type=refresh_token`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL cannot carry a path.
    pub fn token_url(&self) -> Result<Url, Error> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut()
            .append_pair("grant_type", "refresh_token");
        Ok(url)
    }

    /// `{base}/auth/v1/user`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL cannot carry a path.
    pub fn user_url(&self) -> Result<Url, Error> {
        self.endpoint("auth/v1/user")
    }

    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("{}: {e}", self.base_url)))
    }
}

/// Token endpoint response. GoTrue sends both `expires_in` and `expires_at`;
/// the absolute value wins when present.
#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
}

impl TokenResponse {
    /// A response without a refresh token keeps the one that was sent.
    fn into_session(
        self,
        sent_refresh_token: &str,
        now: OffsetDateTime,
    ) -> Result<ProviderSession, Error> {
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(ts), _) => OffsetDateTime::from_unix_timestamp(ts).map_err(|e| {
                Error::Provider {
                    operation: "token refresh",
                    status: None,
                    detail: format!("invalid expires_at {ts}: {e}"),
                }
            })?,
            (None, Some(secs)) => now + time::Duration::seconds(secs),
            (None, None) => {
                return Err(Error::Provider {
                    operation: "token refresh",
                    status: None,
                    detail: "response carries no expiry".into(),
                });
            }
        };
        let refresh_token = self
            .refresh_token
            .unwrap_or_else(|| sent_refresh_token.to_owned());
        Ok(ProviderSession::new(
            self.access_token,
            refresh_token,
            expires_at,
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct UserResponse {
    id: UserId,
    #[serde(default)]
    email: Option<String>,
}

impl From<UserResponse> for AuthUser {
    fn from(user: UserResponse) -> Self {
        let auth = AuthUser::new(user.id);
        match user.email {
            Some(email) if !email.is_empty() => auth.with_email(email),
            _ => auth,
        }
    }
}

/// [`AuthProvider`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAuthProvider {
    config: ProviderConfig,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl HttpAuthProvider {
    /// Create a provider with a default HTTP client and the system clock.
    #[must_use]
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Clock used to turn a relative `expires_in` into an absolute expiry.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Connection settings.
    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Checks HTTP response status; returns the response on success or an error with details.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(operation, status, "Auth provider rejected request");
        Err(Error::Provider {
            operation,
            status: Some(status),
            detail: body,
        })
    }
}

impl AuthProvider for HttpAuthProvider {
    async fn refresh_session(&self, refresh_token: &str) -> Result<ProviderSession, Error> {
        let response = self
            .http
            .post(self.config.token_url()?)
            .header("apikey", &self.config.api_key)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        let response = Self::ensure_success(response, "token refresh").await?;
        let tokens = response.json::<TokenResponse>().await?;
        tokens.into_session(refresh_token, self.clock.now())
    }

    async fn get_user(&self, access_token: &str) -> Result<AuthUser, Error> {
        let response = self
            .http
            .get(self.config.user_url()?)
            .header("apikey", &self.config.api_key)
            .bearer_auth(access_token)
            .send()
            .await?;

        let response = Self::ensure_success(response, "user lookup").await?;
        let user = response.json::<UserResponse>().await?;
        Ok(user.into())
    }
}
