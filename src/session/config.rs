use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// Longest duration accepted from the environment.
const MAX_ENV_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Session coordinator settings.
///
/// All fields have defaults; override with `with_*` methods, or read them
/// from the environment with [`from_env()`](SessionConfig::from_env).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub(crate) refresh_threshold: Duration,
    pub(crate) max_retries: u32,
    pub(crate) retry_base_delay: Duration,
    pub(crate) retry_max_delay: Duration,
    pub(crate) background_refresh_interval: Option<Duration>,
    pub(crate) cleanup_interval: Option<Duration>,
    pub(crate) auto_refresh: bool,
    pub(crate) fingerprinting: bool,
    pub(crate) cross_tab_sync: bool,
    pub(crate) storage_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_threshold: Duration::from_secs(5 * 60),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            background_refresh_interval: Some(Duration::from_secs(10 * 60)),
            cleanup_interval: Some(Duration::from_secs(5 * 60)),
            auto_refresh: true,
            fingerprinting: true,
            cross_tab_sync: true,
            storage_prefix: "enhanced_session".into(),
        }
    }
}

impl SessionConfig {
    /// Same as [`SessionConfig::default`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config from environment variables. Unset variables keep their
    /// defaults.
    ///
    /// # Env vars
    /// - `SESSION_REFRESH_THRESHOLD_SECS`: refresh this long before expiry
    /// - `SESSION_MAX_RETRIES`: retries after the first refresh attempt
    /// - `SESSION_RETRY_BASE_DELAY_MS`: first backoff delay
    /// - `SESSION_BACKGROUND_REFRESH_SECS`: background refresh period, `0` disables
    /// - `SESSION_CLEANUP_INTERVAL_SECS`: expired-session sweep period, `0` disables
    /// - `SESSION_AUTO_REFRESH`, `SESSION_FINGERPRINT`, `SESSION_CROSS_TAB`: `"1"`/`"true"` or `"0"`/`"false"`
    /// - `SESSION_STORAGE_PREFIX`: storage key prefix
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is set but cannot be parsed,
    /// a duration exceeds one year, or the prefix is blank.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(threshold) =
            env_duration("SESSION_REFRESH_THRESHOLD_SECS", Duration::from_secs)?
        {
            config = config.with_refresh_threshold(threshold);
        }
        if let Some(retries) = env_parse::<u32>("SESSION_MAX_RETRIES")? {
            config = config.with_max_retries(retries);
        }
        if let Some(delay) = env_duration("SESSION_RETRY_BASE_DELAY_MS", Duration::from_millis)? {
            config = config.with_retry_base_delay(delay);
        }
        if let Some(period) =
            env_duration("SESSION_BACKGROUND_REFRESH_SECS", Duration::from_secs)?
        {
            config = config.with_background_refresh_interval((!period.is_zero()).then_some(period));
        }
        if let Some(period) = env_duration("SESSION_CLEANUP_INTERVAL_SECS", Duration::from_secs)? {
            config = config.with_cleanup_interval((!period.is_zero()).then_some(period));
        }
        if let Some(enabled) = env_flag("SESSION_AUTO_REFRESH")? {
            config = config.with_auto_refresh(enabled);
        }
        if let Some(enabled) = env_flag("SESSION_FINGERPRINT")? {
            config = config.with_fingerprinting(enabled);
        }
        if let Some(enabled) = env_flag("SESSION_CROSS_TAB")? {
            config = config.with_cross_tab_sync(enabled);
        }
        if let Ok(prefix) = std::env::var("SESSION_STORAGE_PREFIX") {
            if prefix.trim().is_empty() {
                return Err(Error::Config("SESSION_STORAGE_PREFIX must not be empty".into()));
            }
            config = config.with_storage_prefix(prefix.trim());
        }

        Ok(config)
    }

    /// Refresh once the access token has this long or less to live (default: 5 minutes).
    #[must_use]
    pub fn with_refresh_threshold(mut self, threshold: Duration) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    /// Retries after the first failed attempt, for retryable failures only (default: 3).
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// First backoff delay; doubles per retry (default: 1 second).
    #[must_use]
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Upper bound on a single backoff delay (default: 30 seconds).
    #[must_use]
    pub fn with_retry_max_delay(mut self, delay: Duration) -> Self {
        self.retry_max_delay = delay;
        self
    }

    /// Background refresh period, `None` to disable (default: 10 minutes).
    #[must_use]
    pub fn with_background_refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.background_refresh_interval = interval;
        self
    }

    /// Expired-session sweep period, `None` to disable (default: 5 minutes).
    #[must_use]
    pub fn with_cleanup_interval(mut self, interval: Option<Duration>) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Enable timer-driven refresh (default: `true`).
    #[must_use]
    pub fn with_auto_refresh(mut self, enabled: bool) -> Self {
        self.auto_refresh = enabled;
        self
    }

    /// Enable the environment fingerprint check (default: `true`).
    #[must_use]
    pub fn with_fingerprinting(mut self, enabled: bool) -> Self {
        self.fingerprinting = enabled;
        self
    }

    /// Publish to and react to other tabs (default: `true`).
    #[must_use]
    pub fn with_cross_tab_sync(mut self, enabled: bool) -> Self {
        self.cross_tab_sync = enabled;
        self
    }

    /// Storage key prefix (default: `"enhanced_session"`).
    #[must_use]
    pub fn with_storage_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.storage_prefix = prefix.into();
        self
    }

    /// Remaining lifetime at which a session is due for refresh.
    #[must_use]
    pub fn refresh_threshold(&self) -> Duration {
        self.refresh_threshold
    }

    /// Retries after the first refresh attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether timer-driven refresh is enabled.
    #[must_use]
    pub fn auto_refresh(&self) -> bool {
        self.auto_refresh
    }

    /// Storage key prefix.
    #[must_use]
    pub fn storage_prefix(&self) -> &str {
        &self.storage_prefix
    }

    /// Backoff before retry number `attempt + 1` (0-indexed), doubling from
    /// the base delay and capped at the max delay.
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}: {e}"))),
        Err(_) => Ok(None),
    }
}

fn env_duration(key: &str, unit: fn(u64) -> Duration) -> Result<Option<Duration>, Error> {
    let Some(n) = env_parse::<u64>(key)? else {
        return Ok(None);
    };
    let duration = unit(n);
    if duration > MAX_ENV_DURATION {
        return Err(Error::Config(format!("{key}: {n} exceeds one year")));
    }
    Ok(Some(duration))
}

fn env_flag(key: &str) -> Result<Option<bool>, Error> {
    match std::env::var(key).as_deref() {
        Ok("1") | Ok("true") => Ok(Some(true)),
        Ok("0") | Ok("false") => Ok(Some(false)),
        Ok(other) => Err(Error::Config(format!(
            "{key}: expected 1/true or 0/false, got '{other}'"
        ))),
        Err(_) => Ok(None),
    }
}
