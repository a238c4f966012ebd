use derive_more::Display;

use crate::error::Error;

/// Classification tag carried by every [`AuthError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[non_exhaustive]
pub enum AuthErrorKind {
    #[display("network error")]
    Network,
    #[display("timeout")]
    Timeout,
    #[display("rate limited")]
    RateLimited,
    #[display("invalid refresh token")]
    InvalidRefreshToken,
    #[display("unauthorized")]
    Unauthorized,
    #[display("fingerprint mismatch")]
    FingerprintMismatch,
    #[display("no session")]
    NoSession,
    #[display("session expired")]
    SessionExpired,
    #[display("storage failure")]
    Storage,
    #[display("unknown")]
    Unknown,
}

impl AuthErrorKind {
    /// Transient failures worth another attempt after a backoff.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::RateLimited)
    }

    /// Classifies a provider message. Terminal patterns win over transient
    /// ones; anything unrecognised is [`Unknown`](Self::Unknown), which is
    /// not retried.
    #[must_use]
    pub fn classify(message: &str) -> Self {
        let message = message.to_ascii_lowercase();
        let has = |patterns: &[&str]| patterns.iter().any(|p| message.contains(p));

        if has(&[
            "invalid refresh token",
            "refresh token not found",
            "refresh token expired",
            "invalid_grant",
        ]) {
            Self::InvalidRefreshToken
        } else if has(&["unauthorized", "forbidden", "not authenticated"]) {
            Self::Unauthorized
        } else if has(&["rate limit", "too many requests"]) {
            Self::RateLimited
        } else if has(&["timeout", "timed out"]) {
            Self::Timeout
        } else if has(&["network", "fetch", "connection", "unreachable"]) {
            Self::Network
        } else {
            Self::Unknown
        }
    }

    fn from_status(status: u16) -> Option<Self> {
        match status {
            429 => Some(Self::RateLimited),
            401 | 403 => Some(Self::Unauthorized),
            408 | 504 => Some(Self::Timeout),
            500..=599 => Some(Self::Network),
            _ => None,
        }
    }
}

/// Authentication failure surfaced to callers of the session API.
///
/// Cloneable so that every caller coalesced onto one refresh observes the
/// same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Authentication failed ({kind}): {message}")]
pub struct AuthError {
    kind: AuthErrorKind,
    message: String,
    attempts: u32,
}

impl AuthError {
    #[must_use]
    pub fn new(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts: 1,
        }
    }

    #[must_use]
    pub fn no_session() -> Self {
        Self::new(AuthErrorKind::NoSession, "no active session")
    }

    #[must_use]
    pub fn kind(&self) -> AuthErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Provider calls made before giving up.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    #[must_use]
    pub(crate) fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

impl From<&Error> for AuthError {
    fn from(e: &Error) -> Self {
        let kind = match e {
            Error::Auth(inner) => return inner.clone(),
            Error::Provider { status, detail, .. } => status
                .and_then(AuthErrorKind::from_status)
                .unwrap_or_else(|| AuthErrorKind::classify(detail)),
            #[cfg(feature = "http")]
            Error::Http(http) => {
                if http.is_timeout() {
                    AuthErrorKind::Timeout
                } else if http.is_connect() || http.is_request() {
                    AuthErrorKind::Network
                } else {
                    http.status()
                        .and_then(|s| AuthErrorKind::from_status(s.as_u16()))
                        .unwrap_or_else(|| AuthErrorKind::classify(&http.to_string()))
                }
            }
            Error::Storage(_) => AuthErrorKind::Storage,
            other => AuthErrorKind::classify(&other.to_string()),
        };
        Self::new(kind, e.to_string())
    }
}

impl From<Error> for AuthError {
    fn from(e: Error) -> Self {
        Self::from(&e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_error(status: Option<u16>, detail: &str) -> Error {
        Error::Provider {
            operation: "token refresh",
            status,
            detail: detail.into(),
        }
    }

    #[test]
    fn transient_messages_are_retryable() {
        for message in ["Network error", "Request timeout", "Rate limit exceeded"] {
            assert!(
                AuthErrorKind::classify(message).is_retryable(),
                "{message} should be retryable"
            );
        }
    }

    #[test]
    fn terminal_messages_are_not_retryable() {
        assert_eq!(
            AuthErrorKind::classify("Invalid Refresh Token: Refresh Token Not Found"),
            AuthErrorKind::InvalidRefreshToken
        );
        assert_eq!(
            AuthErrorKind::classify("Unauthorized"),
            AuthErrorKind::Unauthorized
        );
        assert!(!AuthErrorKind::classify("Invalid refresh token").is_retryable());
    }

    #[test]
    fn terminal_pattern_wins_over_transient_one() {
        // Mentions both; the token is dead no matter how often we retry.
        assert_eq!(
            AuthErrorKind::classify("network proxy says: invalid refresh token"),
            AuthErrorKind::InvalidRefreshToken
        );
    }

    #[test]
    fn unknown_messages_are_not_retried() {
        let kind = AuthErrorKind::classify("something odd happened");
        assert_eq!(kind, AuthErrorKind::Unknown);
        assert!(!kind.is_retryable());
    }

    #[test]
    fn status_takes_precedence_over_detail() {
        let err = AuthError::from(&provider_error(Some(429), "slow down"));
        assert_eq!(err.kind(), AuthErrorKind::RateLimited);

        let err = AuthError::from(&provider_error(Some(503), "upstream unavailable"));
        assert_eq!(err.kind(), AuthErrorKind::Network);

        let err = AuthError::from(&provider_error(Some(401), "jwt expired"));
        assert_eq!(err.kind(), AuthErrorKind::Unauthorized);
    }

    #[test]
    fn bad_request_falls_back_to_detail() {
        let err = AuthError::from(&provider_error(
            Some(400),
            r#"{"error":"invalid_grant","error_description":"Invalid Refresh Token"}"#,
        ));
        assert_eq!(err.kind(), AuthErrorKind::InvalidRefreshToken);
        assert!(err.message().contains("invalid_grant"));
    }

    #[test]
    fn auth_error_passes_through_unchanged() {
        let inner = AuthError::new(AuthErrorKind::FingerprintMismatch, "tampered").with_attempts(2);
        let err = AuthError::from(Error::Auth(inner.clone()));
        assert_eq!(err, inner);
    }

    #[test]
    fn storage_errors_keep_their_kind() {
        let err = AuthError::from(Error::Storage("disk full".into()));
        assert_eq!(err.kind(), AuthErrorKind::Storage);
        assert_eq!(err.attempts(), 1);
    }
}
