use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::fingerprint::Fingerprint;
use crate::types::{AuthUser, ProviderSession, SessionId, UserId};

/// Session as persisted in storage and handed to callers.
///
/// Serialized with camelCase keys; this is the record other tabs read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedSession {
    pub session_id: SessionId,
    pub user_id: UserId,
    #[serde(default)]
    pub email: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub fingerprint: Fingerprint,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_refreshed_at: Option<OffsetDateTime>,
}

impl EnhancedSession {
    pub(crate) fn new(
        raw: ProviderSession,
        user: AuthUser,
        fingerprint: Fingerprint,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            session_id: SessionId::generate(),
            user_id: user.id,
            email: user.email,
            access_token: raw.access_token,
            refresh_token: raw.refresh_token,
            expires_at: raw.expires_at,
            fingerprint,
            is_active: true,
            created_at: now,
            last_activity: now,
            last_refreshed_at: None,
        }
    }

    /// Copy carrying refreshed credentials; identity and fingerprint unchanged.
    #[must_use]
    pub(crate) fn refreshed(&self, raw: ProviderSession, now: OffsetDateTime) -> Self {
        Self {
            access_token: raw.access_token,
            refresh_token: raw.refresh_token,
            expires_at: raw.expires_at,
            last_refreshed_at: Some(now),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }

    /// Active and not yet expired.
    #[must_use]
    pub fn is_live_at(&self, now: OffsetDateTime) -> bool {
        self.is_active && !self.is_expired_at(now)
    }

    /// Time left before the access token expires; negative once expired.
    #[must_use]
    pub fn time_to_expiry(&self, now: OffsetDateTime) -> time::Duration {
        self.expires_at - now
    }
}
