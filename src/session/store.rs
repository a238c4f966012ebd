use super::traits::SessionStorage;
use super::types::EnhancedSession;
use crate::error::Error;
use crate::types::SessionId;

const CURRENT_SUFFIX: &str = "current";

/// Session records on top of a [`SessionStorage`].
///
/// Layout: each record at `{prefix}:{session_id}`, and the id of the tab's
/// current session at `{prefix}:current`. Unreadable records are reported
/// as absent.
#[derive(Debug, Clone)]
pub(crate) struct SessionStore<S> {
    storage: S,
    prefix: String,
}

impl<S: SessionStorage> SessionStore<S> {
    pub(crate) fn new(storage: S, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
        }
    }

    fn record_key(&self, id: &SessionId) -> String {
        format!("{}:{id}", self.prefix)
    }

    fn current_key(&self) -> String {
        format!("{}:{CURRENT_SUFFIX}", self.prefix)
    }

    pub(crate) async fn current_id(&self) -> Result<Option<SessionId>, Error> {
        let Some(raw) = self.storage.get(&self.current_key()).await? else {
            return Ok(None);
        };
        match raw.trim().parse() {
            Ok(id) => Ok(Some(id)),
            Err(_) => {
                tracing::warn!(value = %raw, "Corrupted current-session pointer, ignoring");
                Ok(None)
            }
        }
    }

    pub(crate) async fn load(&self, id: &SessionId) -> Result<Option<EnhancedSession>, Error> {
        let Some(raw) = self.storage.get(&self.record_key(id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<EnhancedSession>(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Corrupted session record, ignoring");
                Ok(None)
            }
        }
    }

    pub(crate) async fn load_current(&self) -> Result<Option<EnhancedSession>, Error> {
        match self.current_id().await? {
            Some(id) => self.load(&id).await,
            None => Ok(None),
        }
    }

    /// Write a record without touching the current pointer.
    pub(crate) async fn save(&self, session: &EnhancedSession) -> Result<(), Error> {
        let json = serde_json::to_string(session)?;
        self.storage
            .set(&self.record_key(&session.session_id), json)
            .await
    }

    /// Write a record and make it the current session.
    pub(crate) async fn save_current(&self, session: &EnhancedSession) -> Result<(), Error> {
        self.save(session).await?;
        self.storage
            .set(&self.current_key(), session.session_id.to_string())
            .await
    }

    /// Remove a record; clears the current pointer too if it pointed there.
    pub(crate) async fn remove(&self, id: &SessionId) -> Result<(), Error> {
        self.storage.remove(&self.record_key(id)).await?;
        if self.current_id().await?.as_ref() == Some(id) {
            self.storage.remove(&self.current_key()).await?;
        }
        Ok(())
    }

    /// Every record, skipping corrupted ones.
    pub(crate) async fn load_all(&self) -> Result<Vec<EnhancedSession>, Error> {
        let current_key = self.current_key();
        let mut sessions = Vec::new();
        for key in self.storage.keys(&format!("{}:", self.prefix)).await? {
            if key == current_key {
                continue;
            }
            let Some(raw) = self.storage.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<EnhancedSession>(&raw) {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping corrupted session record"),
            }
        }
        Ok(sessions)
    }

    /// Remove every key under the prefix, corrupted records included.
    pub(crate) async fn remove_all(&self) -> Result<usize, Error> {
        let keys = self.storage.keys(&format!("{}:", self.prefix)).await?;
        let count = keys.len();
        for key in keys {
            self.storage.remove(&key).await?;
        }
        Ok(count)
    }

    #[cfg(test)]
    pub(crate) fn storage(&self) -> &S {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use time::{Duration, OffsetDateTime};

    use super::*;
    use crate::fingerprint::{EnvironmentSignals, FingerprintValidator};
    use crate::session::MemoryStorage;
    use crate::types::{AuthUser, ProviderSession};

    fn session() -> EnhancedSession {
        let now = OffsetDateTime::now_utc();
        EnhancedSession::new(
            ProviderSession::new("at", "rt", now + Duration::hours(1)),
            AuthUser::new("driver-9"),
            FingerprintValidator::new(EnvironmentSignals::new("ua")).generate(),
            now,
        )
    }

    fn store() -> SessionStore<MemoryStorage> {
        SessionStore::new(MemoryStorage::new(), "enhanced_session")
    }

    #[tokio::test]
    async fn save_current_then_load() {
        let store = store();
        let s = session();
        store.save_current(&s).await.unwrap();

        assert_eq!(store.current_id().await.unwrap(), Some(s.session_id));
        assert_eq!(store.load_current().await.unwrap(), Some(s));
    }

    #[tokio::test]
    async fn corrupted_record_reads_as_absent() {
        let store = store();
        let s = session();
        store.save_current(&s).await.unwrap();
        store
            .storage()
            .set(&format!("enhanced_session:{}", s.session_id), "{not json".into())
            .await
            .unwrap();

        assert!(store.load_current().await.unwrap().is_none());
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupted_pointer_reads_as_absent() {
        let store = store();
        store
            .storage()
            .set("enhanced_session:current", "definitely-not-a-ulid".into())
            .await
            .unwrap();
        assert!(store.current_id().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_clears_pointer_only_for_current() {
        let store = store();
        let current = session();
        let other = session();
        store.save(&other).await.unwrap();
        store.save_current(&current).await.unwrap();

        store.remove(&other.session_id).await.unwrap();
        assert_eq!(store.current_id().await.unwrap(), Some(current.session_id));

        store.remove(&current.session_id).await.unwrap();
        assert!(store.current_id().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_all_and_remove_all() {
        let store = store();
        store.save_current(&session()).await.unwrap();
        store.save(&session()).await.unwrap();
        store.storage().set("unrelated", "x".into()).await.unwrap();

        assert_eq!(store.load_all().await.unwrap().len(), 2);
        assert_eq!(store.remove_all().await.unwrap(), 3);
        assert!(store.load_all().await.unwrap().is_empty());
        assert_eq!(store.storage().len(), 1);
    }
}
