//! Best-effort fan-out of session events between tabs.
//!
//! Every [`SessionManager`](crate::session::SessionManager) sharing a
//! [`CrossTabChannel`] publishes its lifecycle changes there and reacts to
//! those published by the others. Delivery is fire-and-forget: no
//! acknowledgement, and a subscriber that falls behind loses the oldest
//! messages.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::types::{SessionId, TabId, UserId};

const DEFAULT_CAPACITY: usize = 64;

/// Why a tab reported suspicious activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum SuspicionReason {
    FingerprintMismatch,
}

/// Named session events.
///
/// Serialized as `{"type": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
#[non_exhaustive]
pub enum SessionEvent {
    SessionUpdated {
        session_id: SessionId,
        user_id: UserId,
        #[serde(with = "time::serde::rfc3339")]
        expires_at: OffsetDateTime,
    },
    /// `session_id: None` means every session was cleared.
    Logout { session_id: Option<SessionId> },
    SuspiciousActivity {
        reason: SuspicionReason,
        session_id: Option<SessionId>,
    },
}

/// Envelope carried on the channel.
#[derive(Debug, Clone)]
pub struct TabMessage {
    pub origin: TabId,
    pub event: SessionEvent,
}

/// Shared channel between tabs. Cheap to clone; all clones publish to the
/// same subscribers.
#[derive(Debug, Clone)]
pub struct CrossTabChannel {
    sender: broadcast::Sender<TabMessage>,
}

impl CrossTabChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Number of undelivered messages a slow subscriber may lag behind
    /// before it starts losing the oldest ones.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Never fails: with no other tab listening the
    /// message is simply dropped.
    pub fn publish(&self, origin: &TabId, event: SessionEvent) {
        let message = TabMessage {
            origin: origin.clone(),
            event,
        };
        match self.sender.send(message) {
            Ok(receivers) => {
                tracing::debug!(origin = %origin, receivers, "Session event published");
            }
            Err(_) => {
                tracing::trace!(origin = %origin, "Session event dropped, no listeners");
            }
        }
    }

    /// Subscribe as `tab`; messages published by `tab` itself are skipped.
    #[must_use]
    pub fn subscribe(&self, tab: TabId) -> TabSubscription {
        TabSubscription {
            tab,
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for CrossTabChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// One tab's view of the channel.
#[derive(Debug)]
pub struct TabSubscription {
    tab: TabId,
    receiver: broadcast::Receiver<TabMessage>,
}

impl TabSubscription {
    /// Next event published by another tab, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<TabMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if message.origin == self.tab => continue,
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(tab = %self.tab, skipped, "Cross-tab subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn logout() -> SessionEvent {
        SessionEvent::Logout {
            session_id: Some(SessionId(Ulid::nil())),
        }
    }

    #[tokio::test]
    async fn other_tabs_receive_published_events() {
        let channel = CrossTabChannel::new();
        let tab_a = TabId::from("a".to_string());
        let mut tab_b = channel.subscribe(TabId::from("b".to_string()));

        channel.publish(&tab_a, logout());

        let message = tab_b.recv().await.unwrap();
        assert_eq!(message.origin, tab_a);
        assert_eq!(message.event, logout());
    }

    #[tokio::test]
    async fn own_events_are_skipped() {
        let channel = CrossTabChannel::new();
        let tab_a = TabId::from("a".to_string());
        let tab_b = TabId::from("b".to_string());
        let mut sub_a = channel.subscribe(tab_a.clone());

        channel.publish(&tab_a, logout());
        channel.publish(&tab_b, SessionEvent::Logout { session_id: None });

        let message = sub_a.recv().await.unwrap();
        assert_eq!(message.origin, tab_b);
        assert_eq!(message.event, SessionEvent::Logout { session_id: None });
    }

    #[test]
    fn publish_without_listeners_is_silent() {
        let channel = CrossTabChannel::new();
        channel.publish(&TabId::from("lonely".to_string()), logout());
    }

    #[tokio::test]
    async fn lagged_subscriber_keeps_receiving() {
        let channel = CrossTabChannel::with_capacity(2);
        let origin = TabId::from("a".to_string());
        let mut sub = channel.subscribe(TabId::from("b".to_string()));

        for _ in 0..5 {
            channel.publish(&origin, logout());
        }
        channel.publish(&origin, SessionEvent::Logout { session_id: None });

        // The oldest messages are gone; the newest ones still arrive.
        let mut last = None;
        for _ in 0..2 {
            last = sub.recv().await.map(|m| m.event);
        }
        assert_eq!(last, Some(SessionEvent::Logout { session_id: None }));
    }

    #[tokio::test]
    async fn closed_channel_ends_subscription() {
        let channel = CrossTabChannel::new();
        let mut sub = channel.subscribe(TabId::from("b".to_string()));
        drop(channel);
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn suspicious_activity_wire_format() {
        let event = SessionEvent::SuspiciousActivity {
            reason: SuspicionReason::FingerprintMismatch,
            session_id: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "SUSPICIOUS_ACTIVITY");
        assert_eq!(json["payload"]["reason"], "fingerprint_mismatch");
        assert!(json["payload"]["sessionId"].is_null());
    }
}
