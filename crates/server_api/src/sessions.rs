use std::{collections::HashMap, fmt, sync::Arc};

use shared::protocol::ServerEvent;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// A serialized outbound message, shared between every recipient.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub fn encode(event: &ServerEvent) -> Result<Frame, serde_json::Error> {
    Ok(Arc::from(serde_json::to_string(event)?))
}

/// Connected sessions and their outbound queues.
///
/// A session is added when its connection opens and removed when it closes.
/// Sends never hold the lock while delivering, so a disconnect that races a
/// broadcast only costs that one frame.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, mpsc::UnboundedSender<Frame>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self) -> (SessionId, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SessionId::new();
        self.sessions.write().await.insert(id, tx);
        (id, rx)
    }

    pub async fn unregister(&self, id: SessionId) -> bool {
        self.sessions.write().await.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Queues `frame` for one session. Returns `false` if the session is gone.
    pub async fn send_to(&self, id: SessionId, frame: Frame) -> bool {
        let sender = self.sessions.read().await.get(&id).cloned();
        match sender {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        }
    }

    pub async fn send_event(
        &self,
        id: SessionId,
        event: &ServerEvent,
    ) -> Result<bool, serde_json::Error> {
        Ok(self.send_to(id, encode(event)?).await)
    }

    /// Queues `frame` for every session registered at the time of the call.
    /// Returns how many sessions accepted it.
    pub async fn broadcast(&self, frame: Frame) -> usize {
        let senders = self
            .sessions
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();

        senders
            .into_iter()
            .filter(|sender| sender.send(Arc::clone(&frame)).is_ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_every_registered_session() {
        let registry = SessionRegistry::new();
        let (_a, mut rx_a) = registry.register().await;
        let (_b, mut rx_b) = registry.register().await;

        assert_eq!(registry.broadcast(Arc::from("hello")).await, 2);
        assert_eq!(rx_a.recv().await.as_deref(), Some("hello"));
        assert_eq!(rx_b.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn send_to_targets_a_single_session() {
        let registry = SessionRegistry::new();
        let (a, mut rx_a) = registry.register().await;
        let (_b, mut rx_b) = registry.register().await;

        assert!(registry.send_to(a, Arc::from("only a")).await);
        assert_eq!(rx_a.recv().await.as_deref(), Some("only a"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregistered_sessions_stop_receiving() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = registry.register().await;
        let (_b, mut rx_b) = registry.register().await;

        assert!(registry.unregister(a).await);
        assert!(!registry.unregister(a).await);
        assert!(!registry.send_to(a, Arc::from("late")).await);
        assert_eq!(registry.len().await, 1);

        assert_eq!(registry.broadcast(Arc::from("tick")).await, 1);
        assert_eq!(rx_b.recv().await.as_deref(), Some("tick"));
    }

    #[tokio::test]
    async fn broadcast_skips_sessions_whose_receiver_dropped() {
        let registry = SessionRegistry::new();
        let (_a, rx_a) = registry.register().await;
        let (_b, mut rx_b) = registry.register().await;
        drop(rx_a);

        assert_eq!(registry.broadcast(Arc::from("tick")).await, 1);
        assert_eq!(rx_b.recv().await.as_deref(), Some("tick"));
    }
}
