use std::sync::Arc;

use shared::protocol::ServerEvent;
use storage::Storage;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    sessions::{encode, Frame, SessionId, SessionRegistry},
    DispatchError,
};

/// Pushes the canonical tree to sessions. Every emission re-reads storage so
/// observers only ever see committed state.
///
/// Emissions are serialized: a snapshot is read and queued before the next
/// one is read, so each session's queue holds snapshots in commit order and
/// its last frame is never older than an earlier one.
#[derive(Clone)]
pub struct SnapshotBroadcaster {
    storage: Storage,
    sessions: SessionRegistry,
    pub(crate) emit_lock: Arc<Mutex<()>>,
}

impl SnapshotBroadcaster {
    pub fn new(storage: Storage, sessions: SessionRegistry) -> Self {
        Self {
            storage,
            sessions,
            emit_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn snapshot_frame(&self) -> Result<Frame, DispatchError> {
        let root = self.storage.fetch_tree().await?;
        Ok(encode(&ServerEvent::Tree { root })?)
    }

    pub async fn emit_to_one(&self, session: SessionId) -> Result<bool, DispatchError> {
        let _guard = self.emit_lock.lock().await;
        let frame = self.snapshot_frame().await?;
        let delivered = self.sessions.send_to(session, frame).await;
        debug!(%session, delivered, "sent tree to session");
        Ok(delivered)
    }

    pub async fn emit_to_all(&self) -> Result<usize, DispatchError> {
        let _guard = self.emit_lock.lock().await;
        let frame = self.snapshot_frame().await?;
        let delivered = self.sessions.broadcast(frame).await;
        debug!(delivered, "broadcast tree");
        Ok(delivered)
    }
}
