use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::channel::Channel;
use crate::session::SessionId;

/// Process-wide session table. Reads run in parallel; insert and remove are
/// exclusive.
#[derive(Default)]
pub(crate) struct ChannelMap {
    inner: RwLock<HashMap<SessionId, Arc<Channel>>>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sid: &SessionId) -> Option<Arc<Channel>> {
        self.inner.read().get(sid).cloned()
    }

    pub fn contains(&self, sid: &SessionId) -> bool {
        self.inner.read().contains_key(sid)
    }

    pub fn insert(&self, sid: SessionId, channel: Arc<Channel>) {
        self.inner.write().insert(sid, channel);
    }

    /// Removes an entry, reporting whether it was present.
    pub fn remove(&self, sid: &SessionId) -> bool {
        self.inner.write().remove(sid).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }
}

/// Drains terminated session ids and evicts them from the map. Runs until
/// every channel-side sender is dropped.
pub(crate) fn spawn_gc(
    map: Arc<ChannelMap>,
    mut terminated: mpsc::UnboundedReceiver<SessionId>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(sid) = terminated.recv().await {
            if map.remove(&sid) {
                info!(sid = %sid, sessions = map.len(), "removed session from map");
            } else {
                warn!(sid = %sid, "terminated session was not in the map");
            }
        }
    })
}
