//! Background task that re-reads the node whenever it may have changed.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::coordinator::WatchEvent;
use crate::hashtable::WeakHashtable;

pub(crate) struct SyncTask {
    path: String,
    events: broadcast::Receiver<WatchEvent>,
    map: WeakHashtable,
}

impl SyncTask {
    pub(crate) fn new(
        path: String,
        events: broadcast::Receiver<WatchEvent>,
        map: WeakHashtable,
    ) -> Self {
        Self { path, events, map }
    }

    /// Runs until the session's event stream closes or the map is dropped.
    pub(crate) async fn run(mut self) {
        loop {
            let resync = match self.events.recv().await {
                Ok(event) => self.is_relevant(&event),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(path = %self.path, skipped, "watch events lagged, resyncing");
                    true
                }
                Err(RecvError::Closed) => return,
            };
            if !resync {
                continue;
            }

            let Some(map) = self.map.upgrade() else {
                return;
            };
            map.resync().await;
        }
    }

    fn is_relevant(&self, event: &WatchEvent) -> bool {
        match event {
            WatchEvent::Node { path, kind } if *path == self.path => {
                debug!(path = %self.path, ?kind, "node watch fired");
                true
            }
            WatchEvent::Node { .. } => false,
            WatchEvent::Connected => {
                info!(path = %self.path, "session connected, resyncing");
                true
            }
            WatchEvent::Disconnected => {
                info!(path = %self.path, "session disconnected");
                false
            }
        }
    }
}
