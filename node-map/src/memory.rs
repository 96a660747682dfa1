//! In-process coordination service.
//!
//! A [`MemoryEnsemble`] holds the node tree; every [`MemoryCoordinator`]
//! obtained from it is an independent session with its own watches and its
//! own connection state, which makes it a faithful stand-in for several
//! processes sharing one service.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::coordinator::{self, CoordError, Coordinator, EventKind, Stat, WatchEvent};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: i32,
}

impl Node {
    fn stat(&self) -> Stat {
        Stat {
            version: self.version,
            data_length: self.data.len(),
        }
    }
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    sessions: Vec<Weak<Session>>,
}

struct Session {
    connected: AtomicBool,
    armed: Mutex<HashSet<String>>,
    injected: Mutex<VecDeque<CoordError>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Session {
    fn arm(&self, path: &str) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.insert(path.to_string());
        }
    }

    fn trigger(&self, path: &str, kind: EventKind) {
        let fired = self
            .armed
            .lock()
            .map(|mut armed| armed.remove(path))
            .unwrap_or(false);
        if fired {
            let _ = self.events.send(WatchEvent::Node {
                path: path.to_string(),
                kind,
            });
        }
    }
}

/// A shared, in-memory node tree. The root `/` always exists.
#[derive(Clone)]
pub struct MemoryEnsemble {
    state: Arc<Mutex<State>>,
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        let mut state = State::default();
        state.nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                version: 0,
            },
        );
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Opens a new, connected session.
    pub fn connect(&self) -> MemoryCoordinator {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let session = Arc::new(Session {
            connected: AtomicBool::new(true),
            armed: Mutex::new(HashSet::new()),
            injected: Mutex::new(VecDeque::new()),
            events,
        });
        if let Ok(mut state) = self.state.lock() {
            state.sessions.push(Arc::downgrade(&session));
        }
        MemoryCoordinator {
            ensemble: self.clone(),
            session,
        }
    }

    /// Reads a node directly, bypassing sessions and watches.
    pub fn node(&self, path: &str) -> Option<(Vec<u8>, Stat)> {
        let state = self.state.lock().ok()?;
        state.nodes.get(path).map(|node| (node.data.clone(), node.stat()))
    }

    /// Creates or overwrites a node, as an out-of-band writer would.
    pub fn put(&self, path: &str, data: impl Into<Vec<u8>>) -> Stat {
        let data = data.into();
        let (stat, kind) = {
            let Ok(mut state) = self.state.lock() else {
                return Stat::default();
            };
            match state.nodes.get_mut(path) {
                Some(node) => {
                    node.data = data;
                    node.version += 1;
                    (node.stat(), EventKind::Changed)
                }
                None => {
                    let node = Node { data, version: 0 };
                    let stat = node.stat();
                    state.nodes.insert(path.to_string(), node);
                    (stat, EventKind::Created)
                }
            }
        };
        self.notify(path, kind);
        stat
    }

    /// Deletes a node and its descendants. Returns whether it existed.
    pub fn remove(&self, path: &str) -> bool {
        if path == "/" {
            return false;
        }
        let removed: Vec<String> = {
            let Ok(mut state) = self.state.lock() else {
                return false;
            };
            let prefix = format!("{path}/");
            let doomed: Vec<String> = state
                .nodes
                .keys()
                .filter(|key| key.as_str() == path || key.starts_with(&prefix))
                .cloned()
                .collect();
            for key in &doomed {
                state.nodes.remove(key);
            }
            doomed
        };
        for key in &removed {
            self.notify(key, EventKind::Deleted);
        }
        !removed.is_empty()
    }

    fn notify(&self, path: &str, kind: EventKind) {
        let sessions: Vec<Arc<Session>> = match self.state.lock() {
            Ok(mut state) => {
                state.sessions.retain(|s| s.strong_count() > 0);
                state.sessions.iter().filter_map(Weak::upgrade).collect()
            }
            Err(_) => return,
        };
        for session in sessions {
            session.trigger(path, kind);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, CoordError> {
        self.state
            .lock()
            .map_err(|_| CoordError::Other("ensemble state poisoned".to_string()))
    }
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

/// One session against a [`MemoryEnsemble`].
#[derive(Clone)]
pub struct MemoryCoordinator {
    ensemble: MemoryEnsemble,
    session: Arc<Session>,
}

impl MemoryCoordinator {
    /// Drops the connection. Every call fails with `NotConnected` and all
    /// armed watches are lost until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        if self.session.connected.swap(false, Ordering::SeqCst) {
            if let Ok(mut armed) = self.session.armed.lock() {
                armed.clear();
            }
            let _ = self.session.events.send(WatchEvent::Disconnected);
        }
    }

    pub fn reconnect(&self) {
        if !self.session.connected.swap(true, Ordering::SeqCst) {
            let _ = self.session.events.send(WatchEvent::Connected);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.connected.load(Ordering::SeqCst)
    }

    /// Makes the next call on this session fail with `error`.
    pub fn inject_failure(&self, error: CoordError) {
        if let Ok(mut injected) = self.session.injected.lock() {
            injected.push_back(error);
        }
    }

    fn check(&self, path: &str) -> Result<(), CoordError> {
        if !self.is_connected() {
            return Err(CoordError::NotConnected);
        }
        if let Some(error) = self
            .session
            .injected
            .lock()
            .ok()
            .and_then(|mut injected| injected.pop_front())
        {
            return Err(error);
        }
        coordinator::validate_path(path)
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn get(&self, path: &str, watch: bool) -> Result<(Vec<u8>, Stat), CoordError> {
        self.check(path)?;
        let state = self.ensemble.lock()?;
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
        if watch {
            self.session.arm(path);
        }
        Ok((node.data.clone(), node.stat()))
    }

    async fn set(&self, path: &str, data: Vec<u8>, version: i32) -> Result<Stat, CoordError> {
        self.check(path)?;
        let stat = {
            let mut state = self.ensemble.lock()?;
            let node = state
                .nodes
                .get_mut(path)
                .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
            if version != -1 && version != node.version {
                return Err(CoordError::BadVersion(path.to_string()));
            }
            node.data = data;
            node.version += 1;
            node.stat()
        };
        self.ensemble.notify(path, EventKind::Changed);
        Ok(stat)
    }

    async fn create(&self, path: &str, data: Vec<u8>) -> Result<Stat, CoordError> {
        self.check(path)?;
        let stat = {
            let mut state = self.ensemble.lock()?;
            if state.nodes.contains_key(path) {
                return Err(CoordError::NodeExists(path.to_string()));
            }
            if let Some(parent) = coordinator::parent(path) {
                if !state.nodes.contains_key(parent) {
                    return Err(CoordError::NoNode(parent.to_string()));
                }
            }
            let node = Node { data, version: 0 };
            let stat = node.stat();
            state.nodes.insert(path.to_string(), node);
            stat
        };
        self.ensemble.notify(path, EventKind::Created);
        Ok(stat)
    }

    async fn exists(&self, path: &str, watch: bool) -> Result<bool, CoordError> {
        self.check(path)?;
        let state = self.ensemble.lock()?;
        if watch {
            self.session.arm(path);
        }
        Ok(state.nodes.contains_key(path))
    }

    fn events(&self) -> broadcast::Receiver<WatchEvent> {
        self.session.events.subscribe()
    }
}
