//! Distributed hashtable with optimistic concurrency control.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::coordinator::{self, CoordError, Coordinator};
use crate::error::{BoxError, Error};
use crate::listeners::{self, ErrorHandler, Listener, Listeners};
use crate::sync::SyncTask;

const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(100);
const DEFAULT_RETRY_JITTER: Duration = Duration::from_secs(1);

/// Tuning and error reporting for a [`DistributedHashtable`].
#[derive(Clone)]
pub struct Options {
    on_error: Arc<ErrorHandler>,
    retry_base: Duration,
    retry_jitter: Duration,
    max_conflict_retries: Option<usize>,
}

impl Options {
    pub fn new() -> Self {
        Self {
            on_error: Arc::new(|e: &Error| warn!(error = %e, "node-map operation failed")),
            retry_base: DEFAULT_RETRY_BASE,
            retry_jitter: DEFAULT_RETRY_JITTER,
            max_conflict_retries: None,
        }
    }

    /// Receives every error the map swallows: connectivity failures, decode
    /// failures and listener failures.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(handler);
        self
    }

    /// Fixed part of the pause after a version conflict.
    pub fn retry_base(mut self, delay: Duration) -> Self {
        self.retry_base = delay;
        self
    }

    /// Upper bound of the random part of the pause after a version conflict.
    pub fn retry_jitter(mut self, jitter: Duration) -> Self {
        self.retry_jitter = jitter;
        self
    }

    /// Gives up with [`Error::Conflict`] after this many conflict retries.
    /// Unbounded by default.
    pub fn max_conflict_retries(mut self, retries: usize) -> Self {
        self.max_conflict_retries = Some(retries);
        self
    }

    fn backoff(&self) -> Duration {
        self.retry_base + self.retry_jitter.mul_f64(rand::random::<f64>())
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("retry_base", &self.retry_base)
            .field("retry_jitter", &self.retry_jitter)
            .field("max_conflict_retries", &self.max_conflict_retries)
            .finish_non_exhaustive()
    }
}

/// A JSON object stored in one coordination node, cached locally and kept
/// current through watches.
///
/// Reads (`get`, `len`, ...) only touch the local cache. Mutations run a
/// compare-and-swap loop against the node:
///
/// 1. Fetch the payload and its version, apply the mutator, write back
///    conditioned on that version.
/// 2. On a version conflict, sleep `retry_base` plus up to `retry_jitter`
///    and start over from the fetch.
/// 3. If the node does not exist, apply the mutator to an empty object and
///    create it, creating missing parents first. If someone else created it
///    in the meantime, go back to step 1.
///
/// The mutator may therefore run more than once. Timeouts and lost
/// connections abort the operation and go to the error handler; the watch on
/// the node and the reconnect notification bring the cache back in sync.
///
/// Listeners run after every successful read or write, outside all locks.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use node_map::{DistributedHashtable, MemoryEnsemble, Options};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), node_map::Error> {
/// let ensemble = MemoryEnsemble::new();
/// let map = DistributedHashtable::new(
///     Arc::new(ensemble.connect()),
///     "/config/features",
///     Options::default(),
/// )
/// .await?;
///
/// map.set("dark_mode", "on").await;
/// assert_eq!(map.get("dark_mode"), Some(serde_json::Value::from("on")));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DistributedHashtable {
    inner: Arc<Inner>,
}

struct Inner {
    coordinator: Arc<dyn Coordinator>,
    path: String,
    options: Options,
    /// Serializes the read and update protocols, remote calls included.
    lock: tokio::sync::Mutex<()>,
    cache: Cache,
    listeners: Listeners,
    sync_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(slot) = self.sync_handle.get_mut() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// Non-owning handle held by the sync task.
pub(crate) struct WeakHashtable(Weak<Inner>);

impl WeakHashtable {
    pub(crate) fn upgrade(&self) -> Option<DistributedHashtable> {
        self.0.upgrade().map(|inner| DistributedHashtable { inner })
    }
}

#[derive(Clone, Copy)]
enum Attempt {
    Exists,
    Initial,
}

enum Step<R> {
    Committed(Map<String, Value>, i32, R),
    BadVersion,
    NoNode,
    NodeExists,
}

impl DistributedHashtable {
    /// Binds a map to `path`, starts watching it and loads it once.
    ///
    /// A failed initial load goes to the error handler; the map stays
    /// unloaded until a watch or reconnect event succeeds in reading it.
    pub async fn new(
        coordinator: Arc<dyn Coordinator>,
        path: impl Into<String>,
        options: Options,
    ) -> Result<Self, Error> {
        let path = path.into();
        coordinator::validate_path(&path)?;

        let events = coordinator.events();
        let inner = Arc::new(Inner {
            coordinator,
            path: path.clone(),
            options,
            lock: tokio::sync::Mutex::new(()),
            cache: Cache::new(),
            listeners: Listeners::default(),
            sync_handle: Mutex::new(None),
        });

        let task = SyncTask::new(path, events, WeakHashtable(Arc::downgrade(&inner)));
        let handle = tokio::spawn(task.run());
        if let Ok(mut slot) = inner.sync_handle.lock() {
            *slot = Some(handle);
        }

        let map = Self { inner };
        map.read().await;
        Ok(map)
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Whether the node has been read or written successfully at least once.
    pub fn is_loaded(&self) -> bool {
        self.inner.cache.is_loaded()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.cache.get(key)
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.inner.cache.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.cache.is_empty()
    }

    /// Copy of the cached object; empty if nothing was loaded yet.
    pub fn to_map(&self) -> Map<String, Value> {
        self.inner.cache.snapshot()
    }

    /// Iterates over a snapshot of the cached entries.
    pub fn iter(&self) -> serde_json::map::IntoIter {
        self.to_map().into_iter()
    }

    /// Stores `value` under `key`. Returns the previous value, or `None` if
    /// there was none or the write did not commit.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        self.update(move |map| map.insert(key.clone(), value.clone()))
            .await
            .flatten()
    }

    /// Removes `key`, returning its value. Missing keys yield `None`.
    pub async fn delete(&self, key: &str) -> Option<Value> {
        self.update(|map| map.remove(key)).await.flatten()
    }

    /// Inserts every entry of `other`, overwriting existing keys, and returns
    /// the merged object (the new state).
    pub async fn merge(&self, other: Map<String, Value>) -> Option<Map<String, Value>> {
        self.update(move |map| {
            for (key, value) in &other {
                map.insert(key.clone(), value.clone());
            }
            map.clone()
        })
        .await
    }

    /// Re-reads the node and fires listeners. Errors go to the error handler.
    pub async fn read(&self) {
        if let Err(e) = self.try_read().await {
            self.report(&e);
        }
    }

    pub async fn try_read(&self) -> Result<(), Error> {
        self.refresh(true).await
    }

    /// Re-read driven by a watch or reconnect. Listeners only run if the
    /// node moved past the cached version, so a watch fired by this map's
    /// own commit does not notify twice.
    pub(crate) async fn resync(&self) {
        if let Err(e) = self.refresh(false).await {
            self.report(&e);
        }
    }

    async fn refresh(&self, always_fire: bool) -> Result<(), Error> {
        let changed = {
            let _guard = self.inner.lock.lock().await;
            let (map, version) = self.fetch().await?;
            self.inner.cache.replace(map, version)
        };
        if changed || always_fire {
            self.fire();
        }
        Ok(())
    }

    /// Applies `mutator` to the latest remote object and commits the result.
    ///
    /// Returns the mutator's result, or `None` if the write did not commit;
    /// the reason is passed to the error handler.
    pub async fn update<F, R>(&self, mutator: F) -> Option<R>
    where
        F: FnMut(&mut Map<String, Value>) -> R,
    {
        match self.try_update(mutator).await {
            Ok(result) => Some(result),
            Err(e) => {
                self.report(&e);
                None
            }
        }
    }

    /// Like [`update`](Self::update) but returns the failure instead of
    /// reporting it, for callers that need to know the write committed.
    pub async fn try_update<F, R>(&self, mut mutator: F) -> Result<R, Error>
    where
        F: FnMut(&mut Map<String, Value>) -> R,
    {
        let result = {
            let _guard = self.inner.lock.lock().await;
            let (map, version, result) = self.commit(&mut mutator).await?;
            self.inner.cache.replace(map, Some(version));
            result
        };
        self.fire();
        Ok(result)
    }

    /// Registers `listener` and runs it once right away.
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn() -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let listener: Arc<Listener> = Arc::new(listener);
        self.inner.listeners.push(Arc::clone(&listener));
        listeners::invoke(&*listener, &*self.inner.options.on_error);
    }

    /// Runs every listener in registration order.
    pub fn fire(&self) {
        self.inner.listeners.fire(&*self.inner.options.on_error);
    }

    fn report(&self, error: &Error) {
        debug!(path = %self.inner.path, %error, "reporting swallowed error");
        (self.inner.options.on_error)(error);
    }

    /// Current payload and version, with a watch armed. An absent node is an
    /// empty map with no version.
    async fn fetch(&self) -> Result<(Map<String, Value>, Option<i32>), Error> {
        let Inner {
            coordinator, path, ..
        } = &*self.inner;
        loop {
            match coordinator.get(path, true).await {
                Ok((data, stat)) => return Ok((decode(&data)?, Some(stat.version))),
                Err(CoordError::NoNode(_)) => {
                    if !coordinator.exists(path, true).await? {
                        return Ok((Map::new(), None));
                    }
                    debug!(path = %path, "node appeared while reading, fetching again");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn commit<F, R>(&self, mutator: &mut F) -> Result<(Map<String, Value>, i32, R), Error>
    where
        F: FnMut(&mut Map<String, Value>) -> R,
    {
        let path = &self.inner.path;
        let options = &self.inner.options;
        let mut attempt = Attempt::Exists;
        let mut conflicts = 0;

        loop {
            let step = match attempt {
                Attempt::Exists => self.write_existing(mutator).await?,
                Attempt::Initial => self.write_initial(mutator).await?,
            };

            match (attempt, step) {
                (_, Step::Committed(map, version, result)) => return Ok((map, version, result)),
                (_, Step::BadVersion) => {
                    conflicts += 1;
                    if options.max_conflict_retries.is_some_and(|max| conflicts > max) {
                        return Err(Error::Conflict(conflicts - 1));
                    }
                    let delay = options.backoff();
                    debug!(path = %path, conflicts, ?delay, "version conflict, retrying");
                    tokio::time::sleep(delay).await;
                }
                (Attempt::Exists, Step::NoNode) => attempt = Attempt::Initial,
                (Attempt::Initial, Step::NoNode) => {
                    let parent = coordinator::parent(path)
                        .ok_or_else(|| CoordError::NoNode(path.clone()))?;
                    debug!(path = %path, parent, "creating missing parents");
                    self.inner.coordinator.mkdir_p(parent).await?;
                }
                (_, Step::NodeExists) => {
                    debug!(path = %path, "node created concurrently, updating instead");
                    attempt = Attempt::Exists;
                }
            }
        }
    }

    async fn write_existing<F, R>(&self, mutator: &mut F) -> Result<Step<R>, Error>
    where
        F: FnMut(&mut Map<String, Value>) -> R,
    {
        let Inner {
            coordinator, path, ..
        } = &*self.inner;
        let (data, stat) = match coordinator.get(path, true).await {
            Ok(found) => found,
            Err(CoordError::NoNode(_)) => return Ok(Step::NoNode),
            Err(e) => return Err(e.into()),
        };

        let mut map = decode(&data)?;
        let result = mutator(&mut map);
        let payload = serde_json::to_vec(&map)?;

        match coordinator.set(path, payload, stat.version).await {
            Ok(stat) => Ok(Step::Committed(map, stat.version, result)),
            Err(CoordError::BadVersion(_)) => Ok(Step::BadVersion),
            Err(CoordError::NoNode(_)) => Ok(Step::NoNode),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_initial<F, R>(&self, mutator: &mut F) -> Result<Step<R>, Error>
    where
        F: FnMut(&mut Map<String, Value>) -> R,
    {
        let Inner {
            coordinator, path, ..
        } = &*self.inner;
        let mut map = Map::new();
        let result = mutator(&mut map);
        let payload = serde_json::to_vec(&map)?;

        match coordinator.create(path, payload).await {
            Ok(stat) => Ok(Step::Committed(map, stat.version, result)),
            Err(CoordError::NodeExists(_)) => Ok(Step::NodeExists),
            Err(CoordError::NoNode(_)) => Ok(Step::NoNode),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Debug for DistributedHashtable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedHashtable")
            .field("path", &self.inner.path)
            .field("loaded", &self.is_loaded())
            .field("len", &self.len())
            .finish()
    }
}

/// An empty payload (a bare node made by `mkdir_p`) is an empty object.
fn decode(data: &[u8]) -> Result<Map<String, Value>, Error> {
    if data.is_empty() {
        return Ok(Map::new());
    }
    Ok(serde_json::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCoordinator, MemoryEnsemble};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PATH: &str = "/rollout/features";

    type Errors = Arc<Mutex<Vec<String>>>;

    fn test_options() -> (Options, Errors) {
        let errors: Errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let options = Options::new()
            .retry_base(Duration::from_millis(1))
            .retry_jitter(Duration::from_millis(5))
            .on_error(move |e| sink.lock().unwrap().push(e.to_string()));
        (options, errors)
    }

    async fn open(
        ensemble: &MemoryEnsemble,
        path: &str,
    ) -> (DistributedHashtable, MemoryCoordinator, Errors) {
        let zk = ensemble.connect();
        let (options, errors) = test_options();
        let map = DistributedHashtable::new(Arc::new(zk.clone()), path, options)
            .await
            .unwrap();
        (map, zk, errors)
    }

    fn remote(ensemble: &MemoryEnsemble, path: &str) -> Map<String, Value> {
        let (data, _) = ensemble.node(path).expect("node exists");
        serde_json::from_slice(&data).unwrap()
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn get_is_absent_before_first_read() {
        let ensemble = MemoryEnsemble::new();
        let zk = ensemble.connect();
        zk.disconnect();
        let (options, errors) = test_options();

        let map = DistributedHashtable::new(Arc::new(zk), PATH, options)
            .await
            .unwrap();

        assert!(!map.is_loaded());
        assert_eq!(map.get("a"), None);
        assert!(!map.has_key("a"));
        assert_eq!(map.len(), 0);
        assert!(map.is_empty());
        assert!(map.to_map().is_empty());
        assert_eq!(*errors.lock().unwrap(), vec!["not connected".to_string()]);
    }

    #[tokio::test]
    async fn missing_node_reads_as_empty_object() {
        let ensemble = MemoryEnsemble::new();
        let (map, _, errors) = open(&ensemble, PATH).await;

        assert!(map.is_loaded());
        assert!(map.is_empty());
        assert!(ensemble.node(PATH).is_none());
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_creates_node_and_missing_parents() {
        let ensemble = MemoryEnsemble::new();
        let (map, _, errors) = open(&ensemble, "/apps/web/flags").await;

        assert_eq!(map.set("a", "1").await, None);

        let (_, stat) = ensemble.node("/apps/web/flags").unwrap();
        assert_eq!(stat.version, 0);
        assert_eq!(remote(&ensemble, "/apps/web/flags"), object(json!({"a": "1"})));
        assert_eq!(map.to_map(), object(json!({"a": "1"})));
        assert!(ensemble.node("/apps").is_some());
        assert!(ensemble.node("/apps/web").is_some());
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sequential_mutations_apply_in_order() {
        let ensemble = MemoryEnsemble::new();
        let (map, _, _) = open(&ensemble, PATH).await;

        assert_eq!(map.set("a", 1).await, None);
        assert_eq!(map.set("b", 2).await, None);
        assert_eq!(map.set("a", 3).await, Some(json!(1)));
        assert_eq!(map.delete("b").await, Some(json!(2)));
        map.merge(object(json!({"c": true}))).await;

        let expected = object(json!({"a": 3, "c": true}));
        assert_eq!(map.to_map(), expected);
        assert_eq!(remote(&ensemble, PATH), expected);
        assert_eq!(ensemble.node(PATH).unwrap().1.version, 4);
        assert_eq!(map.len(), 2);
        assert!(map.has_key("c"));

        let mut keys: Vec<String> = map.iter().map(|(k, _)| k).collect();
        keys.sort();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn delete_of_missing_key_is_a_noop() {
        let ensemble = MemoryEnsemble::new();
        let (map, _, errors) = open(&ensemble, PATH).await;
        map.set("a", 1).await;

        assert_eq!(map.delete("missing").await, None);
        assert_eq!(map.to_map(), object(json!({"a": 1})));
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn merge_returns_merged_state() {
        let ensemble = MemoryEnsemble::new();
        ensemble.put("/rollout", Vec::new());
        ensemble.put(PATH, br#"{"a":1}"#.to_vec());
        let (map, _, _) = open(&ensemble, PATH).await;
        assert_eq!(map.get("a"), Some(json!(1)));

        let merged = map.merge(object(json!({"x": 1}))).await;

        let expected = object(json!({"a": 1, "x": 1}));
        assert_eq!(merged, Some(expected.clone()));
        assert_eq!(remote(&ensemble, PATH), expected);
        assert_eq!(map.to_map(), expected);
    }

    #[tokio::test]
    async fn losing_writer_retries_on_latest_version() {
        let ensemble = MemoryEnsemble::new();
        let (a, _, _) = open(&ensemble, PATH).await;
        let (b, _, b_errors) = open(&ensemble, PATH).await;

        a.set("a", "1").await;
        assert_eq!(ensemble.node(PATH).unwrap().1.version, 0);

        let calls = AtomicUsize::new(0);
        let racer = ensemble.clone();
        let previous = b
            .update(|map| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    racer.put(PATH, br#"{"a":"1","c":"3"}"#.to_vec());
                }
                map.insert("b".to_string(), json!("2"))
            })
            .await;

        let expected = object(json!({"a": "1", "b": "2", "c": "3"}));
        assert_eq!(previous, Some(None));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(remote(&ensemble, PATH), expected);
        assert_eq!(ensemble.node(PATH).unwrap().1.version, 2);
        assert_eq!(b.to_map(), expected);
        assert!(b_errors.lock().unwrap().is_empty());

        eventually(|| a.to_map() == expected).await;
    }

    #[tokio::test]
    async fn concurrent_create_switches_to_update() {
        let ensemble = MemoryEnsemble::new();
        let (map, _, _) = open(&ensemble, PATH).await;

        let calls = AtomicUsize::new(0);
        let racer = ensemble.clone();
        map.update(|m| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                racer.put("/rollout", Vec::new());
                racer.put(PATH, br#"{"first":true}"#.to_vec());
            }
            m.insert("second".to_string(), json!(true));
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            remote(&ensemble, PATH),
            object(json!({"first": true, "second": true}))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_never_lose_updates() {
        let ensemble = MemoryEnsemble::new();
        let (a, _, _) = open(&ensemble, PATH).await;
        let (b, _, _) = open(&ensemble, PATH).await;

        let mut tasks = Vec::new();
        for i in 0..16 {
            let map = if i % 2 == 0 { a.clone() } else { b.clone() };
            tasks.push(tokio::spawn(async move {
                map.set(format!("k{i}"), i).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stored = remote(&ensemble, PATH);
        assert_eq!(stored.len(), 16);
        for i in 0..16 {
            assert_eq!(stored.get(&format!("k{i}")), Some(&json!(i)));
        }

        eventually(|| a.to_map() == stored && b.to_map() == stored).await;
    }

    #[tokio::test]
    async fn listener_runs_on_registration_and_after_each_write() {
        let ensemble = MemoryEnsemble::new();
        let (map, _, _) = open(&ensemble, PATH).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        map.on_change(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        map.set("a", 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        map.delete("a").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn own_write_notifies_once_after_watch_settles() {
        let ensemble = MemoryEnsemble::new();
        let (map, _, _) = open(&ensemble, PATH).await;
        map.set("seed", 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        map.on_change(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        map.set("a", 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        map.read().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failing_listener_does_not_stop_the_next() {
        let ensemble = MemoryEnsemble::new();
        let (map, _, errors) = open(&ensemble, PATH).await;
        let seen = Arc::new(AtomicUsize::new(0));

        map.on_change(|| Err("listener exploded".into()));
        let s = Arc::clone(&seen);
        map.on_change(move || {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        map.fire();
        assert_eq!(errors.lock().unwrap().len(), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        assert!(map.set("a", 1).await.is_none());
        assert_eq!(map.get("a"), Some(json!(1)));
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|e| e.contains("listener exploded")));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn remote_change_refreshes_cache_and_fires() {
        let ensemble = MemoryEnsemble::new();
        let (a, _, _) = open(&ensemble, PATH).await;
        let (b, _, _) = open(&ensemble, PATH).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        a.on_change(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        b.set("x", 1).await;

        eventually(|| a.get("x") == Some(json!(1))).await;
        eventually(|| calls.load(Ordering::SeqCst) >= 2).await;
    }

    #[tokio::test]
    async fn connectivity_failure_is_reported_and_leaves_cache() {
        let ensemble = MemoryEnsemble::new();
        let (map, zk, errors) = open(&ensemble, PATH).await;
        map.set("a", 1).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        map.on_change(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        zk.inject_failure(CoordError::OperationTimeout);
        assert_eq!(map.set("b", 2).await, None);

        assert_eq!(map.to_map(), object(json!({"a": 1})));
        assert_eq!(remote(&ensemble, PATH), object(json!({"a": 1})));
        assert_eq!(*errors.lock().unwrap(), vec!["operation timed out".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        zk.inject_failure(CoordError::NotConnected);
        let err = map
            .try_update(|m| m.insert("b".to_string(), json!(2)))
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reconnect_triggers_resync() {
        let ensemble = MemoryEnsemble::new();
        let (map, zk, _) = open(&ensemble, PATH).await;
        map.set("a", 1).await;

        zk.disconnect();
        ensemble.put(PATH, br#"{"a":2}"#.to_vec());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(map.get("a"), Some(json!(1)));

        zk.reconnect();
        eventually(|| map.get("a") == Some(json!(2))).await;
    }

    #[tokio::test]
    async fn deleted_node_reads_as_empty_until_recreated() {
        let ensemble = MemoryEnsemble::new();
        let (map, _, _) = open(&ensemble, PATH).await;
        map.set("a", 1).await;

        ensemble.remove(PATH);
        eventually(|| map.is_loaded() && map.is_empty()).await;

        ensemble.put(PATH, br#"{"n":1}"#.to_vec());
        eventually(|| map.get("n") == Some(json!(1))).await;
    }

    #[tokio::test]
    async fn bounded_conflict_retries_give_up() {
        let ensemble = MemoryEnsemble::new();
        let zk = ensemble.connect();
        let (options, errors) = test_options();
        let map = DistributedHashtable::new(
            Arc::new(zk),
            PATH,
            options.max_conflict_retries(2),
        )
        .await
        .unwrap();
        map.set("a", 1).await;

        let calls = AtomicUsize::new(0);
        let racer = ensemble.clone();
        let result = map
            .try_update(|m| {
                calls.fetch_add(1, Ordering::SeqCst);
                racer.put(PATH, br#"{"a":0}"#.to_vec());
                m.insert("a".to_string(), json!(99))
            })
            .await;

        assert!(matches!(result, Err(Error::Conflict(2))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(remote(&ensemble, PATH), object(json!({"a": 0})));
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_payload_is_reported() {
        let ensemble = MemoryEnsemble::new();
        ensemble.put("/rollout", Vec::new());
        ensemble.put(PATH, b"[1,2,3]".to_vec());

        let (map, _, errors) = open(&ensemble, PATH).await;

        assert!(!map.is_loaded());
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("node payload is not a JSON object"));
    }

    #[tokio::test]
    async fn rejects_relative_paths() {
        let ensemble = MemoryEnsemble::new();
        let result =
            DistributedHashtable::new(Arc::new(ensemble.connect()), "features", Options::new())
                .await;
        assert!(matches!(
            result,
            Err(Error::Coordinator(CoordError::InvalidPath(_)))
        ));
    }
}
