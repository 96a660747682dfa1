//! gRPC session against a coordination server.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coord_types::coord;
use coord_types::coord::coordinator_client::CoordinatorClient;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::{debug, info, warn};

use crate::coordinator::{CoordError, Coordinator, EventKind, Stat, WatchEvent};
use crate::error::Error;

const EVENT_CAPACITY: usize = 256;

/// Server address wrapper for type-safe connection.
#[derive(Clone, Debug)]
pub struct ServerAddr(pub String);

impl From<String> for ServerAddr {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ServerAddr {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct RemoteOptions {
    /// Deadline for each unary call; exceeding it is an `OperationTimeout`.
    pub request_timeout: Duration,
    /// Pause between attempts to re-open the event stream.
    pub reconnect_delay: Duration,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// A [`Coordinator`] session over gRPC.
///
/// The server streams every node event; this session forwards only those
/// for paths it armed a watch on, disarming them as they fire. The event
/// stream doubles as the liveness signal: when it breaks, armed watches are
/// dropped and `Disconnected` is sent; when it is re-opened, `Connected`.
pub struct GrpcCoordinator {
    client: CoordinatorClient<Channel>,
    shared: Arc<Shared>,
    request_timeout: Duration,
    pump: JoinHandle<()>,
}

struct Shared {
    armed: Mutex<HashSet<String>>,
    connected: AtomicBool,
    events: broadcast::Sender<WatchEvent>,
}

impl Shared {
    /// Armed before the request goes out, so an event that overtakes the
    /// response still fires. A request that then fails leaves a spurious
    /// arm, which costs one extra read.
    fn arm(&self, path: &str) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.insert(path.to_string());
        }
    }
}

impl GrpcCoordinator {
    /// Creates a session against `addr` (e.g. `"localhost:50051"`).
    ///
    /// The channel connects lazily, so this succeeds even while the server
    /// is down; calls fail with `NotConnected` until it is reachable.
    pub async fn connect(addr: impl Into<ServerAddr>) -> Result<Self, Error> {
        Self::connect_with(addr, RemoteOptions::default()).await
    }

    pub async fn connect_with(
        addr: impl Into<ServerAddr>,
        options: RemoteOptions,
    ) -> Result<Self, Error> {
        let server_addr = addr.into();
        let endpoint = Endpoint::from_shared(format!("http://{}", server_addr.0))?;
        let client = CoordinatorClient::new(endpoint.connect_lazy());

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            armed: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(false),
            events,
        });

        let pump = tokio::spawn(pump_events(
            client.clone(),
            Arc::clone(&shared),
            options.reconnect_delay,
        ));

        Ok(Self {
            client,
            shared,
            request_timeout: options.request_timeout,
            pump,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn call<T, F>(&self, path: &str, fut: F) -> Result<T, CoordError>
    where
        F: Future<Output = Result<tonic::Response<T>, Status>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(from_status(status, path)),
            Err(_) => Err(CoordError::OperationTimeout),
        }
    }
}

impl Drop for GrpcCoordinator {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl Coordinator for GrpcCoordinator {
    async fn get(&self, path: &str, watch: bool) -> Result<(Vec<u8>, Stat), CoordError> {
        if watch {
            self.shared.arm(path);
        }
        let mut client = self.client.clone();
        let request = coord::GetRequest {
            path: path.to_string(),
        };
        let response = self.call(path, client.get(request)).await?;
        Ok((response.data, stat(response.stat)))
    }

    async fn set(&self, path: &str, data: Vec<u8>, version: i32) -> Result<Stat, CoordError> {
        let mut client = self.client.clone();
        let request = coord::SetRequest {
            path: path.to_string(),
            data,
            expected_version: version,
        };
        let response = self.call(path, client.set(request)).await?;
        Ok(stat(response.stat))
    }

    async fn create(&self, path: &str, data: Vec<u8>) -> Result<Stat, CoordError> {
        let mut client = self.client.clone();
        let request = coord::CreateRequest {
            path: path.to_string(),
            data,
        };
        let response = self.call(path, client.create(request)).await?;
        Ok(stat(response.stat))
    }

    async fn exists(&self, path: &str, watch: bool) -> Result<bool, CoordError> {
        if watch {
            self.shared.arm(path);
        }
        let mut client = self.client.clone();
        let request = coord::ExistsRequest {
            path: path.to_string(),
        };
        let response = self.call(path, client.exists(request)).await?;
        Ok(response.exists)
    }

    fn events(&self) -> broadcast::Receiver<WatchEvent> {
        self.shared.events.subscribe()
    }
}

/// Keeps the server's event stream open, re-opening it after failures.
async fn pump_events(
    mut client: CoordinatorClient<Channel>,
    shared: Arc<Shared>,
    reconnect_delay: Duration,
) {
    loop {
        match client.watch(coord::WatchRequest {}).await {
            Ok(response) => {
                let mut stream = response.into_inner();
                shared.connected.store(true, Ordering::SeqCst);
                info!("coordination session connected");
                let _ = shared.events.send(WatchEvent::Connected);

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(event) => dispatch(&shared, event),
                        Err(status) => {
                            warn!(%status, "event stream failed");
                            break;
                        }
                    }
                }
            }
            Err(status) => debug!(%status, "event stream unavailable"),
        }

        if shared.connected.swap(false, Ordering::SeqCst) {
            if let Ok(mut armed) = shared.armed.lock() {
                armed.clear();
            }
            info!("coordination session disconnected");
            let _ = shared.events.send(WatchEvent::Disconnected);
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}

fn dispatch(shared: &Shared, event: coord::NodeEvent) {
    let fired = shared
        .armed
        .lock()
        .map(|mut armed| armed.remove(&event.path))
        .unwrap_or(false);
    if !fired {
        return;
    }
    let kind = match event.kind() {
        coord::EventKind::Created => EventKind::Created,
        coord::EventKind::Changed => EventKind::Changed,
        coord::EventKind::Deleted => EventKind::Deleted,
    };
    let _ = shared.events.send(WatchEvent::Node {
        path: event.path,
        kind,
    });
}

fn stat(stat: Option<coord::Stat>) -> Stat {
    let stat = stat.unwrap_or_default();
    Stat {
        version: stat.version,
        data_length: usize::try_from(stat.data_length).unwrap_or(0),
    }
}

fn from_status(status: Status, path: &str) -> CoordError {
    match status.code() {
        Code::NotFound => CoordError::NoNode(path.to_string()),
        Code::AlreadyExists => CoordError::NodeExists(path.to_string()),
        Code::FailedPrecondition => CoordError::BadVersion(path.to_string()),
        Code::InvalidArgument => CoordError::InvalidPath(path.to_string()),
        Code::Unavailable => CoordError::NotConnected,
        Code::DeadlineExceeded | Code::Cancelled => CoordError::OperationTimeout,
        _ => CoordError::Other(status.message().to_string()),
    }
}
