use crate::models::{self, Node, NodeEventKind};
use crate::storage::{Storage, StorageError};
use coord_types::coord::{
    coordinator_server::{Coordinator, CoordinatorServer},
    CreateRequest, CreateResponse, EventKind, ExistsRequest, ExistsResponse, GetRequest,
    GetResponse, NodeEvent, SetRequest, SetResponse, Stat, WatchRequest,
};
use futures_util::stream::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct CoordServiceImpl {
    storage: Arc<Storage>,
}

impl CoordServiceImpl {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

type WatchStream = Pin<Box<dyn Stream<Item = Result<NodeEvent, Status>> + Send>>;

impl From<StorageError> for Status {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NoNode(_) => Status::not_found(err.to_string()),
            StorageError::NodeExists(_) => Status::already_exists(err.to_string()),
            StorageError::BadVersion(..) => Status::failed_precondition(err.to_string()),
            StorageError::InvalidPath(_) => Status::invalid_argument(err.to_string()),
            StorageError::Sql(e) => Status::internal(format!("Database error: {}", e)),
        }
    }
}

fn stat(node: &Node) -> Option<Stat> {
    Some(Stat {
        version: node.version,
        data_length: i32::try_from(node.data.len()).unwrap_or(i32::MAX),
        mtime: node.mtime,
    })
}

fn proto_event(event: models::NodeEvent) -> NodeEvent {
    let kind = match event.kind {
        NodeEventKind::Created => EventKind::Created,
        NodeEventKind::Changed => EventKind::Changed,
    };
    NodeEvent {
        path: event.path,
        kind: kind as i32,
        version: event.version,
    }
}

#[tonic::async_trait]
impl Coordinator for CoordServiceImpl {
    type WatchStream = WatchStream;

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        let node = self.storage.get(&req.path).await?;
        Ok(Response::new(GetResponse {
            stat: stat(&node),
            data: node.data,
        }))
    }

    async fn set(&self, request: Request<SetRequest>) -> Result<Response<SetResponse>, Status> {
        let req = request.into_inner();
        let node = self
            .storage
            .set(&req.path, req.data, req.expected_version)
            .await
            .inspect_err(|e| debug!(path = %req.path, error = %e, "set rejected"))?;
        Ok(Response::new(SetResponse { stat: stat(&node) }))
    }

    async fn create(
        &self,
        request: Request<CreateRequest>,
    ) -> Result<Response<CreateResponse>, Status> {
        let req = request.into_inner();
        let node = self
            .storage
            .create(&req.path, req.data)
            .await
            .inspect_err(|e| debug!(path = %req.path, error = %e, "create rejected"))?;
        Ok(Response::new(CreateResponse { stat: stat(&node) }))
    }

    async fn exists(
        &self,
        request: Request<ExistsRequest>,
    ) -> Result<Response<ExistsResponse>, Status> {
        let req = request.into_inner();
        let exists = self.storage.exists(&req.path).await?;
        Ok(Response::new(ExistsResponse { exists }))
    }

    async fn watch(
        &self,
        _request: Request<WatchRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let mut events = self.storage.subscribe();

        let output = async_stream::stream! {
            loop {
                match events.recv().await {
                    Ok(event) => yield Ok(proto_event(event)),
                    Err(RecvError::Lagged(skipped)) => {
                        // The client must resync, so end the stream instead of skipping.
                        warn!(skipped, "watcher fell behind");
                        yield Err(Status::data_loss(format!("{} events dropped", skipped)));
                        break;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };

        Ok(Response::new(Box::pin(output)))
    }
}

pub fn create_server(storage: Arc<Storage>) -> CoordinatorServer<CoordServiceImpl> {
    CoordinatorServer::new(CoordServiceImpl::new(storage))
}
