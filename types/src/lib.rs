//! Generated protobuf and gRPC types for the coordination service.
//!
//! Both the server and the client adapter in `node-map` build on these.

pub mod coord {
    tonic::include_proto!("coord");
}
