//! Cluster layer: peer links, cache-backed discovery, weak leader
//! election, cluster-wide rebroadcast, and request/response RPC.
//!
//! # Purpose
//! A [`ClusterManager`] owns every long-lived peer WebSocket of one node.
//! It plugs into the broker through the narrow `PeerFanout` trait and
//! reaches back only to replay inbound rebroadcasts and serve RPC
//! built-ins.
pub mod envelope;
pub mod manager;
pub mod peer;
pub mod rpc;

pub use envelope::{Envelope, RpcRequest, RpcResponse, StompRebroadcast};
pub use manager::{ChannelClass, ClusterManager};
pub use peer::{PeerLink, MANAGEMENT_HEADER, MANAGEMENT_NAME_HEADER};
pub use rpc::{NoRpcHandlers, PeerRpcOutcome, RpcCoordinator, RpcHandler};

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    #[error("clustering is disabled")]
    ClusterDisabled,
    #[error("cluster configuration: {0}")]
    Config(String),
    #[error("peer not found: {0}")]
    PeerNotFound(String),
    #[error("rpc {operation} to {peer} timed out after {seconds}s")]
    RpcTimeout {
        peer: String,
        operation: String,
        seconds: u64,
    },
    #[error("rpc failed: {0}")]
    Rpc(String),
    #[error("transport: {0}")]
    Transport(String),
}
