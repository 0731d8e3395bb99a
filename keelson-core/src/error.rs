use std::time::Duration;

use keelson_model::{ClusterId, InfrastructureStatus, NodeId};
use thiserror::Error;

use crate::runtime::RuntimeError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Cluster not found: {0}")]
    ClusterNotFound(ClusterId),

    #[error("Node {node} does not belong to cluster {cluster}")]
    NodeNotFound { cluster: ClusterId, node: NodeId },

    #[error("Node {0} is already primary")]
    AlreadyPrimary(NodeId),

    #[error("Cluster {0} has no primary node")]
    NoPrimary(ClusterId),

    #[error("Cluster {0} is already running")]
    AlreadyRunning(ClusterId),

    #[error("Cannot {operation} cluster {cluster} while it is {status}")]
    InvalidState {
        cluster: ClusterId,
        status: InfrastructureStatus,
        operation: &'static str,
    },

    #[error("Cluster {0} is busy with another operation")]
    Busy(ClusterId),

    #[error("Node {node} was not ready after {waited:?}")]
    ReadinessTimeout { node: String, waited: Duration },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Step `{step}` failed on {node}: {detail}")]
    CommandFailed {
        node: String,
        step: &'static str,
        detail: String,
    },

    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ClusterError>;
