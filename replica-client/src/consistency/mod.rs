//! Consistency-level reads over a resolved replica set.
//!
//! Reads are dispatched by [`ReadMode`]:
//!
//! | Requested level            | Mode               | Replicas contacted               |
//! |----------------------------|--------------------|----------------------------------|
//! | any + explicit replica     | `Primary`          | the indexed replica              |
//! | Strong                     | `Strong`           | primary, then secondaries        |
//! | BoundedStaleness           | `BoundedStaleness` | primary, then secondaries        |
//! | Session                    | `Session`          | random order until one caught up |
//! | ConsistentPrefix, Eventual | `Any`              | random order until one answers   |
//!
//! Quorum modes stop contacting secondaries once a quorum agrees.

use std::time::Duration;

use url::Url;

use crate::error::ReplicaError;
use crate::request::{ConsistencyLevel, ServiceRequest, StoreResponse};
use crate::status::{StatusCode, SubStatus};
use crate::transport::{Transport, TransportError};

/// Quorum reads.
pub mod quorum;

/// Mode dispatch.
pub mod reader;

pub use quorum::{select_quorum, QuorumReader, ReplicaResponse};
pub use reader::ConsistencyReader;

/// How a read is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadMode {
    /// Single call to the primary, or to an explicitly indexed replica.
    Primary,
    /// Quorum read at or above the global committed LSN.
    Strong,
    /// Quorum read.
    BoundedStaleness,
    /// First replica that has caught up with the session LSN.
    Session,
    /// Any single replica.
    Any,
}

impl ReadMode {
    /// Mode for `request` at the effective consistency `level`.
    pub fn for_request(request: &ServiceRequest, level: ConsistencyLevel) -> Self {
        if request.operation().is_write() || request.replica_index().is_some() {
            return ReadMode::Primary;
        }
        match level {
            ConsistencyLevel::Strong => ReadMode::Strong,
            ConsistencyLevel::BoundedStaleness => ReadMode::BoundedStaleness,
            ConsistencyLevel::Session => ReadMode::Session,
            ConsistencyLevel::ConsistentPrefix | ConsistencyLevel::Eventual => ReadMode::Any,
        }
    }

    /// Whether the mode needs a quorum of replicas.
    pub fn is_quorum(self) -> bool {
        matches!(self, ReadMode::Strong | ReadMode::BoundedStaleness)
    }
}

/// Strict majority of a replica set.
pub fn quorum_size(replica_set_size: usize) -> usize {
    replica_set_size / 2 + 1
}

/// The consistency a request runs at: its own override, or the service
/// default. An override stronger than the default is rejected.
pub fn effective_consistency(
    request: &ServiceRequest,
    default: ConsistencyLevel,
) -> Result<ConsistencyLevel, ReplicaError> {
    match request.consistency() {
        Some(requested) if requested.is_stronger_than(default) => Err(ReplicaError::Permanent {
            status: StatusCode::BAD_REQUEST,
            sub_status: SubStatus::NONE,
            message: format!(
                "requested consistency {requested:?} is stronger than the account default \
                 {default:?}"
            ),
        }),
        Some(requested) => Ok(requested),
        None => Ok(default),
    }
}

/// One physical replica call under `call_timeout`, classified.
pub(crate) async fn call_replica(
    transport: &dyn Transport,
    uri: &Url,
    request: &ServiceRequest,
    call_timeout: Duration,
) -> Result<StoreResponse, ReplicaError> {
    match tokio::time::timeout(call_timeout, transport.send(uri, request)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(err)) => Err(ReplicaError::from_transport(uri, err, request.operation())),
        Err(_) => Err(ReplicaError::from_transport(
            uri,
            TransportError::Timeout {
                elapsed: call_timeout,
            },
            request.operation(),
        )),
    }
}
