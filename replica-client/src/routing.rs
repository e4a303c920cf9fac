//! Partition routing collaborator.
//!
//! The routing map turns a request (collection + partition key) into the
//! partition key range that owns it. It lives behind the gateway metadata
//! service; this crate only consumes it and asks it to refresh when the
//! topology changes under a request.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ReplicaError;
use crate::request::ServiceRequest;

/// Identity of one partition key range: the replica set serving it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKeyRangeIdentity {
    /// Resource id of the owning collection.
    pub collection_rid: String,
    /// Range id within the collection.
    pub range_id: String,
}

impl PartitionKeyRangeIdentity {
    /// Create a range identity.
    pub fn new(collection_rid: impl Into<String>, range_id: impl Into<String>) -> Self {
        Self {
            collection_rid: collection_rid.into(),
            range_id: range_id.into(),
        }
    }
}

impl fmt::Display for PartitionKeyRangeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection_rid, self.range_id)
    }
}

/// Routing-map and collection-cache collaborator.
#[async_trait]
pub trait RoutingMapProvider: Send + Sync {
    /// Resolve the partition key range serving `request`.
    async fn resolve_partition_key_range(
        &self,
        request: &ServiceRequest,
    ) -> Result<PartitionKeyRangeIdentity, ReplicaError>;

    /// Drop and reload the partition routing map of a collection.
    async fn force_refresh_routing_map(&self, collection_rid: &str) -> Result<(), ReplicaError>;

    /// Drop and reload the cached collection metadata for `collection_name`.
    async fn force_refresh_collection(&self, collection_name: &str) -> Result<(), ReplicaError>;
}
