//! Requests issued against a partition and the responses replicas return.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::routing::PartitionKeyRangeIdentity;
use crate::status::StatusCode;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Kind of operation a request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Point read.
    Read,
    /// Feed read.
    ReadFeed,
    /// Query.
    Query,
    /// Metadata-only read.
    Head,
    /// Insert.
    Create,
    /// Full replacement.
    Replace,
    /// Insert or replace.
    Upsert,
    /// Delete.
    Delete,
    /// Partial update.
    Patch,
}

impl OperationType {
    /// Whether the operation mutates state and must target the primary.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            OperationType::Create
                | OperationType::Replace
                | OperationType::Upsert
                | OperationType::Delete
                | OperationType::Patch
        )
    }

    /// Whether the operation only reads.
    pub fn is_read(self) -> bool {
        !self.is_write()
    }
}

/// Kind of resource a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    /// Database metadata.
    Database,
    /// Collection metadata.
    Collection,
    /// Throughput offer.
    Offer,
    /// User document.
    Document,
    /// Server-side procedure.
    StoredProcedure,
}

impl ResourceType {
    /// System resources live on system replica sets, sized separately
    /// from user replica sets.
    pub fn is_system(self) -> bool {
        matches!(
            self,
            ResourceType::Database | ResourceType::Collection | ResourceType::Offer
        )
    }
}

/// Read consistency levels, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// Linearizable reads confirmed by a quorum at the global committed LSN.
    Strong,
    /// Quorum reads that may lag by a bounded amount.
    BoundedStaleness,
    /// Read-your-writes within a session token.
    Session,
    /// Reads never observe out-of-order writes.
    ConsistentPrefix,
    /// Any replica.
    Eventual,
}

impl ConsistencyLevel {
    fn rank(self) -> u8 {
        match self {
            ConsistencyLevel::Strong => 4,
            ConsistencyLevel::BoundedStaleness => 3,
            ConsistencyLevel::Session => 2,
            ConsistencyLevel::ConsistentPrefix => 1,
            ConsistencyLevel::Eventual => 0,
        }
    }

    /// Whether `self` gives stronger guarantees than `other`.
    pub fn is_stronger_than(self, other: ConsistencyLevel) -> bool {
        self.rank() > other.rank()
    }
}

/// Per-request state that survives across retry attempts.
///
/// Retries may keep or discard it: a split invalidates the resolved range
/// and any LSNs selected against the old topology.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Partition key range the request was routed to.
    pub resolved_range: Option<PartitionKeyRangeIdentity>,
    /// LSN selected by the last successful quorum read.
    pub quorum_selected_lsn: Option<i64>,
    /// Global committed LSN observed alongside the quorum-selected LSN.
    pub global_committed_selected_lsn: Option<i64>,
    /// Highest LSN seen from any replica during the last attempt.
    pub last_observed_lsn: Option<i64>,
    /// Highest global committed LSN seen during the last attempt.
    pub last_observed_global_committed_lsn: Option<i64>,
}

impl RequestContext {
    /// Forget the resolved range and every sequence number selected under it.
    pub fn clear_resolved(&mut self) {
        self.resolved_range = None;
        self.quorum_selected_lsn = None;
        self.global_committed_selected_lsn = None;
    }

    /// Fold one replica response into the observed LSNs.
    pub fn observe(&mut self, response: &StoreResponse) {
        self.last_observed_lsn = self.last_observed_lsn.max(Some(response.lsn));
        if response.global_committed_lsn.is_some() {
            self.last_observed_global_committed_lsn = self
                .last_observed_global_committed_lsn
                .max(response.global_committed_lsn);
        }
    }
}

/// A logical request against one partition.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    id: u64,
    operation: OperationType,
    resource_type: ResourceType,
    service_endpoint: Url,
    collection_name: String,
    collection_rid: Option<String>,
    partition_key: Option<String>,
    consistency: Option<ConsistencyLevel>,
    session_lsn: Option<i64>,
    replica_index: Option<usize>,
    body: Bytes,
    /// State carried between attempts.
    pub context: RequestContext,
}

impl ServiceRequest {
    /// Create a request for `operation` on a resource inside `collection_name`,
    /// served by the logical endpoint `service_endpoint`.
    pub fn new(
        operation: OperationType,
        resource_type: ResourceType,
        service_endpoint: Url,
        collection_name: impl Into<String>,
    ) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            operation,
            resource_type,
            service_endpoint,
            collection_name: collection_name.into(),
            collection_rid: None,
            partition_key: None,
            consistency: None,
            session_lsn: None,
            replica_index: None,
            body: Bytes::new(),
            context: RequestContext::default(),
        }
    }

    /// Point read of a document.
    pub fn read(service_endpoint: Url, collection_name: impl Into<String>) -> Self {
        Self::new(
            OperationType::Read,
            ResourceType::Document,
            service_endpoint,
            collection_name,
        )
    }

    /// Document insert.
    pub fn create(
        service_endpoint: Url,
        collection_name: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self::new(
            OperationType::Create,
            ResourceType::Document,
            service_endpoint,
            collection_name,
        )
        .with_body(body)
    }

    /// Set the collection resource id used for routing-map refreshes.
    pub fn with_collection_rid(mut self, rid: impl Into<String>) -> Self {
        self.collection_rid = Some(rid.into());
        self
    }

    /// Set the partition key the routing map resolves to a range.
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Override the service's default consistency level.
    pub fn with_consistency(mut self, level: ConsistencyLevel) -> Self {
        self.consistency = Some(level);
        self
    }

    /// Require a session read to observe at least `lsn`.
    pub fn with_session_lsn(mut self, lsn: i64) -> Self {
        self.session_lsn = Some(lsn);
        self
    }

    /// Pin the request to the replica at `index` in the protocol-filtered view.
    pub fn with_replica_index(mut self, index: usize) -> Self {
        self.replica_index = Some(index);
        self
    }

    /// Attach a serialized body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Process-unique request id, used to correlate log lines.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Operation type.
    pub fn operation(&self) -> OperationType {
        self.operation
    }

    /// Resource type.
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    /// Logical endpoint the request is resolved against.
    pub fn service_endpoint(&self) -> &Url {
        &self.service_endpoint
    }

    /// Collection name.
    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    /// Collection resource id, falling back to the resolved range's
    /// collection and finally to the collection name.
    pub fn collection_rid(&self) -> &str {
        self.collection_rid
            .as_deref()
            .or_else(|| {
                self.context
                    .resolved_range
                    .as_ref()
                    .map(|range| range.collection_rid.as_str())
            })
            .unwrap_or(&self.collection_name)
    }

    /// Partition key, if any.
    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    /// Requested consistency override.
    pub fn consistency(&self) -> Option<ConsistencyLevel> {
        self.consistency
    }

    /// Session LSN the read must observe.
    pub fn session_lsn(&self) -> Option<i64> {
        self.session_lsn
    }

    /// Explicit replica index.
    pub fn replica_index(&self) -> Option<usize> {
        self.replica_index
    }

    /// Serialized body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// A replica's answer to a [`ServiceRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreResponse {
    /// Status code.
    pub status: StatusCode,
    /// LSN of the replica when it served the request.
    pub lsn: i64,
    /// Highest LSN known to be committed by every region, when reported.
    pub global_committed_lsn: Option<i64>,
    /// Serialized body.
    pub body: Bytes,
}

impl StoreResponse {
    /// Create an empty-bodied response.
    pub fn new(status: StatusCode, lsn: i64) -> Self {
        Self {
            status,
            lsn,
            global_committed_lsn: None,
            body: Bytes::new(),
        }
    }

    /// Attach the global committed LSN.
    pub fn with_global_committed_lsn(mut self, lsn: i64) -> Self {
        self.global_committed_lsn = Some(lsn);
        self
    }

    /// Attach a body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}
