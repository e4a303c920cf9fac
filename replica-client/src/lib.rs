//! # Replica Client
//!
//! Direct-mode data plane of a partitioned, replicated document store.
//!
//! Given a logical request against a partition, the client locates the
//! replicas currently serving it, issues the request at the configured
//! consistency level, and rides out topology churn (replica moves, splits,
//! migrations, transient unavailability) with bounded retries.
//!
//! This crate provides:
//! - **Address cache**: per-endpoint LRU of partition → replica addresses
//! - **Replica selection**: primary and all-replica selection by protocol
//! - **Consistency reads**: quorum, session and single-replica reads
//! - **Retry policy**: classification-driven Gone / retry-with state machine
//! - **Transport lifecycle**: idle-evicting endpoint pool and
//!   reference-counted transport sharing
//!
//! The wire codec, the routing-map service and the configuration service
//! are collaborators behind traits ([`ChannelFactory`], [`RoutingMapProvider`],
//! [`AddressResolver`], [`ServiceConfigurationSource`]).

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Replica addresses: model, cache, selection.
pub mod address;

/// Per-request orchestration.
pub mod client;

/// Client configuration.
pub mod config;

/// Consistency-level reads.
pub mod consistency;

/// Error taxonomy.
pub mod error;

/// Bounded map with recency tracking.
pub mod recency;

/// Requests and responses.
pub mod request;

/// Retry state machine.
pub mod retry;

/// Partition routing collaborator.
pub mod routing;

/// Service configuration collaborator.
pub mod service_config;

/// Status and sub-status codes.
pub mod status;

/// Transport contract, endpoint pool, shared transports.
pub mod transport;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use address::{
    select_all, select_primary, AddressCache, AddressError, AddressResolver, PartitionAddressSet,
    Protocol, ProtocolAddressView, ReplicaAddress, ReplicaSelector, ResolvedReplicas,
};
pub use client::ReplicatedResourceClient;
pub use config::{ClientConfig, ConnectionConfig, QuorumConfig, RetryConfig};
pub use consistency::{quorum_size, ConsistencyReader, QuorumReader, ReadMode};
pub use error::{FailureClass, ReplicaError, RequestDiagnostics};
pub use recency::RecencyMap;
pub use request::{
    ConsistencyLevel, OperationType, RequestContext, ResourceType, ServiceRequest, StoreResponse,
};
pub use retry::{Invalidation, RetryAction, RetryContext, RetryDecision, RetryPolicy};
pub use routing::{PartitionKeyRangeIdentity, RoutingMapProvider};
pub use service_config::{
    ServiceConfiguration, ServiceConfigurationReader, ServiceConfigurationSource,
};
pub use status::{StatusCode, SubStatus};
pub use transport::{
    Channel, ChannelFactory, EndpointPool, PoolStatsSnapshot, PooledEndpoint, PooledTransport,
    SharedTransportHandle, SharedTransportRegistry, Transport, TransportError, TransportKey,
};
