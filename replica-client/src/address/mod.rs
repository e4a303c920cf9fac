//! Replica address resolution, caching, and selection.
//!
//! - [`types`]: the address model ([`ReplicaAddress`], [`PartitionAddressSet`])
//! - [`cache`]: the per-endpoint LRU [`AddressCache`]
//! - [`selector`]: primary / all-replica selection

/// Address cache.
pub mod cache;

/// Replica selection.
pub mod selector;

/// Address model.
pub mod types;

pub use cache::{
    AddressCache, AddressResolver, EndpointAddressCache, EndpointCacheEntry, DEFAULT_CAPACITY,
};
pub use selector::{select_all, select_primary, ReplicaSelector, ResolvedReplicas};
pub use types::{AddressError, PartitionAddressSet, Protocol, ProtocolAddressView, ReplicaAddress};
