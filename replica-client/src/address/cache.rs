//! Address cache: logical endpoint → partition → replica addresses.
//!
//! The outer level is a small LRU over logical service endpoints (an account
//! may talk to a handful of regional endpoints). Each entry owns the
//! partition map for its endpoint. The outer mutex is held only to look up
//! or insert an entry, never across a resolver call; partition maps use
//! their own read-write lock so concurrent readers of one endpoint do not
//! contend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use url::Url;

use crate::address::PartitionAddressSet;
use crate::error::ReplicaError;
use crate::recency::RecencyMap;
use crate::routing::PartitionKeyRangeIdentity;

/// Observed number of logical endpoints kept before LRU eviction.
pub const DEFAULT_CAPACITY: usize = 5;

/// External address-resolution collaborator (gateway or topology service).
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Resolve the current replica addresses of `partition` behind `endpoint`.
    async fn resolve_replicas(
        &self,
        endpoint: &Url,
        partition: &PartitionKeyRangeIdentity,
    ) -> Result<PartitionAddressSet, ReplicaError>;
}

/// Partition address cache for one logical endpoint.
pub struct EndpointAddressCache {
    endpoint: Url,
    resolver: Arc<dyn AddressResolver>,
    partitions: RwLock<HashMap<PartitionKeyRangeIdentity, Arc<PartitionAddressSet>>>,
}

impl EndpointAddressCache {
    fn new(endpoint: Url, resolver: Arc<dyn AddressResolver>) -> Self {
        Self {
            endpoint,
            resolver,
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Cached addresses of `partition`, resolving them when absent or when
    /// `force_refresh` is set.
    pub async fn resolve(
        &self,
        partition: &PartitionKeyRangeIdentity,
        force_refresh: bool,
    ) -> Result<Arc<PartitionAddressSet>, ReplicaError> {
        if !force_refresh {
            let cached = self.partitions.read().get(partition).cloned();
            if let Some(set) = cached {
                return Ok(set);
            }
        }

        let set = Arc::new(self.resolver.resolve_replicas(&self.endpoint, partition).await?);
        debug!(
            endpoint = %self.endpoint,
            partition = %partition,
            replicas = set.len(),
            force_refresh,
            "resolved partition addresses"
        );
        self.partitions.write().insert(partition.clone(), set.clone());
        Ok(set)
    }

    /// Forget the cached addresses of `partition`.
    pub fn invalidate(&self, partition: &PartitionKeyRangeIdentity) -> bool {
        self.partitions.write().remove(partition).is_some()
    }

    /// Number of cached partitions.
    pub fn len(&self) -> usize {
        self.partitions.read().len()
    }

    /// Whether no partition is cached.
    pub fn is_empty(&self) -> bool {
        self.partitions.read().is_empty()
    }
}

/// One logical endpoint and its partition cache.
pub struct EndpointCacheEntry {
    /// Logical service endpoint.
    pub endpoint: Url,
    /// Partition addresses behind it.
    pub cache: EndpointAddressCache,
}

/// Capacity-bounded LRU of [`EndpointCacheEntry`] keyed by logical endpoint.
pub struct AddressCache {
    resolver: Arc<dyn AddressResolver>,
    endpoints: Mutex<RecencyMap<Url, Arc<EndpointCacheEntry>>>,
    evictions: AtomicU64,
}

impl AddressCache {
    /// Create a cache holding [`DEFAULT_CAPACITY`] endpoints.
    pub fn new(resolver: Arc<dyn AddressResolver>) -> Self {
        Self::with_capacity(resolver, DEFAULT_CAPACITY)
    }

    /// Create a cache holding `capacity` endpoints.
    pub fn with_capacity(resolver: Arc<dyn AddressResolver>, capacity: usize) -> Self {
        Self {
            resolver,
            endpoints: Mutex::new(RecencyMap::bounded(capacity)),
            evictions: AtomicU64::new(0),
        }
    }

    fn entry_for(&self, endpoint: &Url) -> Arc<EndpointCacheEntry> {
        let mut endpoints = self.endpoints.lock();
        if let Some(entry) = endpoints.get(endpoint) {
            return entry.clone();
        }

        let entry = Arc::new(EndpointCacheEntry {
            endpoint: endpoint.clone(),
            cache: EndpointAddressCache::new(endpoint.clone(), self.resolver.clone()),
        });
        if let Some((evicted, _)) = endpoints.insert(endpoint.clone(), entry.clone()) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(
                evicted = %evicted,
                inserted = %endpoint,
                "evicted least recently used endpoint"
            );
        }
        entry
    }

    /// Resolve `partition` behind `endpoint`, marking the endpoint most
    /// recently used.
    pub async fn resolve(
        &self,
        endpoint: &Url,
        partition: &PartitionKeyRangeIdentity,
        force_refresh: bool,
    ) -> Result<Arc<PartitionAddressSet>, ReplicaError> {
        let entry = self.entry_for(endpoint);
        entry.cache.resolve(partition, force_refresh).await
    }

    /// Forget the cached addresses of `partition` behind `endpoint`.
    pub fn invalidate(&self, endpoint: &Url, partition: &PartitionKeyRangeIdentity) -> bool {
        let entry = self.endpoints.lock().peek(endpoint).cloned();
        entry.is_some_and(|entry| entry.cache.invalidate(partition))
    }

    /// Number of partitions cached behind `endpoint`. Does not affect
    /// recency.
    pub fn partition_count(&self, endpoint: &Url) -> usize {
        let entry = self.endpoints.lock().peek(endpoint).cloned();
        entry.map_or(0, |entry| entry.cache.len())
    }

    /// Number of cached endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.lock().len()
    }

    /// Whether no endpoint is cached.
    pub fn is_empty(&self) -> bool {
        self.endpoints.lock().is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.endpoints.lock().capacity().unwrap_or(DEFAULT_CAPACITY)
    }

    /// Whether `endpoint` is cached. Does not affect recency.
    pub fn contains(&self, endpoint: &Url) -> bool {
        self.endpoints.lock().contains_key(endpoint)
    }

    /// Cached endpoints from least to most recently used.
    pub fn endpoints(&self) -> Vec<Url> {
        self.endpoints.lock().keys_by_recency()
    }

    /// Number of endpoints evicted so far.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}
