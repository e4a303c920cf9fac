//! Service configuration: replica-set sizes and default consistency.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ReplicaError;
use crate::request::{ConsistencyLevel, ResourceType};

/// Account-level settings published by the configuration service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfiguration {
    /// Replicas per system partition.
    pub system_replica_set_size: usize,
    /// Replicas per user partition.
    pub user_replica_set_size: usize,
    /// Consistency used when a request does not override it.
    pub default_consistency: ConsistencyLevel,
}

impl Default for ServiceConfiguration {
    fn default() -> Self {
        Self {
            system_replica_set_size: 4,
            user_replica_set_size: 4,
            default_consistency: ConsistencyLevel::Session,
        }
    }
}

impl ServiceConfiguration {
    /// Replica-set size for partitions holding `resource_type`.
    pub fn replica_set_size(&self, resource_type: ResourceType) -> usize {
        if resource_type.is_system() {
            self.system_replica_set_size
        } else {
            self.user_replica_set_size
        }
    }
}

/// Configuration collaborator.
#[async_trait]
pub trait ServiceConfigurationSource: Send + Sync {
    /// Fetch the current configuration.
    async fn fetch(&self) -> Result<ServiceConfiguration, ReplicaError>;
}

struct Snapshot {
    config: ServiceConfiguration,
    fetched_at: Instant,
}

/// Caches the collaborator's configuration and re-reads it once the refresh
/// interval has elapsed. A failed refresh keeps serving the stale snapshot.
pub struct ServiceConfigurationReader {
    source: Arc<dyn ServiceConfigurationSource>,
    refresh_interval: Duration,
    snapshot: RwLock<Option<Snapshot>>,
}

impl ServiceConfigurationReader {
    /// Create a reader.
    pub fn new(source: Arc<dyn ServiceConfigurationSource>, refresh_interval: Duration) -> Self {
        Self {
            source,
            refresh_interval,
            snapshot: RwLock::new(None),
        }
    }

    /// Last fetched configuration, without contacting the source.
    pub fn cached(&self) -> Option<ServiceConfiguration> {
        self.snapshot.read().as_ref().map(|s| s.config.clone())
    }

    /// Current configuration, fetched when missing or stale.
    pub async fn current(&self) -> Result<ServiceConfiguration, ReplicaError> {
        {
            let snapshot = self.snapshot.read();
            if let Some(snapshot) = snapshot.as_ref() {
                if snapshot.fetched_at.elapsed() < self.refresh_interval {
                    return Ok(snapshot.config.clone());
                }
            }
        }
        self.refresh().await
    }

    /// Fetch from the source now.
    pub async fn refresh(&self) -> Result<ServiceConfiguration, ReplicaError> {
        match self.source.fetch().await {
            Ok(config) => {
                debug!(
                    user_replicas = config.user_replica_set_size,
                    system_replicas = config.system_replica_set_size,
                    consistency = ?config.default_consistency,
                    "service configuration refreshed"
                );
                *self.snapshot.write() = Some(Snapshot {
                    config: config.clone(),
                    fetched_at: Instant::now(),
                });
                Ok(config)
            }
            Err(err) => match self.cached() {
                Some(stale) => {
                    warn!(
                        error = %err,
                        "service configuration refresh failed, serving cached copy"
                    );
                    Ok(stale)
                }
                None => Err(err),
            },
        }
    }
}
