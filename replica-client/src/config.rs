//! Configuration structures for the replica client.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::Protocol;
use crate::transport::TransportKey;

/// Retry budgets and caps for each failure class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Elapsed-time budget for topology-change retries (Gone, splitting,
    /// migrating, invalid partition, transient network failures)
    pub gone_budget: Duration,

    /// Maximum number of Gone-class retries before giving up
    pub gone_max_attempts: u32,

    /// Backoff before the second Gone retry; doubles for each retry after.
    /// The first retry is always immediate.
    pub gone_initial_backoff: Duration,

    /// Number of invalid-partition failures that ends the request
    pub invalid_partition_max_attempts: u32,

    /// First retry-with backoff
    pub retry_with_initial_backoff: Duration,

    /// Linear increase per retry-with retry
    pub retry_with_backoff_step: Duration,

    /// Upper bound on a single retry-with backoff
    pub retry_with_max_backoff: Duration,

    /// Elapsed-time budget for retry-with and session-not-available retries,
    /// measured from the first such failure
    pub retry_with_budget: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            gone_budget: Duration::from_secs(30),
            gone_max_attempts: 4,
            gone_initial_backoff: Duration::from_secs(1),
            invalid_partition_max_attempts: 3,
            retry_with_initial_backoff: Duration::from_millis(10),
            retry_with_backoff_step: Duration::from_millis(10),
            retry_with_max_backoff: Duration::from_millis(100),
            retry_with_budget: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Set the Gone-class elapsed budget.
    pub fn with_gone_budget(mut self, budget: Duration) -> Self {
        self.gone_budget = budget;
        self
    }

    /// Set the retry-with elapsed budget.
    pub fn with_retry_with_budget(mut self, budget: Duration) -> Self {
        self.retry_with_budget = budget;
        self
    }
}

/// Quorum read tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// Extra read rounds attempted when the first round reaches no quorum
    pub barrier_retries: u32,

    /// Pause between barrier rounds
    pub barrier_delay: Duration,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            barrier_retries: 2,
            barrier_delay: Duration::from_millis(10),
        }
    }
}

/// Connection lifecycle settings. Keys the shared transport registry, so two
/// clients with equal settings share one pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Idle time after which a pooled endpoint is closed
    pub idle_timeout: Duration,

    /// How often the background sweep looks for idle endpoints
    pub sweep_interval: Duration,

    /// Timeout for establishing a channel
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(20 * 60),
            sweep_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }
}

/// Top-level client configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Protocol used to reach replicas
    pub protocol: Protocol,

    /// Overall budget for one request including every retry
    pub request_timeout: Duration,

    /// Timeout for one physical replica call
    pub replica_call_timeout: Duration,

    /// Timeout for one consistency-read attempt (a quorum round included)
    pub read_attempt_timeout: Duration,

    /// Number of logical endpoints the address cache holds
    pub address_cache_capacity: usize,

    /// How long a service configuration snapshot stays fresh
    pub service_config_refresh: Duration,

    /// Retry budgets
    pub retry: RetryConfig,

    /// Quorum tuning
    pub quorum: QuorumConfig,

    /// Connection lifecycle
    pub connection: ConnectionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            request_timeout: Duration::from_secs(60),
            replica_call_timeout: Duration::from_secs(10),
            read_attempt_timeout: Duration::from_secs(30),
            address_cache_capacity: 5,
            service_config_refresh: Duration::from_secs(5 * 60),
            retry: RetryConfig::default(),
            quorum: QuorumConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration for low-latency local networking.
    pub fn local_network() -> Self {
        Self {
            protocol: Protocol::Tcp,
            request_timeout: Duration::from_secs(10),
            replica_call_timeout: Duration::from_secs(1),
            read_attempt_timeout: Duration::from_secs(3),
            address_cache_capacity: 5,
            service_config_refresh: Duration::from_secs(30),
            retry: RetryConfig::default().with_gone_budget(Duration::from_secs(8)),
            quorum: QuorumConfig {
                barrier_retries: 2,
                barrier_delay: Duration::from_millis(5),
            },
            connection: ConnectionConfig {
                idle_timeout: Duration::from_secs(60),
                sweep_interval: Duration::from_secs(5),
                connect_timeout: Duration::from_millis(500),
            },
        }
    }

    /// Create a configuration for high-latency WAN networking.
    pub fn wan_network() -> Self {
        Self {
            protocol: Protocol::Https,
            request_timeout: Duration::from_secs(120),
            replica_call_timeout: Duration::from_secs(30),
            read_attempt_timeout: Duration::from_secs(60),
            address_cache_capacity: 5,
            service_config_refresh: Duration::from_secs(10 * 60),
            retry: RetryConfig::default(),
            quorum: QuorumConfig {
                barrier_retries: 4,
                barrier_delay: Duration::from_millis(50),
            },
            connection: ConnectionConfig {
                idle_timeout: Duration::from_secs(30 * 60),
                sweep_interval: Duration::from_secs(120),
                connect_timeout: Duration::from_secs(30),
            },
        }
    }

    /// Set the replica protocol.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Set the overall request budget.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the per replica call timeout.
    pub fn with_replica_call_timeout(mut self, timeout: Duration) -> Self {
        self.replica_call_timeout = timeout;
        self
    }

    /// Set the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the quorum configuration.
    pub fn with_quorum(mut self, quorum: QuorumConfig) -> Self {
        self.quorum = quorum;
        self
    }

    /// Set the connection configuration.
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Set how long a service configuration snapshot stays fresh.
    pub fn with_service_config_refresh(mut self, refresh: Duration) -> Self {
        self.service_config_refresh = refresh;
        self
    }

    /// Key under which clients with these settings share a transport.
    pub fn transport_key(&self) -> TransportKey {
        TransportKey::new(self.protocol, self.connection.clone())
    }

    /// Set the address cache capacity.
    pub fn with_address_cache_capacity(mut self, capacity: usize) -> Self {
        self.address_cache_capacity = capacity;
        self
    }
}
