//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use replica_client::{
    AddressResolver, ClientConfig, ConsistencyLevel, PartitionAddressSet,
    PartitionKeyRangeIdentity, ReplicaAddress, ReplicaError, ReplicatedResourceClient,
    RoutingMapProvider, ServiceConfiguration, ServiceConfigurationSource, ServiceRequest,
    StatusCode, StoreResponse, SubStatus, Transport, TransportError,
};
use url::Url;

/// Install a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub const COLLECTION: &str = "items";
pub const COLLECTION_RID: &str = "coll-rid";

pub fn endpoint() -> Url {
    Url::parse("https://account.example.net/").expect("valid url")
}

pub fn read() -> ServiceRequest {
    ServiceRequest::read(endpoint(), COLLECTION).with_partition_key("pk-1")
}

pub fn create() -> ServiceRequest {
    ServiceRequest::create(endpoint(), COLLECTION, r#"{"id":"1"}"#).with_partition_key("pk-1")
}

pub fn replica(uri: &str, primary: bool) -> ReplicaAddress {
    ReplicaAddress::parse(uri, primary, true).expect("parse should succeed")
}

/// Address set from `(uri, is_primary)` pairs.
pub fn address_set(replicas: &[(&str, bool)]) -> PartitionAddressSet {
    PartitionAddressSet::new(replicas.iter().map(|(uri, primary)| replica(uri, *primary)).collect())
        .expect("set should build")
}

pub fn ok(lsn: i64) -> Result<StoreResponse, TransportError> {
    Ok(StoreResponse::new(StatusCode::OK, lsn))
}

pub fn ok_committed(lsn: i64, global_committed_lsn: i64) -> Result<StoreResponse, TransportError> {
    Ok(StoreResponse::new(StatusCode::OK, lsn).with_global_committed_lsn(global_committed_lsn))
}

pub fn failure(status: StatusCode, sub_status: SubStatus) -> Result<StoreResponse, TransportError> {
    Err(TransportError::application(status, sub_status, "scripted"))
}

pub fn refused() -> Result<StoreResponse, TransportError> {
    Err(TransportError::ConnectFailed {
        message: "connection refused".into(),
    })
}

type Outcome = Result<StoreResponse, TransportError>;

/// Transport answering from per-address scripts, falling back to a
/// per-address default once the script is exhausted.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
    defaults: Mutex<HashMap<String, Outcome>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answers for the next calls to `uri`, in order.
    pub fn script(&self, uri: &str, outcomes: impl IntoIterator<Item = Outcome>) {
        self.scripts
            .lock()
            .entry(uri.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Answer for every call to `uri` once its script is exhausted.
    pub fn always(&self, uri: &str, outcome: Outcome) {
        self.defaults.lock().insert(uri.to_string(), outcome);
    }

    /// Delay every call to `uri`.
    pub fn delay(&self, uri: &str, delay: Duration) {
        self.delays.lock().insert(uri.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, uri: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == uri).count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        uri: &Url,
        _request: &ServiceRequest,
    ) -> Result<StoreResponse, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let key = uri.to_string();
        self.calls.lock().push(key.clone());

        let delay = self.delays.lock().get(&key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.scripts.lock().get_mut(&key).and_then(VecDeque::pop_front);
        match scripted {
            Some(outcome) => outcome,
            None => self.defaults.lock().get(&key).cloned().unwrap_or_else(|| {
                Err(TransportError::ConnectFailed {
                    message: format!("no script for {key}"),
                })
            }),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Resolver returning successive address-set versions: the n-th resolution
/// gets version n, the last version repeats.
pub struct StaticResolver {
    versions: Vec<PartitionAddressSet>,
    calls: AtomicUsize,
}

impl StaticResolver {
    pub fn new(versions: Vec<PartitionAddressSet>) -> Arc<Self> {
        assert!(!versions.is_empty());
        Arc::new(Self {
            versions,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressResolver for StaticResolver {
    async fn resolve_replicas(
        &self,
        _endpoint: &Url,
        _partition: &PartitionKeyRangeIdentity,
    ) -> Result<PartitionAddressSet, ReplicaError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.versions[n.min(self.versions.len() - 1)].clone())
    }
}

/// Routing map serving one range and recording refresh requests.
pub struct RecordingRouting {
    range_id: Mutex<String>,
    split_into: Mutex<Option<String>>,
    resolutions: AtomicUsize,
    refreshes: Mutex<Vec<String>>,
}

impl RecordingRouting {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            range_id: Mutex::new("0".into()),
            split_into: Mutex::new(None),
            resolutions: AtomicUsize::new(0),
            refreshes: Mutex::new(Vec::new()),
        })
    }

    /// Serve `range_id` from now on, as after a split.
    pub fn set_range(&self, range_id: &str) {
        *self.range_id.lock() = range_id.to_string();
    }

    /// Serve `range_id` once the routing map is next refreshed.
    pub fn split_into(&self, range_id: &str) {
        *self.split_into.lock() = Some(range_id.to_string());
    }

    pub fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::SeqCst)
    }

    /// Refreshes as `routing:<rid>` or `collection:<name>`.
    pub fn refreshes(&self) -> Vec<String> {
        self.refreshes.lock().clone()
    }
}

#[async_trait]
impl RoutingMapProvider for RecordingRouting {
    async fn resolve_partition_key_range(
        &self,
        _request: &ServiceRequest,
    ) -> Result<PartitionKeyRangeIdentity, ReplicaError> {
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        Ok(PartitionKeyRangeIdentity::new(COLLECTION_RID, self.range_id.lock().clone()))
    }

    async fn force_refresh_routing_map(&self, collection_rid: &str) -> Result<(), ReplicaError> {
        self.refreshes.lock().push(format!("routing:{collection_rid}"));
        if let Some(child) = self.split_into.lock().take() {
            *self.range_id.lock() = child;
        }
        Ok(())
    }

    async fn force_refresh_collection(&self, collection_name: &str) -> Result<(), ReplicaError> {
        self.refreshes.lock().push(format!("collection:{collection_name}"));
        Ok(())
    }
}

/// Configuration source answering a fixed configuration and counting
/// fetches.
pub struct StaticServiceConfig {
    config: ServiceConfiguration,
    fetches: AtomicUsize,
}

impl StaticServiceConfig {
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceConfigurationSource for StaticServiceConfig {
    async fn fetch(&self) -> Result<ServiceConfiguration, ReplicaError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.config.clone())
    }
}

pub fn service_config(
    replica_set_size: usize,
    consistency: ConsistencyLevel,
) -> Arc<StaticServiceConfig> {
    Arc::new(StaticServiceConfig {
        config: ServiceConfiguration {
            system_replica_set_size: replica_set_size,
            user_replica_set_size: replica_set_size,
            default_consistency: consistency,
        },
        fetches: AtomicUsize::new(0),
    })
}

/// Everything a test needs to drive and observe one client.
pub struct Harness {
    pub client: ReplicatedResourceClient,
    pub transport: Arc<ScriptedTransport>,
    pub resolver: Arc<StaticResolver>,
    pub routing: Arc<RecordingRouting>,
    pub service: Arc<StaticServiceConfig>,
}

pub fn harness(
    config: ClientConfig,
    versions: Vec<PartitionAddressSet>,
    replica_set_size: usize,
    consistency: ConsistencyLevel,
) -> Harness {
    init_tracing();
    let transport = ScriptedTransport::new();
    let resolver = StaticResolver::new(versions);
    let routing = RecordingRouting::new();
    let service = service_config(replica_set_size, consistency);
    let client = ReplicatedResourceClient::new(
        config,
        resolver.clone(),
        routing.clone(),
        service.clone(),
        transport.clone(),
    );
    Harness {
        client,
        transport,
        resolver,
        routing,
        service,
    }
}
