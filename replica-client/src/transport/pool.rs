//! Per-replica connection pool with idle eviction.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

use crate::config::ConnectionConfig;
use crate::recency::RecencyMap;
use crate::request::{ServiceRequest, StoreResponse};
use crate::transport::{Transport, TransportError};

/// An open connection to one replica. Implemented by the wire codec.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Exchange one request for its response.
    async fn request(&self, request: &ServiceRequest) -> Result<StoreResponse, TransportError>;

    /// Tear the connection down.
    fn close(&self);
}

/// Opens [`Channel`]s. Implemented by the wire codec.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Connect to `uri`.
    async fn open(
        &self,
        uri: &Url,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn Channel>, TransportError>;
}

#[derive(Debug, Default)]
struct PoolMetrics {
    endpoints_created: AtomicU64,
    evictions: AtomicU64,
    idle_evictions: AtomicU64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    /// Endpoints created over the pool's lifetime.
    pub endpoints_created: u64,
    /// Endpoints closed, explicitly or by the idle sweep.
    pub evictions: u64,
    /// The subset of `evictions` done by the idle sweep.
    pub idle_evictions: u64,
    /// Endpoints currently pooled.
    pub open_endpoints: usize,
}

type EndpointMap = Mutex<RecencyMap<Url, Arc<PooledEndpoint>>>;

/// Connection wrapper for one replica address. The channel is opened on
/// first use.
pub struct PooledEndpoint {
    uri: Url,
    factory: Arc<dyn ChannelFactory>,
    config: ConnectionConfig,
    channel: OnceCell<Arc<dyn Channel>>,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
    metrics: Arc<PoolMetrics>,
    /// Recency map of the owning pool, refreshed on every request.
    pool: Weak<EndpointMap>,
}

impl PooledEndpoint {
    fn new(
        uri: Url,
        factory: Arc<dyn ChannelFactory>,
        config: ConnectionConfig,
        metrics: Arc<PoolMetrics>,
        pool: Weak<EndpointMap>,
    ) -> Self {
        Self {
            uri,
            factory,
            config,
            channel: OnceCell::new(),
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            metrics,
            pool,
        }
    }

    /// Replica address.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Last time a request started or finished on this endpoint.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Whether the endpoint has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the channel has been opened.
    pub fn is_connected(&self) -> bool {
        self.channel.initialized()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
        if self.is_closed() {
            return;
        }
        // keep the idle sweep in step with requests made through a held
        // endpoint, not only through the pool
        if let Some(endpoints) = self.pool.upgrade() {
            endpoints.lock().touch(&self.uri);
        }
    }

    /// Send `request` on this endpoint's channel, opening it if needed.
    pub async fn request(&self, request: &ServiceRequest) -> Result<StoreResponse, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let channel = self
            .channel
            .get_or_try_init(|| async {
                let channel = tokio::time::timeout(
                    self.config.connect_timeout,
                    self.factory.open(&self.uri, &self.config),
                )
                .await
                .map_err(|_| TransportError::ConnectFailed {
                    message: format!(
                        "connect to {} timed out after {:?}",
                        self.uri, self.config.connect_timeout
                    ),
                })??;
                debug!(uri = %self.uri, "opened channel");
                Ok::<_, TransportError>(channel)
            })
            .await?
            .clone();

        // closed while connecting
        if self.is_closed() {
            channel.close();
            return Err(TransportError::Closed);
        }

        self.touch();
        let result = channel.request(request).await;
        self.touch();
        result
    }

    /// Close the endpoint. Only the first call has an effect; it returns
    /// true and counts as one eviction.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(channel) = self.channel.get() {
            channel.close();
        }
        self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        debug!(uri = %self.uri, "closed endpoint");
        true
    }
}

/// Pool of [`PooledEndpoint`]s keyed by replica address.
pub struct EndpointPool {
    factory: Arc<dyn ChannelFactory>,
    config: ConnectionConfig,
    endpoints: Arc<EndpointMap>,
    metrics: Arc<PoolMetrics>,
    closed: AtomicBool,
}

impl EndpointPool {
    /// Create an empty pool.
    pub fn new(factory: Arc<dyn ChannelFactory>, config: ConnectionConfig) -> Self {
        Self {
            factory,
            config,
            endpoints: Arc::new(Mutex::new(RecencyMap::unbounded())),
            metrics: Arc::new(PoolMetrics::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Connection settings.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Endpoint for `uri`, created if absent or if the pooled one was closed.
    pub fn get(&self, uri: &Url) -> Result<Arc<PooledEndpoint>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut endpoints = self.endpoints.lock();
        if let Some(endpoint) = endpoints.get(uri) {
            if !endpoint.is_closed() {
                return Ok(endpoint.clone());
            }
        }

        let endpoint = Arc::new(PooledEndpoint::new(
            uri.clone(),
            self.factory.clone(),
            self.config.clone(),
            self.metrics.clone(),
            Arc::downgrade(&self.endpoints),
        ));
        endpoints.insert(uri.clone(), endpoint.clone());
        self.metrics.endpoints_created.fetch_add(1, Ordering::Relaxed);
        Ok(endpoint)
    }

    /// Mark `uri` as active for the idle sweep.
    pub fn touch(&self, uri: &Url) {
        self.endpoints.lock().touch(uri);
    }

    /// Close and remove the endpoint for `uri`.
    pub fn close(&self, uri: &Url) -> bool {
        let removed = self.endpoints.lock().remove(uri);
        removed.is_some_and(|endpoint| endpoint.close())
    }

    /// Close every endpoint idle for at least the configured idle timeout.
    /// Returns how many were closed by this sweep.
    pub fn sweep_idle(&self) -> usize {
        let drained = self
            .endpoints
            .lock()
            .drain_idle(Instant::now(), self.config.idle_timeout);

        let mut closed = 0;
        for (_, endpoint) in drained {
            if endpoint.close() {
                self.metrics.idle_evictions.fetch_add(1, Ordering::Relaxed);
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(closed, idle_timeout = ?self.config.idle_timeout, "evicted idle endpoints");
        }
        closed
    }

    /// Run [`EndpointPool::sweep_idle`] every sweep interval until the pool
    /// is closed or dropped. Must be called within a tokio runtime.
    pub fn spawn_idle_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                if pool.is_closed() {
                    break;
                }
                pool.sweep_idle();
            }
        })
    }

    /// Close every endpoint. Later [`EndpointPool::get`] calls fail.
    pub fn close_all(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained = self.endpoints.lock().drain();
        let count = drained.len();
        for (_, endpoint) in drained {
            endpoint.close();
        }
        info!(endpoints = count, "closed endpoint pool");
    }

    /// Whether [`EndpointPool::close_all`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of pooled endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.lock().len()
    }

    /// Whether the pool holds no endpoint.
    pub fn is_empty(&self) -> bool {
        self.endpoints.lock().is_empty()
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            endpoints_created: self.metrics.endpoints_created.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            idle_evictions: self.metrics.idle_evictions.load(Ordering::Relaxed),
            open_endpoints: self.len(),
        }
    }
}

/// [`Transport`] over an [`EndpointPool`].
pub struct PooledTransport {
    pool: Arc<EndpointPool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PooledTransport {
    /// Create a transport. The idle sweeper starts when called inside a
    /// tokio runtime.
    pub fn new(factory: Arc<dyn ChannelFactory>, config: ConnectionConfig) -> Self {
        let pool = Arc::new(EndpointPool::new(factory, config));
        let sweeper = tokio::runtime::Handle::try_current()
            .ok()
            .map(|_| pool.spawn_idle_sweeper());
        Self {
            pool,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }
}

#[async_trait]
impl Transport for PooledTransport {
    async fn send(
        &self,
        uri: &Url,
        request: &ServiceRequest,
    ) -> Result<StoreResponse, TransportError> {
        // an endpoint closed by the sweep between get and request is
        // replaced once
        for _ in 0..2 {
            let endpoint = self.pool.get(uri)?;
            match endpoint.request(request).await {
                Err(TransportError::Closed) if !self.pool.is_closed() => continue,
                result => return result,
            }
        }
        Err(TransportError::Closed)
    }

    fn close(&self) {
        self.pool.close_all();
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

impl Drop for PooledTransport {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}
