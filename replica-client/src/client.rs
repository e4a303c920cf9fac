//! Replicated resource client: the per-request entry point.
//!
//! ## Request flow
//!
//! ```text
//! invoke(request)
//!   │
//!   ├─ validate consistency against the service default
//!   │
//!   └─ loop (bounded by the overall request budget)
//!        ├─ apply invalidations requested by the last decision
//!        │     (routing map / collection refresh, clear resolved range)
//!        ├─ resolve partition key range (cached on the request)
//!        ├─ resolve replicas through the address cache
//!        │     (bypassed once after a Gone)
//!        ├─ write → primary │ read → ConsistencyReader
//!        │
//!        ├─ Ok  → return
//!        └─ Err → RetryPolicy::decide
//!                   ├─ Retry { backoff } → sleep, next attempt
//!                   └─ Fail(err)         → return err
//! ```

use std::any::Any;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::address::{AddressCache, AddressResolver, ReplicaSelector, ResolvedReplicas};
use crate::config::ClientConfig;
use crate::consistency::{call_replica, effective_consistency, ConsistencyReader, ReadMode};
use crate::error::{ReplicaError, RequestDiagnostics};
use crate::request::{ServiceRequest, StoreResponse};
use crate::retry::{RetryAction, RetryContext, RetryPolicy};
use crate::routing::{PartitionKeyRangeIdentity, RoutingMapProvider};
use crate::service_config::{
    ServiceConfiguration, ServiceConfigurationReader, ServiceConfigurationSource,
};
use crate::transport::{SharedTransportHandle, SharedTransportRegistry, Transport};

/// Issues requests against replicated partitions, retrying through
/// topology changes.
pub struct ReplicatedResourceClient {
    config: ClientConfig,
    selector: ReplicaSelector,
    routing: Arc<dyn RoutingMapProvider>,
    service_config: Arc<ServiceConfigurationReader>,
    transport: Arc<dyn Transport>,
    reader: ConsistencyReader,
    policy: RetryPolicy,
    /// Shared transport reference released when the client drops.
    _lease: Option<Box<dyn Any + Send + Sync>>,
}

impl ReplicatedResourceClient {
    /// Create a client over `transport`. Service configuration is read from
    /// `service_config` and cached for `config.service_config_refresh`.
    pub fn new(
        config: ClientConfig,
        resolver: Arc<dyn AddressResolver>,
        routing: Arc<dyn RoutingMapProvider>,
        service_config: Arc<dyn ServiceConfigurationSource>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let cache = Arc::new(AddressCache::with_capacity(resolver, config.address_cache_capacity));
        let service_config = Arc::new(ServiceConfigurationReader::new(
            service_config,
            config.service_config_refresh,
        ));
        Self {
            selector: ReplicaSelector::new(cache, config.protocol),
            reader: ConsistencyReader::new(transport.clone(), &config),
            policy: RetryPolicy::new(config.retry.clone()),
            config,
            routing,
            service_config,
            transport,
            _lease: None,
        }
    }

    /// Create a client over the transport `registry` shares for this
    /// configuration's protocol and connection settings.
    pub fn from_registry<T: Transport + 'static>(
        config: ClientConfig,
        resolver: Arc<dyn AddressResolver>,
        routing: Arc<dyn RoutingMapProvider>,
        service_config: Arc<dyn ServiceConfigurationSource>,
        registry: &SharedTransportRegistry<T>,
    ) -> Self {
        let handle = registry.acquire(config.transport_key());
        Self::with_shared_transport(config, resolver, routing, service_config, handle)
    }

    /// Create a client over a shared transport. The client holds the
    /// reference until it is dropped.
    pub fn with_shared_transport<T: Transport + 'static>(
        config: ClientConfig,
        resolver: Arc<dyn AddressResolver>,
        routing: Arc<dyn RoutingMapProvider>,
        service_config: Arc<dyn ServiceConfigurationSource>,
        handle: SharedTransportHandle<T>,
    ) -> Self {
        if *handle.key() != config.transport_key() {
            warn!(
                shared = ?handle.key(),
                configured = ?config.transport_key(),
                "shared transport settings differ from the client configuration"
            );
        }
        let transport: Arc<dyn Transport> = handle.transport().clone();
        let mut client = Self::new(config, resolver, routing, service_config, transport);
        client._lease = Some(Box::new(handle));
        client
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The address cache shared by every request of this client.
    pub fn address_cache(&self) -> &Arc<AddressCache> {
        self.selector.cache()
    }

    /// Cached service configuration.
    pub fn service_config(&self) -> &Arc<ServiceConfigurationReader> {
        &self.service_config
    }

    /// Transport requests are sent through.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Run `request` to completion, or until `token` is cancelled.
    ///
    /// Cancellation drops the retry loop and every in-flight replica call.
    pub async fn invoke_with_cancellation(
        &self,
        request: ServiceRequest,
        token: &CancellationToken,
    ) -> Result<StoreResponse, ReplicaError> {
        let id = request.id();
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(request = id, "request cancelled");
                Err(ReplicaError::Cancelled)
            }
            result = self.invoke(request) => result,
        }
    }

    /// Run `request` to completion: success, a terminal error, or the
    /// overall request budget running out.
    pub async fn invoke(&self, mut request: ServiceRequest) -> Result<StoreResponse, ReplicaError> {
        let service = self.service_config.current().await?;
        let level = effective_consistency(&request, service.default_consistency)?;
        let mode = ReadMode::for_request(&request, level);

        let mut ctx = RetryContext::new();
        let deadline = ctx.start() + self.config.request_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.budget_exhausted(&request, &ctx));
            }

            let attempt = ctx.begin_attempt();
            debug!(
                request = request.id(),
                attempt,
                mode = ?mode,
                operation = ?request.operation(),
                "starting attempt"
            );

            let outcome = tokio::time::timeout(
                remaining,
                self.attempt(&mut request, &mut ctx, &service, mode),
            )
            .await;
            ctx.record_lsn(
                request.context.last_observed_lsn,
                request.context.last_observed_global_committed_lsn,
            );

            let error = match outcome {
                Ok(Ok(response)) => {
                    debug!(
                        request = request.id(),
                        attempt,
                        lsn = response.lsn,
                        "request completed"
                    );
                    return Ok(response);
                }
                Ok(Err(error)) => error,
                Err(_) => return Err(self.budget_exhausted(&request, &ctx)),
            };

            let decision = self.policy.decide(&mut ctx, error);
            let backoff = match decision.action {
                RetryAction::Retry { backoff } => backoff,
                RetryAction::Fail(error) => return Err(with_diagnostics(error, &ctx)),
            };

            if backoff >= deadline.saturating_duration_since(Instant::now()) {
                return Err(self.budget_exhausted(&request, &ctx));
            }
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
        }
    }

    async fn attempt(
        &self,
        request: &mut ServiceRequest,
        ctx: &mut RetryContext,
        service: &ServiceConfiguration,
        mode: ReadMode,
    ) -> Result<StoreResponse, ReplicaError> {
        let pending = ctx.pending_invalidation();
        if pending.force_routing_map_refresh {
            self.routing
                .force_refresh_routing_map(request.collection_rid())
                .await?;
        }
        if pending.force_collection_refresh {
            self.routing
                .force_refresh_collection(request.collection_name())
                .await?;
        }
        if pending.clear_resolved_range {
            if let Some(stale) = request.context.resolved_range.take() {
                self.address_cache().invalidate(request.service_endpoint(), &stale);
            }
            request.context.clear_resolved();
        }
        let force_refresh = ctx.take_invalidation().force_address_refresh;

        let range = self.resolve_range(request).await?;

        if mode == ReadMode::Primary {
            let uri = self
                .selector
                .resolve_primary(request, &range, force_refresh)
                .await?;
            ctx.record_address(uri.as_str());

            if request.operation().is_write() {
                let response = call_replica(
                    self.transport.as_ref(),
                    &uri,
                    request,
                    self.config.replica_call_timeout,
                )
                .await?;
                request.context.observe(&response);
                return Ok(response);
            }

            let replicas = ResolvedReplicas {
                primary: Some(uri.clone()),
                all: vec![uri],
            };
            return self.read(request, &replicas, mode, service).await;
        }

        let replicas = self
            .selector
            .resolve_replicas(request, &range, false, force_refresh)
            .await?;
        for uri in &replicas.all {
            ctx.record_address(uri.as_str());
        }
        self.read(request, &replicas, mode, service).await
    }

    async fn read(
        &self,
        request: &mut ServiceRequest,
        replicas: &ResolvedReplicas,
        mode: ReadMode,
        service: &ServiceConfiguration,
    ) -> Result<StoreResponse, ReplicaError> {
        let replica_set_size = service.replica_set_size(request.resource_type());
        match tokio::time::timeout(
            self.config.read_attempt_timeout,
            self.reader.read(request, replicas, mode, replica_set_size),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ReplicaError::gone(
                format!(
                    "read attempt timed out after {:?}",
                    self.config.read_attempt_timeout
                ),
                replicas.all.iter().map(Url::to_string).collect(),
            )),
        }
    }

    async fn resolve_range(
        &self,
        request: &mut ServiceRequest,
    ) -> Result<PartitionKeyRangeIdentity, ReplicaError> {
        if let Some(range) = &request.context.resolved_range {
            return Ok(range.clone());
        }
        let range = self.routing.resolve_partition_key_range(request).await?;
        debug!(request = request.id(), range = %range, "resolved partition key range");
        request.context.resolved_range = Some(range.clone());
        Ok(range)
    }

    fn budget_exhausted(&self, request: &ServiceRequest, ctx: &RetryContext) -> ReplicaError {
        let reason = format!(
            "request budget of {:?} exhausted",
            self.config.request_timeout
        );
        warn!(
            request = request.id(),
            operation = ?request.operation(),
            attempts = ctx.attempts(),
            "{reason}"
        );
        ReplicaError::service_unavailable(reason, ctx.diagnostics())
    }
}

/// Replace placeholder diagnostics on terminal errors with the loop's.
fn with_diagnostics(error: ReplicaError, ctx: &RetryContext) -> ReplicaError {
    let fill = |diagnostics: Box<RequestDiagnostics>| {
        if diagnostics.attempts < ctx.attempts() {
            Box::new(ctx.diagnostics())
        } else {
            diagnostics
        }
    };
    match error {
        ReplicaError::ServiceUnavailable { reason, diagnostics } => {
            ReplicaError::ServiceUnavailable {
                reason,
                diagnostics: fill(diagnostics),
            }
        }
        ReplicaError::RequestTimeout { reason, diagnostics } => ReplicaError::RequestTimeout {
            reason,
            diagnostics: fill(diagnostics),
        },
        other => other,
    }
}
