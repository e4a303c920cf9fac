//! Transport layer: the replica-call contract plus connection lifecycle.
//!
//! The wire codec is not part of this crate. A [`Transport`] sends one
//! request to one physical replica address and returns the replica's
//! answer; [`PooledTransport`] implements it on top of an [`EndpointPool`]
//! of per-address channels, and [`SharedTransportRegistry`] lets many
//! clients share one pooled transport per configuration.
//!
//! # Ownership
//!
//! ```text
//! SharedTransportRegistry ── (protocol, ConnectionConfig) ──► PooledTransport
//!                                                                │
//!                                                            EndpointPool
//!                                                                │
//!                                                 PooledEndpoint per replica URI
//!                                                                │
//!                                                         Channel (wire codec)
//! ```

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::request::{ServiceRequest, StoreResponse};
use crate::status::{StatusCode, SubStatus};

/// Pooled per-endpoint connections with idle eviction.
pub mod pool;

/// Reference-counted transport sharing.
pub mod shared;

pub use pool::{
    Channel, ChannelFactory, EndpointPool, PoolStatsSnapshot, PooledEndpoint, PooledTransport,
};
pub use shared::{SharedTransportHandle, SharedTransportRegistry, TransportKey};

/// Failures of a single replica call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connect failed: {message}")]
    ConnectFailed {
        /// Details.
        message: String,
    },

    /// The replica host name did not resolve.
    #[error("name resolution failed: {message}")]
    NameResolutionFailed {
        /// Details.
        message: String,
    },

    /// The TLS handshake failed.
    #[error("handshake failed: {message}")]
    HandshakeFailed {
        /// Details.
        message: String,
    },

    /// No route to the replica host.
    #[error("no route to host: {message}")]
    NoRoute {
        /// Details.
        message: String,
    },

    /// The connection dropped mid-request.
    #[error("connection reset: {message}")]
    ConnectionReset {
        /// Details.
        message: String,
    },

    /// The replica did not answer in time.
    #[error("request timed out after {elapsed:?}")]
    Timeout {
        /// How long the call waited.
        elapsed: Duration,
    },

    /// The transport was closed.
    #[error("transport closed")]
    Closed,

    /// The replica answered with a failure status.
    #[error("application error {status}/{sub_status}: {message}")]
    Application {
        /// Status code.
        status: StatusCode,
        /// Sub-status.
        sub_status: SubStatus,
        /// Replica-provided details.
        message: String,
    },
}

impl TransportError {
    /// Shorthand for an [`TransportError::Application`] failure.
    pub fn application(
        status: StatusCode,
        sub_status: SubStatus,
        message: impl Into<String>,
    ) -> Self {
        TransportError::Application {
            status,
            sub_status,
            message: message.into(),
        }
    }

    /// Whether this is a connection-level failure rather than a replica answer.
    pub fn is_network(&self) -> bool {
        !matches!(
            self,
            TransportError::Application { .. } | TransportError::Closed
        )
    }

    /// Whether the failure provably happened before the request left the
    /// client, which makes even a write safe to resend.
    pub fn failed_before_send(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectFailed { .. }
                | TransportError::NameResolutionFailed { .. }
                | TransportError::HandshakeFailed { .. }
                | TransportError::NoRoute { .. }
        )
    }
}

/// Sends requests to physical replica addresses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` to the replica at `uri`.
    ///
    /// Success statuses and statuses that carry a valid replica answer
    /// (`304`, `404`, `409`, `412`) come back as `Ok`; everything else is an
    /// [`TransportError::Application`].
    async fn send(
        &self,
        uri: &Url,
        request: &ServiceRequest,
    ) -> Result<StoreResponse, TransportError>;

    /// Close every connection. Later sends fail with [`TransportError::Closed`].
    fn close(&self);

    /// Whether [`Transport::close`] has been called.
    fn is_closed(&self) -> bool;
}
