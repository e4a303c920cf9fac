//! Error types for the replica client.
//!
//! Every failure a request can hit is one [`ReplicaError`] variant, and every
//! variant maps to exactly one [`FailureClass`]. The retry policy dispatches
//! on the class only, so adding a variant means deciding its class here.

use std::fmt;
use std::time::Duration;

use url::Url;

use crate::request::OperationType;
use crate::status::{StatusCode, SubStatus};
use crate::transport::TransportError;

/// Classification tag the retry policy dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Resolved addresses are stale; refresh them and retry.
    Gone,
    /// The partition key range is splitting; refresh the routing map.
    PartitionSplitting,
    /// The partition is migrating; refresh the collection routing map.
    PartitionMigrating,
    /// The collection behind the name changed; refresh the collection cache.
    InvalidPartition,
    /// Optimistic concurrency conflict; retry after a short pause.
    RetryWith,
    /// No replica has caught up with the session token yet.
    SessionNotAvailable,
    /// Connection-level failure safe to retry.
    NetworkTransient,
    /// Never retried.
    Permanent,
}

impl FailureClass {
    /// Whether a failure of this class only concerns the replica that
    /// produced it, so a multi-replica read can carry on without it.
    pub fn is_replica_local(self) -> bool {
        matches!(self, FailureClass::Gone | FailureClass::NetworkTransient)
    }
}

/// Context attached to terminal failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDiagnostics {
    /// Attempts made, including the failing one.
    pub attempts: u32,
    /// Physical addresses contacted, in first-contact order.
    pub addresses: Vec<String>,
    /// Highest LSN observed.
    pub last_lsn: Option<i64>,
    /// Highest global committed LSN observed.
    pub last_global_committed_lsn: Option<i64>,
    /// Time spent in the retry loop.
    pub elapsed: Duration,
    /// Rendering of the last error seen before giving up.
    pub last_error: Option<String>,
}

impl fmt::Display for RequestDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempts={} elapsed={:?} addresses=[{}]",
            self.attempts,
            self.elapsed,
            self.addresses.join(", ")
        )?;
        if let Some(lsn) = self.last_lsn {
            write!(f, " lsn={lsn}")?;
        }
        if let Some(lsn) = self.last_global_committed_lsn {
            write!(f, " global_committed_lsn={lsn}")?;
        }
        if let Some(err) = &self.last_error {
            write!(f, " last_error=\"{err}\"")?;
        }
        Ok(())
    }
}

/// Failures surfaced by the replica client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplicaError {
    /// The replica or partition is no longer where the cache says it is.
    #[error("gone: {message} (addresses: [{}])", .addresses.join(", "))]
    Gone {
        /// What was found stale.
        message: String,
        /// Physical addresses involved, for diagnosis.
        addresses: Vec<String>,
    },

    /// The partition key range is splitting.
    #[error("partition key range is splitting: {message}")]
    PartitionSplitting {
        /// Replica-provided details.
        message: String,
    },

    /// The partition is migrating.
    #[error("partition is migrating: {message}")]
    PartitionMigrating {
        /// Replica-provided details.
        message: String,
    },

    /// The partition no longer belongs to the named collection.
    #[error("invalid partition: {message}")]
    InvalidPartition {
        /// Replica-provided details.
        message: String,
    },

    /// Optimistic concurrency conflict.
    #[error("retry with: {message}")]
    RetryWith {
        /// Replica-provided details.
        message: String,
    },

    /// No replica has caught up with the session LSN.
    #[error(
        "read session not available (session lsn {session_lsn:?}, best replica lsn {best_lsn:?})"
    )]
    SessionNotAvailable {
        /// LSN the session requires, when known.
        session_lsn: Option<i64>,
        /// Highest LSN a replica offered.
        best_lsn: Option<i64>,
    },

    /// Transient network failure talking to one replica.
    #[error("transient network failure on {uri}: {source}")]
    NetworkTransient {
        /// Replica address.
        uri: String,
        /// Transport failure.
        #[source]
        source: TransportError,
    },

    /// Failure that retrying cannot fix.
    #[error("request failed with status {status}/{sub_status}: {message}")]
    Permanent {
        /// Status code.
        status: StatusCode,
        /// Sub-status.
        sub_status: SubStatus,
        /// Details.
        message: String,
    },

    /// Retries exhausted or the service reported itself unavailable.
    #[error("service unavailable: {reason} ({diagnostics})")]
    ServiceUnavailable {
        /// Why the request gave up.
        reason: String,
        /// Context for diagnosis.
        diagnostics: Box<RequestDiagnostics>,
    },

    /// The request may or may not have taken effect.
    #[error("request timed out: {reason} ({diagnostics})")]
    RequestTimeout {
        /// What timed out.
        reason: String,
        /// Context for diagnosis.
        diagnostics: Box<RequestDiagnostics>,
    },

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,
}

impl ReplicaError {
    /// Classification used by the retry policy.
    pub fn class(&self) -> FailureClass {
        match self {
            ReplicaError::Gone { .. } => FailureClass::Gone,
            ReplicaError::PartitionSplitting { .. } => FailureClass::PartitionSplitting,
            ReplicaError::PartitionMigrating { .. } => FailureClass::PartitionMigrating,
            ReplicaError::InvalidPartition { .. } => FailureClass::InvalidPartition,
            ReplicaError::RetryWith { .. } => FailureClass::RetryWith,
            ReplicaError::SessionNotAvailable { .. } => FailureClass::SessionNotAvailable,
            ReplicaError::NetworkTransient { .. } => FailureClass::NetworkTransient,
            ReplicaError::Permanent { .. }
            | ReplicaError::ServiceUnavailable { .. }
            | ReplicaError::RequestTimeout { .. }
            | ReplicaError::Cancelled => FailureClass::Permanent,
        }
    }

    /// Whether a multi-replica read can go on without the replica that
    /// produced this error. A replica answering 503 or 408 is one missing
    /// vote; the failure only ends the request when no replica is left.
    pub fn is_replica_local(&self) -> bool {
        self.class().is_replica_local()
            || matches!(
                self,
                ReplicaError::ServiceUnavailable { .. } | ReplicaError::RequestTimeout { .. }
            )
    }

    /// Shorthand for a [`ReplicaError::Gone`].
    pub fn gone(message: impl Into<String>, addresses: Vec<String>) -> Self {
        ReplicaError::Gone {
            message: message.into(),
            addresses,
        }
    }

    /// Shorthand for a terminal [`ReplicaError::ServiceUnavailable`].
    pub fn service_unavailable(reason: impl Into<String>, diagnostics: RequestDiagnostics) -> Self {
        ReplicaError::ServiceUnavailable {
            reason: reason.into(),
            diagnostics: Box::new(diagnostics),
        }
    }

    /// Classify an application status returned by the replica at `uri`.
    pub fn from_status(
        uri: &Url,
        status: StatusCode,
        sub_status: SubStatus,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        match (status, sub_status) {
            (StatusCode::GONE, SubStatus::PARTITION_KEY_RANGE_GONE)
            | (StatusCode::GONE, SubStatus::COMPLETING_SPLIT) => {
                ReplicaError::PartitionSplitting { message }
            }
            (StatusCode::GONE, SubStatus::COMPLETING_PARTITION_MIGRATION) => {
                ReplicaError::PartitionMigrating { message }
            }
            (StatusCode::GONE, SubStatus::NAME_CACHE_STALE) => {
                ReplicaError::InvalidPartition { message }
            }
            (StatusCode::GONE, _) => ReplicaError::Gone {
                message,
                addresses: vec![uri.to_string()],
            },
            (StatusCode::RETRY_WITH, _) => ReplicaError::RetryWith { message },
            (StatusCode::NOT_FOUND, SubStatus::READ_SESSION_NOT_AVAILABLE) => {
                ReplicaError::SessionNotAvailable {
                    session_lsn: None,
                    best_lsn: None,
                }
            }
            (StatusCode::SERVICE_UNAVAILABLE, _) => ReplicaError::ServiceUnavailable {
                reason: format!("{uri} reported unavailable: {message}"),
                diagnostics: Box::default(),
            },
            (StatusCode::REQUEST_TIMEOUT, _) => ReplicaError::RequestTimeout {
                reason: format!("{uri} timed out: {message}"),
                diagnostics: Box::default(),
            },
            _ => ReplicaError::Permanent {
                status,
                sub_status,
                message,
            },
        }
    }

    /// Classify a transport failure for `operation` against `uri`.
    ///
    /// Reads can always be retried after a network failure. A write can only
    /// be retried when the failure happened before any byte left the client;
    /// otherwise the write may have been applied and the outcome is unknown.
    pub fn from_transport(uri: &Url, err: TransportError, operation: OperationType) -> Self {
        match err {
            TransportError::Application {
                status,
                sub_status,
                message,
            } => Self::from_status(uri, status, sub_status, message),
            TransportError::Closed => ReplicaError::ServiceUnavailable {
                reason: format!("transport closed while sending to {uri}"),
                diagnostics: Box::default(),
            },
            err if operation.is_read() || err.failed_before_send() => {
                ReplicaError::NetworkTransient {
                    uri: uri.to_string(),
                    source: err,
                }
            }
            err => ReplicaError::RequestTimeout {
                reason: format!("write outcome unknown after {err} on {uri}"),
                diagnostics: Box::new(RequestDiagnostics {
                    attempts: 1,
                    addresses: vec![uri.to_string()],
                    last_error: Some(err.to_string()),
                    ..RequestDiagnostics::default()
                }),
            },
        }
    }
}
