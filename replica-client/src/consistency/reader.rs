//! Read dispatch by consistency mode.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::debug;
use url::Url;

use crate::address::ResolvedReplicas;
use crate::config::ClientConfig;
use crate::consistency::{call_replica, QuorumReader, ReadMode};
use crate::error::ReplicaError;
use crate::request::{ServiceRequest, StoreResponse};
use crate::transport::Transport;

/// Serves reads at the mode's consistency guarantee.
pub struct ConsistencyReader {
    transport: Arc<dyn Transport>,
    quorum: QuorumReader,
    call_timeout: Duration,
}

impl ConsistencyReader {
    /// Create a reader.
    pub fn new(transport: Arc<dyn Transport>, config: &ClientConfig) -> Self {
        Self {
            quorum: QuorumReader::new(
                transport.clone(),
                config.quorum.clone(),
                config.replica_call_timeout,
            ),
            transport,
            call_timeout: config.replica_call_timeout,
        }
    }

    /// Read `request` from `replicas` in `mode`.
    pub async fn read(
        &self,
        request: &mut ServiceRequest,
        replicas: &ResolvedReplicas,
        mode: ReadMode,
        replica_set_size: usize,
    ) -> Result<StoreResponse, ReplicaError> {
        match mode {
            ReadMode::Primary => self.read_primary(request, replicas).await,
            ReadMode::Strong => self.quorum.read(request, replicas, replica_set_size, true).await,
            ReadMode::BoundedStaleness => {
                self.quorum
                    .read(request, replicas, replica_set_size, false)
                    .await
            }
            ReadMode::Session => self.read_session(request, replicas).await,
            ReadMode::Any => self.read_any(request, replicas).await,
        }
    }

    async fn read_primary(
        &self,
        request: &mut ServiceRequest,
        replicas: &ResolvedReplicas,
    ) -> Result<StoreResponse, ReplicaError> {
        let Some(primary) = &replicas.primary else {
            return Err(ReplicaError::gone(
                "no primary to read from",
                replicas.all.iter().map(Url::to_string).collect(),
            ));
        };
        let response =
            call_replica(self.transport.as_ref(), primary, request, self.call_timeout).await?;
        request.context.observe(&response);
        Ok(response)
    }

    /// First replica, in random order, whose LSN has reached the session LSN.
    async fn read_session(
        &self,
        request: &mut ServiceRequest,
        replicas: &ResolvedReplicas,
    ) -> Result<StoreResponse, ReplicaError> {
        let session_lsn = request.session_lsn();
        let mut best_lsn = None;
        let mut lagging = false;
        let mut last_error = None;

        for uri in shuffled(replicas) {
            match call_replica(self.transport.as_ref(), &uri, request, self.call_timeout).await {
                Ok(response) => {
                    request.context.observe(&response);
                    if session_lsn.map_or(true, |required| response.lsn >= required) {
                        return Ok(response);
                    }
                    debug!(
                        request = request.id(),
                        uri = %uri,
                        lsn = response.lsn,
                        session_lsn = ?session_lsn,
                        "replica behind session"
                    );
                    best_lsn = best_lsn.max(Some(response.lsn));
                    lagging = true;
                }
                Err(ReplicaError::SessionNotAvailable { .. }) => lagging = true,
                Err(err) if err.is_replica_local() => last_error = Some(err),
                Err(err) => return Err(err),
            }
        }

        if lagging {
            return Err(ReplicaError::SessionNotAvailable {
                session_lsn,
                best_lsn,
            });
        }
        Err(exhausted(replicas, last_error))
    }

    /// Any replica, failing over on replica-local errors.
    async fn read_any(
        &self,
        request: &mut ServiceRequest,
        replicas: &ResolvedReplicas,
    ) -> Result<StoreResponse, ReplicaError> {
        let mut last_error = None;
        for uri in shuffled(replicas) {
            match call_replica(self.transport.as_ref(), &uri, request, self.call_timeout).await {
                Ok(response) => {
                    request.context.observe(&response);
                    return Ok(response);
                }
                Err(err) if err.is_replica_local() => {
                    debug!(
                        request = request.id(),
                        uri = %uri,
                        error = %err,
                        "failing over to next replica"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(exhausted(replicas, last_error))
    }
}

fn shuffled(replicas: &ResolvedReplicas) -> Vec<Url> {
    let mut uris = replicas.all.clone();
    uris.shuffle(&mut rand::thread_rng());
    uris
}

fn exhausted(replicas: &ResolvedReplicas, last_error: Option<ReplicaError>) -> ReplicaError {
    last_error.unwrap_or_else(|| {
        ReplicaError::gone(
            "no replica answered",
            replicas.all.iter().map(Url::to_string).collect(),
        )
    })
}
