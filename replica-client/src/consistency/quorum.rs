//! Quorum reads.
//!
//! A round reads the primary, then fans out to the secondaries. Each
//! secondary call runs in its own task and reports on a channel; the round
//! stops consuming as soon as the responses gathered so far select an LSN,
//! and dropping the round cancels the calls still in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::address::ResolvedReplicas;
use crate::config::QuorumConfig;
use crate::consistency::{call_replica, quorum_size};
use crate::error::ReplicaError;
use crate::request::{ServiceRequest, StoreResponse};
use crate::transport::Transport;

/// A successful answer from one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaResponse {
    /// Replica address.
    pub uri: Url,
    /// Its answer.
    pub response: StoreResponse,
    /// Whether the replica is the primary.
    pub is_primary: bool,
}

/// Pick the response a quorum agrees on.
///
/// Candidate LSNs are tried highest first; the first one that at least
/// `quorum` responses have reached (their LSN is greater or equal) wins,
/// served by a response at exactly that LSN, the primary's when it has one.
/// With `required_lsn`, a winner below it means no selection.
pub fn select_quorum(
    responses: &[ReplicaResponse],
    quorum: usize,
    required_lsn: Option<i64>,
) -> Option<&ReplicaResponse> {
    if quorum == 0 || responses.len() < quorum {
        return None;
    }

    let mut candidates: Vec<i64> = responses.iter().map(|r| r.response.lsn).collect();
    candidates.sort_unstable_by(|a, b| b.cmp(a));
    candidates.dedup();

    for candidate in candidates {
        let votes = responses.iter().filter(|r| r.response.lsn >= candidate).count();
        if votes < quorum {
            continue;
        }
        if required_lsn.is_some_and(|required| candidate < required) {
            return None;
        }
        return responses
            .iter()
            .filter(|r| r.response.lsn == candidate)
            .max_by_key(|r| r.is_primary);
    }
    None
}

/// Reads confirmed by a majority of the replica set.
pub struct QuorumReader {
    transport: Arc<dyn Transport>,
    config: QuorumConfig,
    call_timeout: Duration,
}

impl QuorumReader {
    /// Create a reader issuing calls through `transport`.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: QuorumConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            config,
            call_timeout,
        }
    }

    /// Read with quorum confirmation. `strong` additionally requires the
    /// selected LSN to reach the highest global committed LSN observed.
    ///
    /// Fails as Gone when fewer replicas are resolved than the quorum needs
    /// or when no round selects an LSN.
    pub async fn read(
        &self,
        request: &mut ServiceRequest,
        replicas: &ResolvedReplicas,
        replica_set_size: usize,
        strong: bool,
    ) -> Result<StoreResponse, ReplicaError> {
        let quorum = quorum_size(replica_set_size);
        let uris = || replicas.all.iter().map(Url::to_string).collect::<Vec<_>>();
        if replicas.all.len() < quorum {
            return Err(ReplicaError::gone(
                format!(
                    "{} replicas resolved but a quorum of {quorum} is needed",
                    replicas.all.len()
                ),
                uris(),
            ));
        }

        let rounds = self.config.barrier_retries + 1;
        for round in 0..rounds {
            if round > 0 {
                tokio::time::sleep(self.config.barrier_delay).await;
            }
            if let Some(selected) = self
                .read_round(request, replicas, replica_set_size, quorum, strong)
                .await?
            {
                return Ok(selected);
            }
            debug!(
                request = request.id(),
                round,
                quorum,
                last_lsn = ?request.context.last_observed_lsn,
                "quorum not selected"
            );
        }

        Err(ReplicaError::gone(
            format!("no quorum of {quorum} reached after {rounds} rounds"),
            uris(),
        ))
    }

    async fn read_round(
        &self,
        request: &mut ServiceRequest,
        replicas: &ResolvedReplicas,
        replica_set_size: usize,
        quorum: usize,
        strong: bool,
    ) -> Result<Option<StoreResponse>, ReplicaError> {
        let snapshot = Arc::new(request.clone());
        let mut responses = Vec::with_capacity(replica_set_size);

        if let Some(primary) = &replicas.primary {
            let result =
                call_replica(self.transport.as_ref(), primary, &snapshot, self.call_timeout).await;
            fold(request, &mut responses, primary.clone(), result, true)?;
            if let Some(selected) = try_select(request, &responses, quorum, strong) {
                return Ok(Some(selected));
            }
        }

        let limit = replica_set_size.saturating_sub(usize::from(replicas.primary.is_some()));
        let secondaries: Vec<Url> = replicas.secondaries().take(limit).cloned().collect();
        if secondaries.is_empty() {
            return Ok(None);
        }

        let token = CancellationToken::new();
        let _abandon = token.clone().drop_guard();
        let (tx, mut rx) = mpsc::channel(secondaries.len());

        for uri in secondaries {
            let tx = tx.clone();
            let token = token.clone();
            let transport = self.transport.clone();
            let snapshot = snapshot.clone();
            let call_timeout = self.call_timeout;
            tokio::spawn(async move {
                let result = tokio::select! {
                    _ = token.cancelled() => return,
                    result = call_replica(transport.as_ref(), &uri, &snapshot, call_timeout) => {
                        result
                    }
                };
                if token.is_cancelled() {
                    return;
                }
                let _ = tx.send((uri, result)).await;
            });
        }
        drop(tx);

        while let Some((uri, result)) = rx.recv().await {
            fold(request, &mut responses, uri, result, false)?;
            if let Some(selected) = try_select(request, &responses, quorum, strong) {
                return Ok(Some(selected));
            }
        }
        Ok(None)
    }
}

/// Add one call's outcome to the round. Replica-local failures are missing
/// votes; anything else ends the read.
fn fold(
    request: &mut ServiceRequest,
    responses: &mut Vec<ReplicaResponse>,
    uri: Url,
    result: Result<StoreResponse, ReplicaError>,
    is_primary: bool,
) -> Result<(), ReplicaError> {
    match result {
        Ok(response) => {
            request.context.observe(&response);
            responses.push(ReplicaResponse {
                uri,
                response,
                is_primary,
            });
            Ok(())
        }
        Err(err) if err.is_replica_local() => {
            debug!(request = request.id(), uri = %uri, error = %err, "replica missing from quorum");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn try_select(
    request: &mut ServiceRequest,
    responses: &[ReplicaResponse],
    quorum: usize,
    strong: bool,
) -> Option<StoreResponse> {
    let required = if strong {
        responses
            .iter()
            .filter_map(|r| r.response.global_committed_lsn)
            .max()
    } else {
        None
    };
    let selected = select_quorum(responses, quorum, required)?;

    request.context.quorum_selected_lsn = Some(selected.response.lsn);
    request.context.global_committed_selected_lsn =
        required.or(selected.response.global_committed_lsn);
    debug!(
        request = request.id(),
        lsn = selected.response.lsn,
        uri = %selected.uri,
        votes = responses.len(),
        quorum,
        "quorum selected"
    );
    Some(selected.response.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;

    fn response(host: &str, lsn: i64, is_primary: bool) -> ReplicaResponse {
        ReplicaResponse {
            uri: Url::parse(&format!("rntbd://{host}:1/")).expect("valid url"),
            response: StoreResponse::new(StatusCode::OK, lsn),
            is_primary,
        }
    }

    #[test]
    fn test_highest_lsn_with_quorum_wins() {
        let responses = vec![
            response("p", 10, true),
            response("s1", 9, false),
            response("s2", 8, false),
        ];
        let selected = select_quorum(&responses, 2, None).expect("quorum should be selected");
        assert_eq!(selected.response.lsn, 9);
        assert_eq!(selected.uri.host_str(), Some("s1"));
    }

    #[test]
    fn test_primary_preferred_on_ties() {
        let responses = vec![
            response("s1", 10, false),
            response("p", 10, true),
            response("s2", 10, false),
        ];
        let selected = select_quorum(&responses, 2, None).expect("quorum should be selected");
        assert!(selected.is_primary);
    }

    #[test]
    fn test_not_enough_votes() {
        let responses = vec![response("p", 10, true)];
        assert!(select_quorum(&responses, 2, None).is_none());
    }

    #[test]
    fn test_required_lsn_blocks_selection() {
        let responses = vec![
            response("p", 12, true),
            response("s1", 9, false),
            response("s2", 8, false),
        ];
        assert!(select_quorum(&responses, 2, Some(10)).is_none());
        assert_eq!(
            select_quorum(&responses, 2, Some(9)).map(|r| r.response.lsn),
            Some(9)
        );
    }
}
