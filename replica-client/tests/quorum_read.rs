//! Reads at each consistency level against scripted replicas.

mod common;

use std::time::Duration;

use common::*;
use replica_client::{
    ClientConfig, ConsistencyLevel, QuorumConfig, QuorumReader, ReplicaError, ResolvedReplicas,
    RetryConfig, StatusCode, SubStatus,
};
use tokio::time::Instant;
use url::Url;

const P: &str = "rntbd://replica-1:14000/p/0/r/1p/";
const S1: &str = "rntbd://replica-2:14000/p/0/r/2s/";
const S2: &str = "rntbd://replica-3:14000/p/0/r/3s/";
const S3: &str = "rntbd://replica-4:14000/p/0/r/4s/";

fn url(uri: &str) -> Url {
    Url::parse(uri).expect("valid url")
}

fn replicas(primary: &str, secondaries: &[&str]) -> ResolvedReplicas {
    let mut all = vec![url(primary)];
    all.extend(secondaries.iter().map(|uri| url(uri)));
    ResolvedReplicas {
        primary: Some(url(primary)),
        all,
    }
}

fn quorum_reader(transport: std::sync::Arc<ScriptedTransport>) -> QuorumReader {
    QuorumReader::new(transport, QuorumConfig::default(), Duration::from_secs(10))
}

#[tokio::test(start_paused = true)]
async fn test_strong_read_does_not_wait_for_slow_replica() {
    let h = harness(
        ClientConfig::default(),
        vec![address_set(&[(P, true), (S1, false), (S2, false), (S3, false)])],
        4,
        ConsistencyLevel::Strong,
    );
    for uri in [P, S1, S2, S3] {
        h.transport.always(uri, ok(10));
    }
    h.transport.delay(S3, Duration::from_secs(5));

    let start = Instant::now();
    let response = h.client.invoke(read()).await.expect("strong read should succeed");
    assert_eq!(response.lsn, 10);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(h.transport.calls_to(P), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_quorum_fails_gone_after_barrier_rounds() {
    init_tracing();
    let transport = ScriptedTransport::new();
    transport.always(P, ok(10));
    transport.always(S1, refused());
    transport.always(S2, refused());

    let reader = quorum_reader(transport.clone());
    let mut request = read();
    let err = reader
        .read(&mut request, &replicas(P, &[S1, S2]), 3, true)
        .await
        .expect_err("one vote is not a quorum");

    assert!(matches!(err, ReplicaError::Gone { .. }), "{err}");
    // initial round plus two barrier rounds
    assert_eq!(transport.calls_to(P), 3);
    assert_eq!(transport.calls_to(S1), 3);
}

#[tokio::test]
async fn test_too_few_replicas_for_quorum() {
    let transport = ScriptedTransport::new();
    let reader = quorum_reader(transport.clone());
    let mut request = read();

    let err = reader
        .read(&mut request, &replicas(P, &[S1]), 4, false)
        .await
        .expect_err("two of four replicas cannot form a quorum");
    assert!(matches!(err, ReplicaError::Gone { .. }), "{err}");
    assert!(transport.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_strong_read_waits_for_global_commit() {
    init_tracing();
    let transport = ScriptedTransport::new();
    transport.script(P, [ok_committed(12, 12)]);
    transport.always(P, ok_committed(12, 12));
    for uri in [S1, S2] {
        // secondaries catch up between rounds
        transport.script(uri, [ok_committed(10, 10)]);
        transport.always(uri, ok_committed(12, 12));
    }

    let reader = quorum_reader(transport.clone());
    let mut request = read();
    let response = reader
        .read(&mut request, &replicas(P, &[S1, S2]), 3, true)
        .await
        .expect("barrier round should select");

    assert_eq!(response.lsn, 12);
    assert_eq!(request.context.quorum_selected_lsn, Some(12));
    assert_eq!(request.context.global_committed_selected_lsn, Some(12));
    assert_eq!(transport.calls_to(P), 2);
}

#[tokio::test]
async fn test_bounded_staleness_selects_majority_lsn() {
    let h = harness(
        ClientConfig::default(),
        vec![address_set(&[(P, true), (S1, false), (S2, false)])],
        3,
        ConsistencyLevel::BoundedStaleness,
    );
    h.transport.always(P, ok(8));
    h.transport.always(S1, ok(7));
    h.transport.always(S2, ok(7));

    let response = h.client.invoke(read()).await.expect("bounded read should succeed");
    assert_eq!(response.lsn, 7);
}

#[tokio::test]
async fn test_unavailable_replica_is_a_missing_vote() {
    let h = harness(
        ClientConfig::default(),
        vec![address_set(&[(P, true), (S1, false), (S2, false)])],
        3,
        ConsistencyLevel::BoundedStaleness,
    );
    h.transport.always(P, ok(10));
    h.transport.always(S1, failure(StatusCode::SERVICE_UNAVAILABLE, SubStatus::NONE));
    h.transport.always(S2, ok(10));

    let response = h.client.invoke(read()).await.expect("two votes form a quorum");
    assert_eq!(response.lsn, 10);
    assert_eq!(h.resolver.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_quorum_of_timed_out_replicas_fails_gone() {
    let transport = ScriptedTransport::new();
    transport.always(P, ok(10));
    transport.always(S1, failure(StatusCode::REQUEST_TIMEOUT, SubStatus::NONE));
    transport.always(S2, failure(StatusCode::SERVICE_UNAVAILABLE, SubStatus::NONE));

    let reader = quorum_reader(transport.clone());
    let mut request = read();
    let err = reader
        .read(&mut request, &replicas(P, &[S1, S2]), 3, false)
        .await
        .expect_err("one vote is not a quorum");
    assert!(matches!(err, ReplicaError::Gone { .. }), "{err}");
    assert_eq!(transport.calls_to(S1), 3);
}

#[tokio::test(start_paused = true)]
async fn test_session_read_retries_until_replica_catches_up() {
    let h = harness(
        ClientConfig::default(),
        vec![address_set(&[(P, true), (S1, false), (S2, false)])],
        3,
        ConsistencyLevel::Session,
    );
    for uri in [P, S1, S2] {
        h.transport.script(uri, [ok(15)]);
        h.transport.always(uri, ok(20));
    }

    let start = Instant::now();
    let response = h
        .client
        .invoke(read().with_session_lsn(20))
        .await
        .expect("session read should succeed once caught up");

    assert_eq!(response.lsn, 20);
    // every replica lagged once, then one answer sufficed
    assert_eq!(h.transport.calls().len(), 4);
    assert_eq!(start.elapsed(), Duration::from_millis(10));
    assert_eq!(h.resolver.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_session_read_gives_up_after_budget() {
    let config = ClientConfig::default()
        .with_retry(RetryConfig::default().with_retry_with_budget(Duration::from_millis(200)));
    let h = harness(
        config,
        vec![address_set(&[(P, true), (S1, false)])],
        2,
        ConsistencyLevel::Session,
    );
    h.transport.always(P, ok(3));
    h.transport.always(S1, ok(4));

    let err = h
        .client
        .invoke(read().with_session_lsn(9))
        .await
        .expect_err("replicas never reach the session");
    match err {
        ReplicaError::ServiceUnavailable { diagnostics, .. } => {
            assert!(diagnostics.attempts > 1);
            assert!(diagnostics.elapsed <= Duration::from_millis(200));
            let last = diagnostics.last_error.expect("last error should be kept");
            assert!(last.contains("session"), "{last}");
        }
        other => panic!("expected ServiceUnavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn test_eventual_read_fails_over() {
    let h = harness(
        ClientConfig::default(),
        vec![address_set(&[(P, true), (S1, false), (S2, false)])],
        3,
        ConsistencyLevel::Eventual,
    );
    h.transport.always(P, refused());
    h.transport.always(S1, refused());
    h.transport.always(S2, ok(4));

    let response = h.client.invoke(read()).await.expect("eventual read should fail over");
    assert_eq!(response.lsn, 4);
    assert_eq!(h.transport.calls_to(S2), 1);
    assert!(h.transport.calls().len() <= 3);
    assert_eq!(h.resolver.calls(), 1);
}

#[tokio::test]
async fn test_eventual_read_fails_over_unavailable_replicas() {
    let h = harness(
        ClientConfig::default(),
        vec![address_set(&[(P, true), (S1, false), (S2, false)])],
        3,
        ConsistencyLevel::Eventual,
    );
    h.transport.always(P, failure(StatusCode::SERVICE_UNAVAILABLE, SubStatus::NONE));
    h.transport.always(S1, failure(StatusCode::REQUEST_TIMEOUT, SubStatus::NONE));
    h.transport.always(S2, ok(4));

    let response = h.client.invoke(read()).await.expect("eventual read should fail over");
    assert_eq!(response.lsn, 4);
    assert_eq!(h.transport.calls_to(S2), 1);
}

#[tokio::test]
async fn test_eventual_read_every_replica_unavailable() {
    let h = harness(
        ClientConfig::default(),
        vec![address_set(&[(P, true), (S1, false)])],
        2,
        ConsistencyLevel::Eventual,
    );
    h.transport.always(P, failure(StatusCode::SERVICE_UNAVAILABLE, SubStatus::NONE));
    h.transport.always(S1, failure(StatusCode::SERVICE_UNAVAILABLE, SubStatus::NONE));

    let err = h.client.invoke(read()).await.expect_err("no replica can serve");
    assert!(matches!(err, ReplicaError::ServiceUnavailable { .. }), "{err}");
    assert_eq!(h.transport.calls().len(), 2);
}

#[tokio::test]
async fn test_replica_index_targets_one_replica() {
    let h = harness(
        ClientConfig::default(),
        vec![address_set(&[(P, true), (S1, false), (S2, false)])],
        3,
        ConsistencyLevel::Eventual,
    );
    for uri in [P, S1, S2] {
        h.transport.always(uri, ok(6));
    }

    h.client
        .invoke(read().with_replica_index(2))
        .await
        .expect("indexed read should succeed");
    assert_eq!(h.transport.calls(), vec![S2.to_string()]);
}
