//! Replica selection over resolved addresses.

use std::sync::Arc;

use tracing::debug;
use url::Url;

use crate::address::{AddressCache, PartitionAddressSet, Protocol};
use crate::error::ReplicaError;
use crate::request::ServiceRequest;
use crate::routing::PartitionKeyRangeIdentity;

/// Pick the replica a primary-targeted request goes to.
///
/// With `replica_index`, returns that position of the protocol-filtered view
/// whatever its primary flag. Otherwise returns the view's single primary.
/// Never falls back to an arbitrary replica: a missing primary is Gone.
pub fn select_primary(
    addresses: &PartitionAddressSet,
    protocol: Protocol,
    replica_index: Option<usize>,
) -> Result<Url, ReplicaError> {
    let view = addresses.for_protocol(protocol);
    if view.is_empty() {
        return Err(ReplicaError::gone(
            format!("no {protocol} replica addresses returned"),
            addresses.uris(),
        ));
    }

    if let Some(index) = replica_index {
        return view.get(index).map(|a| a.uri().clone()).ok_or_else(|| {
            ReplicaError::gone(
                format!(
                    "replica index {index} out of range for {} {protocol} replicas",
                    view.len()
                ),
                view.uris(),
            )
        });
    }

    match view.primary() {
        Some(primary) => Ok(primary.uri().clone()),
        None => {
            let candidates = view.uris();
            Err(ReplicaError::gone(
                format!("no primary among {protocol} replicas [{}]", candidates.join(", ")),
                candidates,
            ))
        }
    }
}

/// URIs of the protocol-filtered view in resolver order. With
/// `include_all` false, only the primary (if any) is returned.
pub fn select_all(
    addresses: &PartitionAddressSet,
    protocol: Protocol,
    include_all: bool,
) -> Vec<Url> {
    addresses
        .for_protocol(protocol)
        .iter()
        .filter(|a| include_all || a.is_primary_replica())
        .map(|a| a.uri().clone())
        .collect()
}

/// Replicas resolved for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReplicas {
    /// The primary, when the partition currently has one.
    pub primary: Option<Url>,
    /// Every matching replica in resolver order, the primary included.
    pub all: Vec<Url>,
}

impl ResolvedReplicas {
    /// Every replica except the primary.
    pub fn secondaries(&self) -> impl Iterator<Item = &Url> {
        self.all
            .iter()
            .filter(move |uri| self.primary.as_ref() != Some(*uri))
    }
}

/// Resolves requests to replica URIs through the [`AddressCache`].
pub struct ReplicaSelector {
    cache: Arc<AddressCache>,
    protocol: Protocol,
}

impl ReplicaSelector {
    /// Create a selector for `protocol`.
    pub fn new(cache: Arc<AddressCache>, protocol: Protocol) -> Self {
        Self { cache, protocol }
    }

    /// Protocol replicas are selected for.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The shared address cache.
    pub fn cache(&self) -> &Arc<AddressCache> {
        &self.cache
    }

    /// Primary (or explicitly indexed) replica for `request`.
    pub async fn resolve_primary(
        &self,
        request: &ServiceRequest,
        partition: &PartitionKeyRangeIdentity,
        force_refresh: bool,
    ) -> Result<Url, ReplicaError> {
        let addresses = self
            .cache
            .resolve(request.service_endpoint(), partition, force_refresh)
            .await?;
        let uri = select_primary(&addresses, self.protocol, request.replica_index())?;
        debug!(request = request.id(), partition = %partition, uri = %uri, "selected primary");
        Ok(uri)
    }

    /// Every replica serving `partition`. With `require_primary`, a partition
    /// without a primary is Gone.
    pub async fn resolve_replicas(
        &self,
        request: &ServiceRequest,
        partition: &PartitionKeyRangeIdentity,
        require_primary: bool,
        force_refresh: bool,
    ) -> Result<ResolvedReplicas, ReplicaError> {
        let addresses = self
            .cache
            .resolve(request.service_endpoint(), partition, force_refresh)
            .await?;
        let all = select_all(&addresses, self.protocol, true);
        if all.is_empty() {
            return Err(ReplicaError::gone(
                format!("no {} replica addresses returned", self.protocol),
                addresses.uris(),
            ));
        }

        let primary = if require_primary {
            Some(select_primary(&addresses, self.protocol, None)?)
        } else {
            select_all(&addresses, self.protocol, false).into_iter().next()
        };
        Ok(ResolvedReplicas { primary, all })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ReplicaAddress;
    use crate::error::FailureClass;

    fn addr(uri: &str, primary: bool) -> ReplicaAddress {
        ReplicaAddress::parse(uri, primary, true).expect("parse should succeed")
    }

    fn mixed_set() -> PartitionAddressSet {
        PartitionAddressSet::new(vec![
            addr("rntbd://a:1/", true),
            addr("rntbd://b:1/", false),
            addr("https://c:1/", false),
            addr("https://d:1/", true),
        ])
        .expect("set should build")
    }

    #[test]
    fn test_primary_for_protocol() {
        let set = mixed_set();
        let tcp = select_primary(&set, Protocol::Tcp, None).expect("select should succeed");
        assert_eq!(tcp.as_str(), "rntbd://a:1/");
        let https = select_primary(&set, Protocol::Https, None).expect("select should succeed");
        assert_eq!(https.as_str(), "https://d:1/");
    }

    #[test]
    fn test_no_matching_protocol_is_gone() {
        let set =
            PartitionAddressSet::new(vec![addr("https://c:1/", true)]).expect("set should build");
        let err = select_primary(&set, Protocol::Tcp, None).expect_err("no tcp replicas");
        assert_eq!(err.class(), FailureClass::Gone);
    }

    #[test]
    fn test_missing_primary_enumerates_candidates() {
        let set = PartitionAddressSet::new(vec![
            addr("rntbd://x:1/", false),
            addr("rntbd://y:1/", false),
        ])
        .expect("set should build");
        let err = select_primary(&set, Protocol::Tcp, None).expect_err("no primary");
        assert_eq!(err.class(), FailureClass::Gone);
        let message = err.to_string();
        assert!(message.contains("rntbd://x:1/"), "{message}");
        assert!(message.contains("rntbd://y:1/"), "{message}");
    }

    #[test]
    fn test_explicit_index_ignores_primary_flag() {
        let set = mixed_set();
        let uri = select_primary(&set, Protocol::Tcp, Some(1)).expect("select should succeed");
        assert_eq!(uri.as_str(), "rntbd://b:1/");
        let uri = select_primary(&set, Protocol::Https, Some(0)).expect("select should succeed");
        assert_eq!(uri.as_str(), "https://c:1/");

        let err = select_primary(&set, Protocol::Https, Some(2)).expect_err("index out of range");
        assert_eq!(err.class(), FailureClass::Gone);
    }

    #[test]
    fn test_select_all_preserves_order() {
        let set = mixed_set();
        let https: Vec<String> = select_all(&set, Protocol::Https, true)
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(https, vec!["https://c:1/", "https://d:1/"]);

        let primaries = select_all(&set, Protocol::Https, false);
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].as_str(), "https://d:1/");
    }

    #[test]
    fn test_secondaries_exclude_primary() {
        let set = mixed_set();
        let primary = select_primary(&set, Protocol::Tcp, None).expect("select should succeed");
        let resolved = ResolvedReplicas {
            primary: Some(primary),
            all: select_all(&set, Protocol::Tcp, true),
        };
        let secondaries: Vec<&str> = resolved.secondaries().map(Url::as_str).collect();
        assert_eq!(secondaries, vec!["rntbd://b:1/"]);
    }
}
