//! Replica address model.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ReplicaError;

/// Protocols replicas listen on. Each maps to exactly one URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Binary TCP protocol, `rntbd://`.
    Tcp,
    /// HTTPS, `https://`.
    Https,
}

impl Protocol {
    /// URI scheme for this protocol.
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Tcp => "rntbd",
            Protocol::Https => "https",
        }
    }

    /// Protocol for a URI scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "rntbd" => Some(Protocol::Tcp),
            "https" => Some(Protocol::Https),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Errors building the address model from resolver output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// The address is not a valid URI.
    #[error("invalid replica uri {uri}: {reason}")]
    InvalidUri {
        /// Offending input.
        uri: String,
        /// Parser message.
        reason: String,
    },

    /// The URI scheme matches no known protocol.
    #[error("unsupported scheme {scheme} in {uri}")]
    UnsupportedScheme {
        /// Offending scheme.
        scheme: String,
        /// Offending URI.
        uri: String,
    },

    /// More than one replica claims to be primary for a protocol.
    #[error("multiple primaries for {protocol}: [{}]", .uris.join(", "))]
    MultiplePrimaries {
        /// Protocol with conflicting primaries.
        protocol: Protocol,
        /// The conflicting URIs.
        uris: Vec<String>,
    },
}

impl From<AddressError> for ReplicaError {
    fn from(err: AddressError) -> Self {
        let addresses = match &err {
            AddressError::InvalidUri { uri, .. } | AddressError::UnsupportedScheme { uri, .. } => {
                vec![uri.clone()]
            }
            AddressError::MultiplePrimaries { uris, .. } => uris.clone(),
        };
        ReplicaError::gone(err.to_string(), addresses)
    }
}

/// One physical replica endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaAddress {
    uri: Url,
    protocol: Protocol,
    is_primary_replica: bool,
    is_primary_protocol: bool,
}

impl ReplicaAddress {
    /// Build an address from a parsed URI; the protocol comes from its scheme.
    pub fn new(
        uri: Url,
        is_primary_replica: bool,
        is_primary_protocol: bool,
    ) -> Result<Self, AddressError> {
        let protocol = Protocol::from_scheme(uri.scheme()).ok_or_else(|| {
            AddressError::UnsupportedScheme {
                scheme: uri.scheme().to_string(),
                uri: uri.to_string(),
            }
        })?;
        Ok(Self {
            uri,
            protocol,
            is_primary_replica,
            is_primary_protocol,
        })
    }

    /// Parse `uri` and build an address.
    pub fn parse(
        uri: &str,
        is_primary_replica: bool,
        is_primary_protocol: bool,
    ) -> Result<Self, AddressError> {
        let parsed = Url::parse(uri).map_err(|e| AddressError::InvalidUri {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        Self::new(parsed, is_primary_replica, is_primary_protocol)
    }

    /// Physical URI.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Protocol, derived from the URI scheme.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Whether this replica is the partition's primary.
    pub fn is_primary_replica(&self) -> bool {
        self.is_primary_replica
    }

    /// Whether this is the replica's preferred protocol.
    pub fn is_primary_protocol(&self) -> bool {
        self.is_primary_protocol
    }
}

/// Every address of one partition, across protocols, in resolver order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionAddressSet {
    addresses: Vec<ReplicaAddress>,
}

impl PartitionAddressSet {
    /// Validate and wrap resolver output. At most one primary per protocol.
    pub fn new(addresses: Vec<ReplicaAddress>) -> Result<Self, AddressError> {
        for protocol in [Protocol::Tcp, Protocol::Https] {
            let primaries: Vec<String> = addresses
                .iter()
                .filter(|a| a.protocol == protocol && a.is_primary_replica)
                .map(|a| a.uri.to_string())
                .collect();
            if primaries.len() > 1 {
                return Err(AddressError::MultiplePrimaries {
                    protocol,
                    uris: primaries,
                });
            }
        }
        Ok(Self { addresses })
    }

    /// All addresses.
    pub fn addresses(&self) -> &[ReplicaAddress] {
        &self.addresses
    }

    /// Number of addresses across protocols.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Project onto one protocol.
    pub fn for_protocol(&self, protocol: Protocol) -> ProtocolAddressView<'_> {
        ProtocolAddressView {
            set: self,
            protocol,
        }
    }

    /// Every URI, rendered, in resolver order.
    pub fn uris(&self) -> Vec<String> {
        self.addresses.iter().map(|a| a.uri.to_string()).collect()
    }
}

/// Read-only projection of a [`PartitionAddressSet`] onto one protocol.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolAddressView<'a> {
    set: &'a PartitionAddressSet,
    protocol: Protocol,
}

impl<'a> ProtocolAddressView<'a> {
    /// Matching addresses in resolver order.
    pub fn iter(&self) -> impl Iterator<Item = &'a ReplicaAddress> + 'a {
        let protocol = self.protocol;
        self.set
            .addresses
            .iter()
            .filter(move |a| a.protocol == protocol)
    }

    /// Address at `index` within the view.
    pub fn get(&self, index: usize) -> Option<&'a ReplicaAddress> {
        self.iter().nth(index)
    }

    /// The protocol's primary, if any.
    pub fn primary(&self) -> Option<&'a ReplicaAddress> {
        self.iter().find(|a| a.is_primary_replica)
    }

    /// Number of matching addresses.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether no address matches.
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Protocol of the view.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Matching URIs, rendered.
    pub fn uris(&self) -> Vec<String> {
        self.iter().map(|a| a.uri.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_from_scheme() {
        let tcp = ReplicaAddress::parse("rntbd://host:1/p/1", false, true)
            .expect("parse should succeed");
        assert_eq!(tcp.protocol(), Protocol::Tcp);
        let https = ReplicaAddress::parse("https://host:2/p/1", false, false)
            .expect("parse should succeed");
        assert_eq!(https.protocol(), Protocol::Https);
        assert_eq!(Protocol::from_scheme("http"), None);
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        let err = ReplicaAddress::parse("ftp://host/", false, false)
            .expect_err("ftp is not a protocol");
        assert!(matches!(err, AddressError::UnsupportedScheme { .. }));
    }

    #[test]
    fn test_one_primary_per_protocol() {
        let set = PartitionAddressSet::new(vec![
            ReplicaAddress::parse("rntbd://a:1/", true, true).expect("parse should succeed"),
            ReplicaAddress::parse("https://a:2/", true, false).expect("parse should succeed"),
        ]);
        assert!(set.is_ok());

        let err = PartitionAddressSet::new(vec![
            ReplicaAddress::parse("rntbd://a:1/", true, true).expect("parse should succeed"),
            ReplicaAddress::parse("rntbd://b:1/", true, true).expect("parse should succeed"),
        ])
        .expect_err("two tcp primaries");
        assert!(matches!(err, AddressError::MultiplePrimaries { protocol: Protocol::Tcp, .. }));
    }

    #[test]
    fn test_view_preserves_order() {
        let set = PartitionAddressSet::new(vec![
            ReplicaAddress::parse("https://c:1/", false, false).expect("parse should succeed"),
            ReplicaAddress::parse("rntbd://a:1/", false, true).expect("parse should succeed"),
            ReplicaAddress::parse("https://b:1/", true, false).expect("parse should succeed"),
        ])
        .expect("set should build");
        let view = set.for_protocol(Protocol::Https);
        assert_eq!(view.uris(), vec!["https://c:1/", "https://b:1/"]);
        assert_eq!(view.primary().map(|a| a.uri().as_str()), Some("https://b:1/"));
        assert_eq!(view.len(), 2);
    }
}
