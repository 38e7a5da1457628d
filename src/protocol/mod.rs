//! Protocols and their versioned message factories.
//!
//! A [Protocol] is identified by name and supports a contiguous range of versions. For each
//!  connection, peers agree on one version per protocol (see [negotiation]), and the connection
//!  holds a [MessageFactory] for that version which its channels use to validate message types.

pub mod negotiation;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::ExtendError;
use crate::protocol::negotiation::VersionRequest;

/// name of the protocol spoken on channel 0 of every connection
pub const LIFECYCLE_PROTOCOL_NAME: &str = "ExtendLifecycle";
pub const LIFECYCLE_PROTOCOL_CURRENT_VERSION: u32 = 1;
pub const LIFECYCLE_PROTOCOL_SUPPORTED_VERSION: u32 = 1;

pub trait MessageFactory: Debug + Send + Sync {
    fn protocol_name(&self) -> &str;
    fn version(&self) -> u32;

    /// Returns `true` if messages with the given type id exist in this version of the protocol
    fn is_known_type(&self, type_id: i32) -> bool;
}

pub trait Protocol: Debug + Send + Sync {
    fn name(&self) -> &str;
    fn current_version(&self) -> u32;
    /// the oldest version this protocol can still talk
    fn supported_version(&self) -> u32;

    fn message_factory(&self, version: u32) -> Result<Arc<dyn MessageFactory>, ExtendError>;
}

pub type MessageFactoryMap = FxHashMap<String, Arc<dyn MessageFactory>>;

/// A [Protocol] defined by a version range and a table of message type ids, each tagged with
///  the protocol version that introduced it.
#[derive(Debug, Clone)]
pub struct SimpleProtocol {
    name: String,
    current_version: u32,
    supported_version: u32,
    /// type id -> version that introduced it. Empty means 'all type ids are valid'.
    message_types: BTreeMap<i32, u32>,
}

impl SimpleProtocol {
    pub fn new(name: impl Into<String>, current_version: u32, supported_version: u32) -> SimpleProtocol {
        assert!(supported_version <= current_version, "supported version must not exceed current version");
        SimpleProtocol {
            name: name.into(),
            current_version,
            supported_version,
            message_types: BTreeMap::new(),
        }
    }

    pub fn with_message_type(mut self, type_id: i32, since_version: u32) -> SimpleProtocol {
        self.message_types.insert(type_id, since_version);
        self
    }
}

impl Protocol for SimpleProtocol {
    fn name(&self) -> &str {
        &self.name
    }

    fn current_version(&self) -> u32 {
        self.current_version
    }

    fn supported_version(&self) -> u32 {
        self.supported_version
    }

    fn message_factory(&self, version: u32) -> Result<Arc<dyn MessageFactory>, ExtendError> {
        if version < self.supported_version || version > self.current_version {
            return Err(ExtendError::ProtocolNegotiation {
                protocol: self.name.clone(),
                message: format!("version {} is outside the supported range [{}, {}]", version, self.supported_version, self.current_version),
            });
        }

        let message_types = self.message_types.iter()
            .filter(|(_, since)| **since <= version)
            .map(|(&type_id, _)| type_id)
            .collect();

        Ok(Arc::new(SimpleMessageFactory {
            protocol_name: self.name.clone(),
            version,
            restrict_types: !self.message_types.is_empty(),
            message_types,
        }))
    }
}

#[derive(Debug)]
struct SimpleMessageFactory {
    protocol_name: String,
    version: u32,
    restrict_types: bool,
    message_types: Vec<i32>,
}

impl MessageFactory for SimpleMessageFactory {
    fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn is_known_type(&self, type_id: i32) -> bool {
        !self.restrict_types || self.message_types.contains(&type_id)
    }
}

/// The protocols a peer supports, keyed by name. The table is built once when the peer is created
///  and shared read-only by all its connections. The lifecycle protocol is always present.
#[derive(Debug)]
pub struct ProtocolRegistry {
    protocols: FxHashMap<String, Arc<dyn Protocol>>,
}

impl ProtocolRegistry {
    pub fn new(protocols: Vec<Arc<dyn Protocol>>) -> ProtocolRegistry {
        let mut map: FxHashMap<String, Arc<dyn Protocol>> = FxHashMap::default();
        map.insert(LIFECYCLE_PROTOCOL_NAME.to_string(), Arc::new(lifecycle_protocol()));
        for p in protocols {
            map.insert(p.name().to_string(), p);
        }
        ProtocolRegistry {
            protocols: map,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Protocol>> {
        self.protocols.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut result = self.protocols.keys().cloned().collect::<Vec<_>>();
        result.sort();
        result
    }

    /// the version map an initiator sends: every protocol with its full version range
    pub fn requested_versions(&self) -> BTreeMap<String, VersionRequest> {
        self.protocols.values()
            .map(|p| (p.name().to_string(), VersionRequest::Range {
                current: p.current_version(),
                supported: p.supported_version(),
            }))
            .collect()
    }

    pub fn lifecycle_factory(&self) -> Result<Arc<dyn MessageFactory>, ExtendError> {
        self.get(LIFECYCLE_PROTOCOL_NAME)
            .ok_or_else(|| ExtendError::unsupported_protocol(LIFECYCLE_PROTOCOL_NAME))?
            .message_factory(LIFECYCLE_PROTOCOL_CURRENT_VERSION)
    }
}

fn lifecycle_protocol() -> SimpleProtocol {
    use crate::messaging::peer_messages::PeerMessageType;

    PeerMessageType::ALL.iter()
        .fold(
            SimpleProtocol::new(LIFECYCLE_PROTOCOL_NAME, LIFECYCLE_PROTOCOL_CURRENT_VERSION, LIFECYCLE_PROTOCOL_SUPPORTED_VERSION),
            |p, t| p.with_message_type((*t).into(), 1),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::below(1, false)]
    #[case::lowest(2, true)]
    #[case::highest(4, true)]
    #[case::above(5, false)]
    fn test_message_factory_version_range(#[case] version: u32, #[case] expected_ok: bool) {
        let protocol = SimpleProtocol::new("cache", 4, 2);
        let result = protocol.message_factory(version);
        assert_eq!(result.is_ok(), expected_ok);
        if let Ok(factory) = result {
            assert_eq!(factory.version(), version);
            assert_eq!(factory.protocol_name(), "cache");
        }
    }

    #[rstest]
    #[case::v1_old_type(1, 10, true)]
    #[case::v1_new_type(1, 11, false)]
    #[case::v2_new_type(2, 11, true)]
    #[case::unknown(2, 99, false)]
    fn test_known_types_by_version(#[case] version: u32, #[case] type_id: i32, #[case] expected: bool) {
        let protocol = SimpleProtocol::new("cache", 2, 1)
            .with_message_type(10, 1)
            .with_message_type(11, 2);
        assert_eq!(protocol.message_factory(version).unwrap().is_known_type(type_id), expected);
    }

    #[test]
    fn test_unrestricted_types() {
        let factory = SimpleProtocol::new("raw", 1, 1).message_factory(1).unwrap();
        assert!(factory.is_known_type(12345));
    }

    #[test]
    fn test_registry_always_contains_lifecycle() {
        let registry = ProtocolRegistry::new(vec![Arc::new(SimpleProtocol::new("cache", 3, 1))]);
        assert_eq!(registry.names(), vec!["ExtendLifecycle".to_string(), "cache".to_string()]);
        assert_eq!(registry.requested_versions().get("cache"), Some(&VersionRequest::Range { current: 3, supported: 1 }));
        assert_eq!(registry.lifecycle_factory().unwrap().protocol_name(), LIFECYCLE_PROTOCOL_NAME);
    }
}
