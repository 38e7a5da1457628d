use std::collections::BTreeMap;

use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use tracing::debug;

use crate::error::ExtendError;
use crate::protocol::{MessageFactoryMap, Protocol, ProtocolRegistry};

const TAG_STRICT: u8 = 0;
const TAG_RANGE: u8 = 1;

/// The version(s) of a protocol an initiator asks for
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VersionRequest {
    /// exactly this version - sent by old clients that do not negotiate
    Strict(u32),
    Range {
        current: u32,
        supported: u32,
    },
}

impl VersionRequest {
    /// the version the requester would use if the acceptor agreed
    pub fn proposed(&self) -> u32 {
        match self {
            VersionRequest::Strict(v) => *v,
            VersionRequest::Range { current, .. } => *current,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            VersionRequest::Strict(v) => {
                buf.put_u8(TAG_STRICT);
                buf.put_u32_varint(*v);
            }
            VersionRequest::Range { current, supported } => {
                buf.put_u8(TAG_RANGE);
                buf.put_u32_varint(*current);
                buf.put_u32_varint(*supported);
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<VersionRequest> {
        match buf.try_get_u8()? {
            TAG_STRICT => Ok(VersionRequest::Strict(buf.try_get_u32_varint()?)),
            TAG_RANGE => {
                let current = buf.try_get_u32_varint()?;
                let supported = buf.try_get_u32_varint()?;
                Ok(VersionRequest::Range { current, supported })
            }
            tag => bail!("invalid version request tag {}", tag),
        }
    }
}

/// Picks the version to use for a single protocol: the lower of both sides' current versions,
///  provided both sides still support it.
pub fn negotiate_version(protocol: &dyn Protocol, request: VersionRequest) -> Result<u32, ExtendError> {
    match request {
        VersionRequest::Strict(version) => Ok(version),
        VersionRequest::Range { current, supported } => {
            let version = current.min(protocol.current_version());
            if version < supported || version < protocol.supported_version() {
                return Err(ExtendError::ProtocolNegotiation {
                    protocol: protocol.name().to_string(),
                    message: format!(
                        "requested versions [{}, {}], supported versions [{}, {}]",
                        supported, current, protocol.supported_version(), protocol.current_version()
                    ),
                });
            }
            Ok(version)
        }
    }
}

#[derive(Debug)]
pub struct Negotiated {
    pub factories: MessageFactoryMap,
    /// `None` if every protocol was agreed at the version the requester proposed. This is
    ///  deliberately distinct from `Some(empty map)` on the wire.
    pub overrides: Option<BTreeMap<String, u32>>,
}

/// Negotiates all requested protocols as a single step: either every protocol resolves to a
///  message factory, or the whole negotiation fails.
pub fn negotiate_protocols(registry: &ProtocolRegistry, requested: &BTreeMap<String, VersionRequest>) -> Result<Negotiated, ExtendError> {
    let mut factories = MessageFactoryMap::default();
    let mut overrides = BTreeMap::new();

    for (name, request) in requested {
        let protocol = registry.get(name)
            .ok_or_else(|| ExtendError::unsupported_protocol(name))?;

        let version = negotiate_version(protocol.as_ref(), *request)?;
        if version != request.proposed() {
            debug!("protocol {}: downgrading from requested version {} to {}", name, request.proposed(), version);
            overrides.insert(name.clone(), version);
        }
        factories.insert(name.clone(), protocol.message_factory(version)?);
    }

    Ok(Negotiated {
        factories,
        overrides: if overrides.is_empty() { None } else { Some(overrides) },
    })
}

/// The initiator's side of the handshake: every local protocol at its current version, except
///  where the acceptor asked for a downgrade.
pub fn resolve_factories(registry: &ProtocolRegistry, overrides: Option<&BTreeMap<String, u32>>) -> Result<MessageFactoryMap, ExtendError> {
    let mut factories = MessageFactoryMap::default();

    if let Some(overrides) = overrides {
        for (name, version) in overrides {
            let protocol = registry.get(name)
                .ok_or_else(|| ExtendError::unsupported_protocol(name))?;
            factories.insert(name.clone(), protocol.message_factory(*version)?);
        }
    }

    for name in registry.names() {
        if factories.contains_key(&name) {
            continue;
        }
        if let Some(protocol) = registry.get(&name) {
            let factory = protocol.message_factory(protocol.current_version())?;
            factories.insert(name, factory);
        }
    }

    Ok(factories)
}

/// convenience for diagnostics: `name -> version` for an installed factory map
pub fn versions_of(factories: &MessageFactoryMap) -> BTreeMap<String, u32> {
    factories.iter()
        .map(|(name, f)| (name.clone(), f.version()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SimpleProtocol, LIFECYCLE_PROTOCOL_NAME};
    use bytes::BytesMut;
    use rstest::rstest;
    use std::sync::Arc;

    fn registry(current: u32, supported: u32) -> ProtocolRegistry {
        ProtocolRegistry::new(vec![Arc::new(SimpleProtocol::new("cache", current, supported))])
    }

    fn request(current: u32, supported: u32) -> BTreeMap<String, VersionRequest> {
        [("cache".to_string(), VersionRequest::Range { current, supported })].into_iter().collect()
    }

    #[test]
    fn test_downgrade_is_reported_as_override() {
        let negotiated = negotiate_protocols(&registry(2, 1), &request(3, 1)).unwrap();

        assert_eq!(negotiated.overrides, Some([("cache".to_string(), 2)].into_iter().collect()));
        assert_eq!(versions_of(&negotiated.factories), [("cache".to_string(), 2)].into_iter().collect());
    }

    #[test]
    fn test_incompatible_ranges() {
        let result = negotiate_protocols(&registry(2, 1), &request(3, 3));
        match result {
            Err(ExtendError::ProtocolNegotiation { protocol, .. }) => assert_eq!(protocol, "cache"),
            other => panic!("expected negotiation failure, was {:?}", other),
        }
    }

    #[test]
    fn test_no_overrides_is_absent_not_empty() {
        let negotiated = negotiate_protocols(&registry(3, 1), &request(3, 1)).unwrap();
        assert_eq!(negotiated.overrides, None);
    }

    #[test]
    fn test_unknown_protocol_fails_everything() {
        let mut requested = request(3, 1);
        requested.insert("unknown".to_string(), VersionRequest::Range { current: 1, supported: 1 });

        let result = negotiate_protocols(&registry(3, 1), &requested);
        assert_eq!(result.err(), Some(ExtendError::unsupported_protocol("unknown")));
    }

    #[rstest]
    #[case::within_range(2, Ok(None))]
    #[case::outside_range(5, Err(()))]
    fn test_strict_version_used_as_is(#[case] version: u32, #[case] expected: Result<Option<u32>, ()>) {
        let requested = [("cache".to_string(), VersionRequest::Strict(version))].into_iter().collect();
        let result = negotiate_protocols(&registry(3, 1), &requested);
        match expected {
            Ok(overrides) => {
                let negotiated = result.unwrap();
                assert_eq!(negotiated.overrides.and_then(|o| o.get("cache").copied()), overrides);
                assert_eq!(negotiated.factories.get("cache").unwrap().version(), version);
            }
            Err(_) => assert!(result.is_err()),
        }
    }

    /// exhaustive check over a small grid: the agreed version is the lower current version, and
    ///  negotiation fails exactly when that is below either side's minimum
    #[test]
    fn test_negotiate_version_property() {
        for req_current in 1..=5u32 {
            for req_supported in 1..=req_current {
                for local_current in 1..=5u32 {
                    for local_supported in 1..=local_current {
                        let protocol = SimpleProtocol::new("p", local_current, local_supported);
                        let result = negotiate_version(&protocol, VersionRequest::Range { current: req_current, supported: req_supported });

                        let expected = req_current.min(local_current);
                        let should_fail = expected < req_supported || expected < local_supported;
                        match result {
                            Ok(v) => {
                                assert!(!should_fail);
                                assert_eq!(v, expected);
                            }
                            Err(e) => {
                                assert!(should_fail);
                                assert!(e.is_negotiation_failure());
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_resolve_factories_applies_overrides() {
        let registry = ProtocolRegistry::new(vec![
            Arc::new(SimpleProtocol::new("cache", 3, 1)),
            Arc::new(SimpleProtocol::new("events", 2, 1)),
        ]);
        let overrides = [("cache".to_string(), 2)].into_iter().collect();

        let factories = resolve_factories(&registry, Some(&overrides)).unwrap();
        let versions = versions_of(&factories);
        assert_eq!(versions.get("cache"), Some(&2));
        assert_eq!(versions.get("events"), Some(&2));
        assert!(versions.contains_key(LIFECYCLE_PROTOCOL_NAME));
    }

    #[test]
    fn test_handshake_installs_identical_protocol_names() {
        let initiator = ProtocolRegistry::new(vec![
            Arc::new(SimpleProtocol::new("cache", 3, 1)),
            Arc::new(SimpleProtocol::new("events", 1, 1)),
        ]);
        let acceptor = ProtocolRegistry::new(vec![
            Arc::new(SimpleProtocol::new("cache", 2, 1)),
            Arc::new(SimpleProtocol::new("events", 4, 1)),
            Arc::new(SimpleProtocol::new("admin", 1, 1)),
        ]);

        let negotiated = negotiate_protocols(&acceptor, &initiator.requested_versions()).unwrap();
        let resolved = resolve_factories(&initiator, negotiated.overrides.as_ref()).unwrap();

        assert_eq!(
            versions_of(&negotiated.factories).into_keys().collect::<Vec<_>>(),
            versions_of(&resolved).into_keys().collect::<Vec<_>>(),
        );
        assert_eq!(versions_of(&negotiated.factories), versions_of(&resolved));
    }

    #[rstest]
    #[case::strict(VersionRequest::Strict(7), vec![0, 7])]
    #[case::range(VersionRequest::Range { current: 3, supported: 1 }, vec![1, 3, 1])]
    fn test_version_request_wire_format(#[case] request: VersionRequest, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        request.ser(&mut buf);
        assert_eq!(&buf, &expected);
        assert_eq!(VersionRequest::try_deser(&mut buf.freeze()).unwrap(), request);
    }
}
