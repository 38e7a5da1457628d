use std::collections::BTreeMap;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;

use crate::error::ExtendError;
use crate::messaging::envelope::FrameKind;
use crate::messaging::member::Member;
use crate::protocol::negotiation::VersionRequest;
use crate::util::buf_ext::{BufExt, BufMutExt};

/// Type ids of the lifecycle protocol spoken on channel 0: 0-10 for the connection's lifecycle,
///  11-20 for channels.
///
/// `OpenConnectionResponse` has id 0 so that an acceptor can tell a legacy client (which would
///  send a request with that id) from a current one.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum PeerMessageType {
    OpenConnectionResponse = 0,
    OpenConnectionRequest = 1,
    NotifyConnectionClosed = 2,
    PingRequest = 3,
    PingResponse = 4,
    Response = 5,

    OpenChannelRequest = 11,
    OpenChannelResponse = 12,
    AcceptChannelRequest = 13,
    AcceptChannelResponse = 14,
    NotifyChannelClosed = 15,
}

impl PeerMessageType {
    pub const ALL: [PeerMessageType; 11] = [
        PeerMessageType::OpenConnectionResponse,
        PeerMessageType::OpenConnectionRequest,
        PeerMessageType::NotifyConnectionClosed,
        PeerMessageType::PingRequest,
        PeerMessageType::PingResponse,
        PeerMessageType::Response,
        PeerMessageType::OpenChannelRequest,
        PeerMessageType::OpenChannelResponse,
        PeerMessageType::AcceptChannelRequest,
        PeerMessageType::AcceptChannelResponse,
        PeerMessageType::NotifyChannelClosed,
    ];

    pub fn kind(&self) -> FrameKind {
        match self {
            PeerMessageType::OpenConnectionRequest
            | PeerMessageType::PingRequest
            | PeerMessageType::OpenChannelRequest
            | PeerMessageType::AcceptChannelRequest => FrameKind::Request,

            PeerMessageType::OpenConnectionResponse
            | PeerMessageType::PingResponse
            | PeerMessageType::Response
            | PeerMessageType::OpenChannelResponse
            | PeerMessageType::AcceptChannelResponse => FrameKind::Response,

            PeerMessageType::NotifyConnectionClosed
            | PeerMessageType::NotifyChannelClosed => FrameKind::Message,
        }
    }

    /// the type of a successful response to a request of this type
    pub fn response_type(&self) -> PeerMessageType {
        match self {
            PeerMessageType::OpenConnectionRequest => PeerMessageType::OpenConnectionResponse,
            PeerMessageType::PingRequest => PeerMessageType::PingResponse,
            PeerMessageType::OpenChannelRequest => PeerMessageType::OpenChannelResponse,
            PeerMessageType::AcceptChannelRequest => PeerMessageType::AcceptChannelResponse,
            _ => PeerMessageType::Response,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PeerMessage {
    OpenConnectionRequest(OpenConnectionRequestData),
    OpenConnectionResponse(OpenConnectionResponseData),
    NotifyConnectionClosed(NotifyConnectionClosedData),
    PingRequest,
    PingResponse,
    /// generic successful response without payload
    Response,
    OpenChannelRequest(OpenChannelRequestData),
    OpenChannelResponse(OpenChannelResponseData),
    AcceptChannelRequest(AcceptChannelRequestData),
    AcceptChannelResponse,
    NotifyChannelClosed(NotifyChannelClosedData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpenConnectionRequestData {
    /// process id of the initiator
    pub client_id: Uuid,
    pub identity_token: Option<Bytes>,
    pub member: Option<Member>,
    pub protocol_versions: BTreeMap<String, VersionRequest>,
    /// set for connections from a service in one cluster to a service in another cluster
    pub cluster_name: Option<String>,
    pub service_name: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpenConnectionResponseData {
    pub connection_id: Uuid,
    /// process id of the acceptor
    pub peer_id: Uuid,
    pub version_overrides: Option<BTreeMap<String, u32>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NotifyConnectionClosedData {
    pub cause: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpenChannelRequestData {
    pub protocol_name: String,
    /// name under which the receiver is registered on the remote peer
    pub receiver_name: String,
    pub identity_token: Option<Bytes>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpenChannelResponseData {
    pub channel_id: i32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AcceptChannelRequestData {
    pub channel_id: i32,
    pub protocol_name: String,
    pub identity_token: Option<Bytes>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NotifyChannelClosedData {
    pub channel_id: i32,
    pub cause: Option<String>,
}

impl PeerMessage {
    pub fn message_type(&self) -> PeerMessageType {
        match self {
            PeerMessage::OpenConnectionRequest(_) => PeerMessageType::OpenConnectionRequest,
            PeerMessage::OpenConnectionResponse(_) => PeerMessageType::OpenConnectionResponse,
            PeerMessage::NotifyConnectionClosed(_) => PeerMessageType::NotifyConnectionClosed,
            PeerMessage::PingRequest => PeerMessageType::PingRequest,
            PeerMessage::PingResponse => PeerMessageType::PingResponse,
            PeerMessage::Response => PeerMessageType::Response,
            PeerMessage::OpenChannelRequest(_) => PeerMessageType::OpenChannelRequest,
            PeerMessage::OpenChannelResponse(_) => PeerMessageType::OpenChannelResponse,
            PeerMessage::AcceptChannelRequest(_) => PeerMessageType::AcceptChannelRequest,
            PeerMessage::AcceptChannelResponse => PeerMessageType::AcceptChannelResponse,
            PeerMessage::NotifyChannelClosed(_) => PeerMessageType::NotifyChannelClosed,
        }
    }

    pub fn type_id(&self) -> i32 {
        self.message_type().into()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            PeerMessage::OpenConnectionRequest(data) => Self::ser_open_connection_request(data, buf),
            PeerMessage::OpenConnectionResponse(data) => Self::ser_open_connection_response(data, buf),
            PeerMessage::NotifyConnectionClosed(data) => buf.put_opt_string(data.cause.as_deref()),
            PeerMessage::PingRequest | PeerMessage::PingResponse | PeerMessage::Response | PeerMessage::AcceptChannelResponse => {}
            PeerMessage::OpenChannelRequest(data) => {
                buf.put_string(&data.protocol_name);
                buf.put_string(&data.receiver_name);
                buf.put_opt_len_prefixed(data.identity_token.as_deref());
            }
            PeerMessage::OpenChannelResponse(data) => buf.put_i32_varint(data.channel_id),
            PeerMessage::AcceptChannelRequest(data) => {
                buf.put_i32_varint(data.channel_id);
                buf.put_string(&data.protocol_name);
                buf.put_opt_len_prefixed(data.identity_token.as_deref());
            }
            PeerMessage::NotifyChannelClosed(data) => {
                buf.put_i32_varint(data.channel_id);
                buf.put_opt_string(data.cause.as_deref());
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    fn ser_open_connection_request(data: &OpenConnectionRequestData, buf: &mut BytesMut) {
        buf.put_uuid(&data.client_id);
        buf.put_opt_len_prefixed(data.identity_token.as_deref());
        buf.put_presence(data.member.is_some());
        if let Some(member) = &data.member {
            member.ser(buf);
        }
        buf.put_usize_varint(data.protocol_versions.len());
        for (name, request) in &data.protocol_versions {
            buf.put_string(name);
            request.ser(buf);
        }
        buf.put_opt_string(data.cluster_name.as_deref());
        buf.put_opt_string(data.service_name.as_deref());
    }

    fn ser_open_connection_response(data: &OpenConnectionResponseData, buf: &mut BytesMut) {
        buf.put_uuid(&data.connection_id);
        buf.put_uuid(&data.peer_id);
        buf.put_presence(data.version_overrides.is_some());
        if let Some(overrides) = &data.version_overrides {
            buf.put_usize_varint(overrides.len());
            for (name, version) in overrides {
                buf.put_string(name);
                buf.put_u32_varint(*version);
            }
        }
    }

    pub fn deser(type_id: i32, mut buf: Bytes) -> anyhow::Result<PeerMessage> {
        let message_type = PeerMessageType::try_from(type_id)
            .map_err(|_| anyhow!("unknown lifecycle message type {}", type_id))?;

        let result = match message_type {
            PeerMessageType::OpenConnectionRequest => Self::deser_open_connection_request(&mut buf)?,
            PeerMessageType::OpenConnectionResponse => Self::deser_open_connection_response(&mut buf)?,
            PeerMessageType::NotifyConnectionClosed => PeerMessage::NotifyConnectionClosed(NotifyConnectionClosedData {
                cause: buf.try_get_opt_string()?,
            }),
            PeerMessageType::PingRequest => PeerMessage::PingRequest,
            PeerMessageType::PingResponse => PeerMessage::PingResponse,
            PeerMessageType::Response => PeerMessage::Response,
            PeerMessageType::OpenChannelRequest => PeerMessage::OpenChannelRequest(OpenChannelRequestData {
                protocol_name: buf.try_get_string()?,
                receiver_name: buf.try_get_string()?,
                identity_token: buf.try_get_opt_len_prefixed()?,
            }),
            PeerMessageType::OpenChannelResponse => PeerMessage::OpenChannelResponse(OpenChannelResponseData {
                channel_id: buf.try_get_i32_varint()?,
            }),
            PeerMessageType::AcceptChannelRequest => PeerMessage::AcceptChannelRequest(AcceptChannelRequestData {
                channel_id: buf.try_get_i32_varint()?,
                protocol_name: buf.try_get_string()?,
                identity_token: buf.try_get_opt_len_prefixed()?,
            }),
            PeerMessageType::AcceptChannelResponse => PeerMessage::AcceptChannelResponse,
            PeerMessageType::NotifyChannelClosed => PeerMessage::NotifyChannelClosed(NotifyChannelClosedData {
                channel_id: buf.try_get_i32_varint()?,
                cause: buf.try_get_opt_string()?,
            }),
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after {:?}", buf.remaining(), message_type);
        }
        Ok(result)
    }

    fn deser_open_connection_request(buf: &mut Bytes) -> anyhow::Result<PeerMessage> {
        let client_id = buf.try_get_uuid()?;
        let identity_token = buf.try_get_opt_len_prefixed()?;
        let member = if buf.try_get_presence()? {
            Some(Member::try_deser(buf)?)
        }
        else {
            None
        };

        let num_versions = buf.try_get_usize_varint()?;
        let mut protocol_versions = BTreeMap::new();
        for _ in 0..num_versions {
            let name = buf.try_get_string()?;
            let request = VersionRequest::try_deser(buf)?;
            protocol_versions.insert(name, request);
        }

        Ok(PeerMessage::OpenConnectionRequest(OpenConnectionRequestData {
            client_id,
            identity_token,
            member,
            protocol_versions,
            cluster_name: buf.try_get_opt_string()?,
            service_name: buf.try_get_opt_string()?,
        }))
    }

    fn deser_open_connection_response(buf: &mut Bytes) -> anyhow::Result<PeerMessage> {
        let connection_id = buf.try_get_uuid()?;
        let peer_id = buf.try_get_uuid()?;
        let version_overrides = if buf.try_get_presence()? {
            let len = buf.try_get_usize_varint()?;
            let mut overrides = BTreeMap::new();
            for _ in 0..len {
                let name = buf.try_get_string()?;
                overrides.insert(name, buf.try_get_u32_varint()?);
            }
            Some(overrides)
        }
        else {
            None
        };

        Ok(PeerMessage::OpenConnectionResponse(OpenConnectionResponseData {
            connection_id,
            peer_id,
            version_overrides,
        }))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RemoteErrorKind {
    Generic = 0,
    Connection = 1,
    UnsupportedProtocol = 2,
    ProtocolNegotiation = 3,
}

/// The failure payload of a response. Only sanitized information goes into it: security
///  failures are reported as a plain rejection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    /// the protocol a negotiation failure refers to
    pub protocol: Option<String>,
}

impl RemoteError {
    pub fn generic(message: impl Into<String>) -> RemoteError {
        RemoteError {
            kind: RemoteErrorKind::Generic,
            message: message.into(),
            protocol: None,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind.into());
        buf.put_string(&self.message);
        buf.put_opt_string(self.protocol.as_deref());
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RemoteError> {
        let kind = RemoteErrorKind::try_from(buf.try_get_u8()?)?;
        let message = buf.try_get_string()?;
        let protocol = buf.try_get_opt_string()?;
        Ok(RemoteError { kind, message, protocol })
    }

    pub fn into_error(self) -> ExtendError {
        match self.kind {
            RemoteErrorKind::Generic => ExtendError::RequestFailed { message: self.message },
            RemoteErrorKind::Connection => ExtendError::Connection { message: self.message },
            RemoteErrorKind::UnsupportedProtocol => ExtendError::UnsupportedProtocol { protocol: self.message },
            RemoteErrorKind::ProtocolNegotiation => ExtendError::ProtocolNegotiation {
                protocol: self.protocol.unwrap_or_default(),
                message: self.message,
            },
        }
    }
}

impl From<&ExtendError> for RemoteError {
    fn from(value: &ExtendError) -> Self {
        match value {
            ExtendError::Security { .. } => RemoteError {
                kind: RemoteErrorKind::Connection,
                message: "connection rejected".to_string(),
                protocol: None,
            },
            ExtendError::Connection { message } => RemoteError {
                kind: RemoteErrorKind::Connection,
                message: message.clone(),
                protocol: None,
            },
            ExtendError::UnsupportedProtocol { protocol } => RemoteError {
                kind: RemoteErrorKind::UnsupportedProtocol,
                message: protocol.clone(),
                protocol: None,
            },
            ExtendError::ProtocolNegotiation { protocol, message } => RemoteError {
                kind: RemoteErrorKind::ProtocolNegotiation,
                message: message.clone(),
                protocol: Some(protocol.clone()),
            },
            other => RemoteError::generic(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use PeerMessage::*;

    fn open_connection_request() -> PeerMessage {
        OpenConnectionRequest(OpenConnectionRequestData {
            client_id: Uuid::from_u128(1),
            identity_token: Some(Bytes::from_static(b"token")),
            member: Some(Member::named("client")),
            protocol_versions: [
                ("cache".to_string(), VersionRequest::Range { current: 3, supported: 1 }),
                ("legacy".to_string(), VersionRequest::Strict(2)),
            ].into_iter().collect(),
            cluster_name: None,
            service_name: Some("remote".to_string()),
        })
    }

    #[rstest]
    #[case::open_connection_request(open_connection_request(), PeerMessageType::OpenConnectionRequest)]
    #[case::open_connection_response_no_overrides(OpenConnectionResponse(OpenConnectionResponseData { connection_id: Uuid::from_u128(2), peer_id: Uuid::from_u128(3), version_overrides: None }), PeerMessageType::OpenConnectionResponse)]
    #[case::open_connection_response_overrides(OpenConnectionResponse(OpenConnectionResponseData { connection_id: Uuid::from_u128(2), peer_id: Uuid::from_u128(3), version_overrides: Some([("cache".to_string(), 2)].into_iter().collect()) }), PeerMessageType::OpenConnectionResponse)]
    #[case::notify_connection_closed(NotifyConnectionClosed(NotifyConnectionClosedData { cause: Some("bye".to_string()) }), PeerMessageType::NotifyConnectionClosed)]
    #[case::ping_request(PingRequest, PeerMessageType::PingRequest)]
    #[case::open_channel_request(OpenChannelRequest(OpenChannelRequestData { protocol_name: "cache".to_string(), receiver_name: "cache-service".to_string(), identity_token: None }), PeerMessageType::OpenChannelRequest)]
    #[case::open_channel_response(OpenChannelResponse(OpenChannelResponseData { channel_id: -17 }), PeerMessageType::OpenChannelResponse)]
    #[case::accept_channel_request(AcceptChannelRequest(AcceptChannelRequestData { channel_id: 5, protocol_name: "cache".to_string(), identity_token: Some(Bytes::from_static(b"t")) }), PeerMessageType::AcceptChannelRequest)]
    #[case::notify_channel_closed(NotifyChannelClosed(NotifyChannelClosedData { channel_id: 5, cause: None }), PeerMessageType::NotifyChannelClosed)]
    fn test_ser_deser(#[case] msg: PeerMessage, #[case] message_type: PeerMessageType) {
        assert_eq!(msg.message_type(), message_type);

        let deser = PeerMessage::deser(msg.type_id(), msg.to_bytes()).unwrap();
        assert_eq!(deser, msg);
    }

    #[test]
    fn test_absent_overrides_differ_from_empty() {
        let absent = OpenConnectionResponse(OpenConnectionResponseData { connection_id: Uuid::nil(), peer_id: Uuid::nil(), version_overrides: None });
        let empty = OpenConnectionResponse(OpenConnectionResponseData { connection_id: Uuid::nil(), peer_id: Uuid::nil(), version_overrides: Some(BTreeMap::new()) });
        assert_ne!(absent.to_bytes(), empty.to_bytes());
        assert_eq!(PeerMessage::deser(0, empty.to_bytes()).unwrap(), empty);
    }

    #[rstest]
    #[case::unknown_type(99, b"")]
    #[case::internal_type(-1, b"")]
    #[case::trailing_bytes(3, b"x")]
    #[case::truncated(12, b"")]
    fn test_deser_invalid(#[case] type_id: i32, #[case] body: &'static [u8]) {
        assert!(PeerMessage::deser(type_id, Bytes::from_static(body)).is_err());
    }

    #[rstest]
    #[case::open_connection(PeerMessageType::OpenConnectionRequest, FrameKind::Request, PeerMessageType::OpenConnectionResponse)]
    #[case::ping(PeerMessageType::PingRequest, FrameKind::Request, PeerMessageType::PingResponse)]
    #[case::notify(PeerMessageType::NotifyChannelClosed, FrameKind::Message, PeerMessageType::Response)]
    fn test_kinds(#[case] message_type: PeerMessageType, #[case] kind: FrameKind, #[case] response_type: PeerMessageType) {
        assert_eq!(message_type.kind(), kind);
        assert_eq!(message_type.response_type(), response_type);
    }

    #[rstest]
    #[case::security(ExtendError::security("token signature mismatch for user scott"), RemoteErrorKind::Connection, "connection rejected")]
    #[case::rejected(ExtendError::rejected(), RemoteErrorKind::Connection, "connection rejected")]
    #[case::unsupported(ExtendError::unsupported_protocol("cache"), RemoteErrorKind::UnsupportedProtocol, "cache")]
    #[case::generic(ExtendError::illegal_argument("x"), RemoteErrorKind::Generic, "illegal argument: x")]
    fn test_remote_error_is_sanitized(#[case] error: ExtendError, #[case] kind: RemoteErrorKind, #[case] message: &str) {
        let remote = RemoteError::from(&error);
        assert_eq!(remote.kind, kind);
        assert_eq!(remote.message, message);

        let deser = RemoteError::try_deser(&mut remote.to_bytes()).unwrap();
        assert_eq!(deser, remote);
    }

    #[test]
    fn test_remote_error_keeps_classification() {
        let negotiation = ExtendError::ProtocolNegotiation { protocol: "cache".to_string(), message: "no overlap".to_string() };
        let deser = RemoteError::try_deser(&mut RemoteError::from(&negotiation).to_bytes()).unwrap();
        assert_eq!(deser.into_error(), negotiation);
        assert_eq!(negotiation.to_string(), "could not negotiate protocol cache: no overlap");
        assert!(RemoteError::from(&ExtendError::security("x")).into_error().is_rejection());
    }
}
