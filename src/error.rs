use std::time::Duration;

/// Errors surfaced to callers of connection, channel and request APIs.
///
/// Timeouts, rejections and negotiation mismatches are separate variants so that calling code can
///  decide whether to retry, reconfigure or give up.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ExtendError {
    #[error("unsupported protocol: {protocol}")]
    UnsupportedProtocol { protocol: String },

    #[error("could not negotiate protocol {protocol}: {message}")]
    ProtocolNegotiation { protocol: String, message: String },

    /// Never sent over the wire - the remote side only ever sees a generic [ExtendError::Connection]
    #[error("security violation: {message}")]
    Security { message: String },

    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("request {request_id} timed out after {timeout:?}")]
    RequestTimeout { request_id: i64, timeout: Duration },

    #[error("request failed remotely: {message}")]
    RequestFailed { message: String },

    #[error("channel {channel_id} is closed")]
    ChannelClosed { channel_id: i32 },

    #[error("service {service} is not running")]
    ServiceNotRunning { service: String },

    #[error("illegal argument: {message}")]
    IllegalArgument { message: String },

    #[error("transport error: {message}")]
    Transport { message: String },
}

impl ExtendError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into() }
    }

    pub fn rejected() -> Self {
        Self::connection("connection rejected")
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::Security { message: message.into() }
    }

    pub fn illegal_argument(message: impl Into<String>) -> Self {
        Self::IllegalArgument { message: message.into() }
    }

    pub fn unsupported_protocol(protocol: impl Into<String>) -> Self {
        Self::UnsupportedProtocol { protocol: protocol.into() }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }

    /// The remote peer (or a local filter / admission check) refused the connection
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Security { .. })
    }

    pub fn is_negotiation_failure(&self) -> bool {
        matches!(self, Self::UnsupportedProtocol { .. } | Self::ProtocolNegotiation { .. })
    }
}

impl From<anyhow::Error> for ExtendError {
    fn from(value: anyhow::Error) -> Self {
        if let Some(e) = value.downcast_ref::<ExtendError>() {
            return e.clone();
        }
        ExtendError::Transport { message: format!("{:#}", value) }
    }
}

pub type ExtendResult<T> = Result<T, ExtendError>;
