use bytes::Bytes;

/// A message on an application channel. The body is opaque to the connection layer; its
///  interpretation is up to the channel's protocol.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelMessage {
    pub type_id: i32,
    pub body: Bytes,
}

impl ChannelMessage {
    pub fn new(type_id: i32, body: impl Into<Bytes>) -> ChannelMessage {
        ChannelMessage {
            type_id,
            body: body.into(),
        }
    }
}
