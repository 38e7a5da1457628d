use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::error::ExtendError;
use crate::messaging::member::Member;

/// Connection state changes, emitted from the peer's service task
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    Opened(ConnectionOpenedData),
    /// a regular close, initiated by either side
    Closed(ConnectionClosedData),
    /// a connection was closed because of an error, e.g. a ping timeout or a failed handshake
    Error(ConnectionErrorData),
    ChannelOpened(ChannelEventData),
    ChannelClosed(ChannelEventData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionOpenedData {
    pub connection_id: Uuid,
    pub peer_id: Uuid,
    pub member: Option<Member>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionClosedData {
    /// `None` for connections that were closed before completing the handshake
    pub connection_id: Option<Uuid>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionErrorData {
    pub connection_id: Option<Uuid>,
    pub error: ExtendError,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelEventData {
    pub connection_id: Option<Uuid>,
    pub channel_id: i32,
    pub protocol_name: String,
}

pub struct ConnectionEventNotifier {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl Default for ConnectionEventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionEventNotifier {
    pub fn new() -> ConnectionEventNotifier {
        let (sender, _) = broadcast::channel(128);

        ConnectionEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ConnectionEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
