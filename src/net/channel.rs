use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::error::{ExtendError, ExtendResult};
use crate::messaging::envelope::{Frame, FrameKind};
use crate::messaging::message::ChannelMessage;
use crate::messaging::peer_messages::{NotifyChannelClosedData, PeerMessage, RemoteError};
use crate::net::connection::Connection;
use crate::peer::events::{ChannelEventData, ConnectionEvent};
use crate::peer::identity::Subject;
use crate::protocol::MessageFactory;

/// Handles the messages arriving on a channel. A receiver is bound to one protocol; peers look
///  up receivers by [Receiver::name] when a remote peer opens a channel to them.
#[async_trait]
pub trait Receiver: Send + Sync {
    fn name(&self) -> &str;

    fn protocol_name(&self) -> &str;

    async fn on_message(&self, channel: &Arc<Channel>, message: ChannelMessage);

    async fn on_request(&self, _channel: &Arc<Channel>, _request: ChannelMessage) -> ExtendResult<ChannelMessage> {
        Err(ExtendError::RequestFailed { message: "unsupported request".to_string() })
    }

    async fn on_channel_opened(&self, _channel: &Arc<Channel>) {}

    async fn on_channel_closed(&self, _channel: &Arc<Channel>) {}
}

/// What the peer service has to do when the response to a channel-0 request arrives
pub(crate) enum RequestContext {
    Plain,
    Ping,
    OpenConnection,
    OpenChannel {
        factory: Arc<dyn MessageFactory>,
        receiver: Option<Arc<dyn Receiver>>,
        subject: Option<Subject>,
    },
    AcceptChannel {
        channel_id: i32,
        factory: Arc<dyn MessageFactory>,
        receiver: Option<Arc<dyn Receiver>>,
        subject: Option<Subject>,
    },
}

pub(crate) struct PendingRequest {
    pub completion: oneshot::Sender<ExtendResult<ChannelMessage>>,
    pub context: RequestContext,
}

impl PendingRequest {
    pub fn complete(self, result: ExtendResult<ChannelMessage>) {
        // the requester may have stopped waiting, that is fine
        let _ = self.completion.send(result);
    }
}

/// Outstanding requests of a channel, keyed by request id
pub(crate) struct RequestTable {
    channel_id: i32,
    inner: Mutex<RequestTableInner>,
}

struct RequestTableInner {
    next_id: i64,
    pending: FxHashMap<i64, PendingRequest>,
    closed: bool,
}

impl RequestTable {
    fn new(channel_id: i32) -> RequestTable {
        RequestTable {
            channel_id,
            inner: Mutex::new(RequestTableInner {
                next_id: 1,
                pending: FxHashMap::default(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RequestTableInner> {
        self.inner.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, context: RequestContext) -> ExtendResult<(i64, oneshot::Receiver<ExtendResult<ChannelMessage>>)> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ExtendError::ChannelClosed { channel_id: self.channel_id });
        }

        let request_id = inner.next_id;
        inner.next_id += 1;

        let (completion, response) = oneshot::channel();
        inner.pending.insert(request_id, PendingRequest { completion, context });
        Ok((request_id, response))
    }

    pub fn take(&self, request_id: i64) -> Option<PendingRequest> {
        self.lock().pending.remove(&request_id)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// completes every outstanding request with the error and rejects new ones
    fn close(&self, error: &ExtendError) {
        let pending = {
            let mut inner = self.lock();
            inner.closed = true;
            std::mem::take(&mut inner.pending)
        };
        for (_, request) in pending {
            request.complete(Err(error.clone()));
        }
    }
}

/// A handle for the response to a request. Dropping an unresolved status unregisters the
///  request, so a late response is discarded.
#[must_use]
pub struct Status {
    channel_id: i32,
    request_id: i64,
    requests: Arc<RequestTable>,
    response: Option<oneshot::Receiver<ExtendResult<ChannelMessage>>>,
    default_timeout: Option<Duration>,
}

impl Debug for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Status{{channel:{}, request:{}}}", self.channel_id, self.request_id)
    }
}

impl Status {
    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    /// `None` waits for the channel's default timeout, `Some(Duration::ZERO)` waits forever
    pub async fn wait_for_response(mut self, timeout: Option<Duration>) -> ExtendResult<ChannelMessage> {
        let timeout = match timeout {
            None => self.default_timeout,
            Some(t) if t.is_zero() => None,
            Some(t) => Some(t),
        };

        let channel_id = self.channel_id;
        let Some(response) = self.response.as_mut() else {
            return Err(ExtendError::ChannelClosed { channel_id });
        };

        let result = match timeout {
            None => response.await,
            Some(timeout) => match time::timeout(timeout, response).await {
                Ok(result) => result,
                Err(_) => {
                    self.response = None;
                    self.requests.take(self.request_id);
                    debug!("request {} on channel {} timed out after {:?}", self.request_id, channel_id, timeout);
                    return Err(ExtendError::RequestTimeout { request_id: self.request_id, timeout });
                }
            }
        };
        self.response = None;

        result.unwrap_or(Err(ExtendError::ChannelClosed { channel_id }))
    }

    /// Stops tracking the response without unregistering the request: whoever handles the
    ///  response still finds the request's context.
    pub(crate) fn detach(mut self) {
        self.response = None;
    }
}

impl Drop for Status {
    fn drop(&mut self) {
        if self.response.is_some() {
            self.requests.take(self.request_id);
        }
    }
}

/// Identifies a channel created with [Connection::create_channel] that a remote peer can accept:
///  `channel:<id>#<protocol>`
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ChannelUri {
    pub channel_id: i32,
    pub protocol_name: String,
}

impl Display for ChannelUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel:{}#{}", self.channel_id, self.protocol_name)
    }
}

impl FromStr for ChannelUri {
    type Err = ExtendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ExtendError::illegal_argument(format!("invalid channel URI: {}", s));

        let rest = s.strip_prefix("channel:").ok_or_else(invalid)?;
        let (id, protocol_name) = rest.split_once('#').ok_or_else(invalid)?;
        let channel_id = id.parse::<i32>().map_err(|_| invalid())?;
        if protocol_name.is_empty() {
            return Err(invalid());
        }
        Ok(ChannelUri {
            channel_id,
            protocol_name: protocol_name.to_string(),
        })
    }
}

/// A logical sub-connection of a [Connection], bound to one protocol version and (optionally) one
///  receiver. Channel 0 exists on every connection and carries the lifecycle protocol.
pub struct Channel {
    id: i32,
    connection: Weak<Connection>,
    factory: Arc<dyn MessageFactory>,
    receiver: Option<Arc<dyn Receiver>>,
    subject: RwLock<Option<Subject>>,
    requests: Arc<RequestTable>,
    open: AtomicBool,
    request_timeout: Option<Duration>,
}

impl Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Channel{{id:{}, protocol:{} v{}}}", self.id, self.factory.protocol_name(), self.factory.version())
    }
}

impl Channel {
    pub(crate) fn new(
        id: i32,
        connection: Weak<Connection>,
        factory: Arc<dyn MessageFactory>,
        receiver: Option<Arc<dyn Receiver>>,
        subject: Option<Subject>,
        request_timeout: Option<Duration>,
    ) -> Arc<Channel> {
        Arc::new(Channel {
            id,
            connection,
            factory,
            receiver,
            subject: RwLock::new(subject),
            requests: Arc::new(RequestTable::new(id)),
            open: AtomicBool::new(true),
            request_timeout,
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn protocol_name(&self) -> &str {
        self.factory.protocol_name()
    }

    pub fn message_factory(&self) -> &Arc<dyn MessageFactory> {
        &self.factory
    }

    pub fn receiver(&self) -> Option<&Arc<dyn Receiver>> {
        self.receiver.as_ref()
    }

    pub fn subject(&self) -> Option<Subject> {
        self.subject.read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_subject(&self, subject: Option<Subject>) {
        *self.subject.write()
            .unwrap_or_else(|e| e.into_inner()) = subject;
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn connection(&self) -> ExtendResult<Arc<Connection>> {
        self.connection.upgrade()
            .ok_or(ExtendError::ChannelClosed { channel_id: self.id })
    }

    pub fn outstanding_requests(&self) -> usize {
        self.requests.len()
    }

    fn check_open(&self) -> ExtendResult<()> {
        if self.is_open() {
            Ok(())
        }
        else {
            Err(ExtendError::ChannelClosed { channel_id: self.id })
        }
    }

    fn check_known_type(&self, type_id: i32) -> ExtendResult<()> {
        if self.factory.is_known_type(type_id) {
            Ok(())
        }
        else {
            Err(ExtendError::illegal_argument(format!(
                "message type {} is unknown in protocol {} v{}", type_id, self.factory.protocol_name(), self.factory.version()
            )))
        }
    }

    /// one-way
    pub async fn send(&self, message: ChannelMessage) -> ExtendResult<()> {
        self.check_open()?;
        self.check_known_type(message.type_id)?;
        self.connection()?
            .send_frame(Frame::message(self.id, message.type_id, message.body))
            .await
    }

    pub async fn send_request(&self, request: ChannelMessage) -> ExtendResult<Status> {
        self.send_request_with_context(request.type_id, request.body, RequestContext::Plain).await
    }

    /// sends a request and waits for its response, see [Status::wait_for_response] for the
    ///  meaning of `timeout`
    pub async fn request(&self, request: ChannelMessage, timeout: Option<Duration>) -> ExtendResult<ChannelMessage> {
        self.send_request(request).await?
            .wait_for_response(timeout)
            .await
    }

    pub(crate) async fn send_request_with_context(&self, type_id: i32, body: Bytes, context: RequestContext) -> ExtendResult<Status> {
        self.check_open()?;
        self.check_known_type(type_id)?;
        let connection = self.connection()?;

        let (request_id, response) = self.requests.register(context)?;
        let status = Status {
            channel_id: self.id,
            request_id,
            requests: self.requests.clone(),
            response: Some(response),
            default_timeout: self.request_timeout,
        };

        // on failure, dropping the status unregisters the request
        connection.send_frame(Frame::request(self.id, type_id, request_id, body)).await?;
        Ok(status)
    }

    pub(crate) fn take_request(&self, request_id: i64) -> Option<PendingRequest> {
        self.requests.take(request_id)
    }

    /// decodes the outcome carried by a response frame
    pub(crate) fn response_result(frame: &Frame) -> ExtendResult<ChannelMessage> {
        if frame.failure {
            let error = RemoteError::try_deser(&mut frame.body.clone())
                .map(RemoteError::into_error)
                .unwrap_or_else(|e| ExtendError::RequestFailed { message: format!("malformed failure response: {}", e) });
            Err(error)
        }
        else {
            Ok(ChannelMessage::new(frame.type_id, frame.body.clone()))
        }
    }

    /// completes the request a response frame belongs to. Responses for unknown requests (e.g.
    ///  requests that timed out) are dropped.
    pub(crate) fn complete(&self, frame: Frame) {
        match self.requests.take(frame.request_id) {
            Some(request) => request.complete(Self::response_result(&frame)),
            None => debug!("channel {}: dropping response to unknown request {} - it may have timed out", self.id, frame.request_id),
        }
    }

    /// Dispatches an inbound frame to the receiver. This runs on a daemon pool worker.
    pub(crate) async fn receive(self: &Arc<Self>, frame: Frame) {
        trace!("channel {}: received {:?} of type {}", self.id, frame.kind, frame.type_id);

        match frame.kind {
            FrameKind::Response => self.complete(frame),
            FrameKind::Message => {
                if let Err(e) = self.check_known_type(frame.type_id) {
                    warn!("channel {}: dropping message: {}", self.id, e);
                    return;
                }
                match &self.receiver {
                    Some(receiver) => receiver.on_message(self, ChannelMessage::new(frame.type_id, frame.body)).await,
                    None => debug!("channel {} has no receiver - dropping message of type {}", self.id, frame.type_id),
                }
            }
            FrameKind::Request => {
                let result = match (self.check_known_type(frame.type_id), &self.receiver) {
                    (Err(e), _) => Err(e),
                    (Ok(()), Some(receiver)) => receiver.on_request(self, ChannelMessage::new(frame.type_id, frame.body)).await,
                    (Ok(()), None) => Err(ExtendError::RequestFailed { message: format!("channel {} has no receiver", self.id) }),
                };

                let response = match result {
                    Ok(response) => Frame::response(self.id, response.type_id, frame.request_id, false, response.body),
                    Err(e) => {
                        debug!("channel {}: request {} failed: {}", self.id, frame.request_id, e);
                        Frame::response(self.id, 0, frame.request_id, true, RemoteError::from(&e).to_bytes())
                    }
                };

                match self.connection() {
                    Ok(connection) => if let Err(e) = connection.send_frame(response).await {
                        debug!("channel {}: could not send response to request {}: {}", self.id, frame.request_id, e);
                    }
                    Err(_) => debug!("channel {}: connection is gone, dropping response", self.id),
                }
            }
        }
    }

    /// Closes the channel, or the whole connection for channel 0. Returns `false` if the
    ///  connection could not be closed immediately because a worker is still busy with it; it is
    ///  closed when that worker is done.
    pub async fn close(self: &Arc<Self>) -> bool {
        let Ok(connection) = self.connection() else {
            return true;
        };
        if self.id == 0 {
            return connection.close().await;
        }
        connection.context().close_channel(self.clone(), true, None).await
    }

    /// Must be called on the service task. Returns `false` if the channel was closed before.
    pub(crate) async fn close_internal(self: &Arc<Self>, notify: bool, cause: Option<ExtendError>) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        debug!("closing channel {} (cause: {:?})", self.id, cause);

        let cancellation = cause.clone()
            .unwrap_or(ExtendError::ChannelClosed { channel_id: self.id });
        self.requests.close(&cancellation);

        if let Some(receiver) = &self.receiver {
            receiver.on_channel_closed(self).await;
        }

        if let Some(connection) = self.connection.upgrade() {
            if notify && self.id != 0 {
                let msg = PeerMessage::NotifyChannelClosed(NotifyChannelClosedData {
                    channel_id: self.id,
                    cause: cause.as_ref().map(|e| e.to_string()),
                });
                if let Err(e) = connection.send_peer_message(&msg).await {
                    debug!("could not notify peer of closing channel {}: {}", self.id, e);
                }
            }

            connection.unregister_channel(self.id);
            if self.id != 0 {
                connection.context().events.send_event(ConnectionEvent::ChannelClosed(ChannelEventData {
                    connection_id: connection.id(),
                    channel_id: self.id,
                    protocol_name: self.protocol_name().to_string(),
                }));
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SimpleProtocol;
    use crate::protocol::Protocol;
    use rstest::rstest;

    fn detached_channel(id: i32, request_timeout: Option<Duration>) -> Arc<Channel> {
        let factory = SimpleProtocol::new("cache", 1, 1).message_factory(1).unwrap();
        Channel::new(id, Weak::new(), factory, None, None, request_timeout)
    }

    fn status_for(channel: &Channel) -> Status {
        let (request_id, response) = channel.requests.register(RequestContext::Plain).unwrap();
        Status {
            channel_id: channel.id,
            request_id,
            requests: channel.requests.clone(),
            response: Some(response),
            default_timeout: channel.request_timeout,
        }
    }

    #[rstest]
    #[case::positive("channel:17#cache", Some((17, "cache")))]
    #[case::negative("channel:-3#events", Some((-3, "events")))]
    #[case::no_prefix("chan:1#cache", None)]
    #[case::no_protocol("channel:1#", None)]
    #[case::no_separator("channel:1", None)]
    #[case::not_a_number("channel:x#cache", None)]
    fn test_channel_uri(#[case] raw: &str, #[case] expected: Option<(i32, &str)>) {
        match expected {
            Some((channel_id, protocol_name)) => {
                let uri = ChannelUri::from_str(raw).unwrap();
                assert_eq!(uri, ChannelUri { channel_id, protocol_name: protocol_name.to_string() });
                assert_eq!(uri.to_string(), raw);
            }
            None => assert!(matches!(ChannelUri::from_str(raw), Err(ExtendError::IllegalArgument { .. }))),
        }
    }

    #[tokio::test]
    async fn test_response_completes_status() {
        let channel = detached_channel(5, None);
        let status = status_for(&channel);

        channel.complete(Frame::response(5, 7, status.request_id(), false, Bytes::from_static(b"ok")));
        let response = status.wait_for_response(None).await.unwrap();
        assert_eq!(response, ChannelMessage::new(7, Bytes::from_static(b"ok")));
        assert_eq!(channel.outstanding_requests(), 0);
    }

    #[tokio::test]
    async fn test_responses_are_matched_by_id_not_order() {
        let channel = detached_channel(5, None);
        let first = status_for(&channel);
        let second = status_for(&channel);

        channel.complete(Frame::response(5, 2, second.request_id(), false, Bytes::from_static(b"second")));
        channel.complete(Frame::response(5, 1, first.request_id(), false, Bytes::from_static(b"first")));

        assert_eq!(first.wait_for_response(None).await.unwrap().body, Bytes::from_static(b"first"));
        assert_eq!(second.wait_for_response(None).await.unwrap().body, Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn test_failure_response() {
        let channel = detached_channel(5, None);
        let status = status_for(&channel);

        let failure = RemoteError::generic("boom").to_bytes();
        channel.complete(Frame::response(5, 0, status.request_id(), true, failure));
        assert_eq!(
            status.wait_for_response(None).await,
            Err(ExtendError::RequestFailed { message: "boom".to_string() }),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_is_dropped() {
        let channel = detached_channel(0, Some(Duration::from_secs(5)));
        let status = status_for(&channel);
        let request_id = status.request_id();

        let result = status.wait_for_response(None).await;
        assert_eq!(result, Err(ExtendError::RequestTimeout { request_id, timeout: Duration::from_secs(5) }));
        assert_eq!(channel.outstanding_requests(), 0);

        // arrives after the status gave up
        channel.complete(Frame::response(0, 5, request_id, false, Bytes::new()));
        assert_eq!(channel.outstanding_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_timeout_overrides_default() {
        let channel = detached_channel(3, Some(Duration::from_secs(5)));
        let status = status_for(&channel);

        let started = time::Instant::now();
        let result = status.wait_for_response(Some(Duration::from_millis(100))).await;
        assert!(result.unwrap_err().is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_dropped_status_unregisters_request() {
        let channel = detached_channel(3, None);
        let status = status_for(&channel);
        assert_eq!(channel.outstanding_requests(), 1);

        drop(status);
        assert_eq!(channel.outstanding_requests(), 0);
    }

    #[tokio::test]
    async fn test_detached_status_keeps_request() {
        let channel = detached_channel(0, None);
        let status = status_for(&channel);
        let request_id = status.request_id();

        status.detach();
        assert!(channel.take_request(request_id).is_some());
    }

    #[tokio::test]
    async fn test_close_cancels_outstanding_requests() {
        let channel = detached_channel(3, None);
        let status = status_for(&channel);

        assert!(channel.close_internal(false, None).await);
        assert!(!channel.is_open());
        assert_eq!(status.wait_for_response(None).await, Err(ExtendError::ChannelClosed { channel_id: 3 }));

        // closing twice is a no-op, and the closed table rejects new requests
        assert!(!channel.close_internal(false, None).await);
        assert!(channel.requests.register(RequestContext::Plain).is_err());
    }

    #[tokio::test]
    async fn test_send_on_closed_channel_fails() {
        let channel = detached_channel(3, None);
        channel.close_internal(false, None).await;

        let result = channel.send(ChannelMessage::new(1, Bytes::new())).await;
        assert_eq!(result, Err(ExtendError::ChannelClosed { channel_id: 3 }));
    }
}
