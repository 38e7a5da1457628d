use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{ExtendError, ExtendResult};
use crate::messaging::envelope::{Frame, FrameKind};
use crate::messaging::member::Member;
use crate::messaging::peer_messages::{AcceptChannelRequestData, NotifyConnectionClosedData, OpenChannelRequestData, PeerMessage, PeerMessageType, RemoteError};
use crate::net::channel::{Channel, ChannelUri, Receiver, RequestContext, Status};
use crate::net::transport::{FrameHandler, Transport};
use crate::peer::identity::Subject;
use crate::peer::{PeerContext, PeerRole, ServiceCommand};
use crate::protocol::negotiation::versions_of;
use crate::protocol::{MessageFactory, MessageFactoryMap, LIFECYCLE_PROTOCOL_NAME};
use crate::util::atomic_map::AtomicMap;
use crate::util::random::{Random, RngRandom};

/// More pending channels than this on a single connection are suspicious, but not an error
pub const MAX_PENDING: usize = 100;

/// process-local key of a connection, assigned before the connection has an id
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    fn next() -> ConnectionHandle {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionHandle(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// the handshake is not complete
    Pending,
    Open,
    /// terminal
    Closed,
}

/// the result of trying to close a connection
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CloseOutcome {
    Closed,
    AlreadyClosed,
    /// workers are still busy with the connection; it is closed when the last one leaves
    Deferred,
}

/// Picks a random channel id that is not in use. Ids are positive when the acceptor side
///  allocates them and negative for the initiator side, so both sides can allocate without
///  coordination.
pub(crate) fn generate_channel_id<R: Random>(role: PeerRole, in_use: impl Fn(i32) -> bool) -> i32 {
    loop {
        let raw = (R::next_u32() & 0x7fff_ffff) as i32;
        if raw == 0 {
            continue;
        }
        let id = match role {
            PeerRole::Acceptor => raw,
            PeerRole::Initiator => -raw,
        };
        if !in_use(id) {
            return id;
        }
    }
}

#[derive(Default)]
struct ConnectionStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl ConnectionStats {
    fn record_sent(&self, len: usize) {
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_received(&self, len: usize) {
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.messages_sent.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
    }
}

struct CloseRequest {
    notify: bool,
    cause: Option<ExtendError>,
}

/// Tracks daemon pool tasks that are working on a connection
#[derive(Default)]
struct ActivityGate {
    active: AtomicUsize,
    drained: Notify,
    close_on_exit: Mutex<Option<CloseRequest>>,
}

impl ActivityGate {
    async fn wait_drained(&self, grace: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.drained.notified();
                if self.active.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };
        time::timeout(grace, drained).await.is_ok()
    }

    fn set_close_on_exit(&self, request: Option<CloseRequest>) {
        *self.close_on_exit.lock()
            .unwrap_or_else(|e| e.into_inner()) = request;
    }
}

/// Held by a task that works on a connection. When the last task leaves a connection that was
///  marked close-on-exit, the close is re-issued to the service.
pub(crate) struct ActivityGuard {
    connection: Arc<Connection>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        let gate = &self.connection.activity;
        if gate.active.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        gate.drained.notify_waiters();

        let request = gate.close_on_exit.lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(request) = request {
            debug!("{}: last worker left, closing", self.connection);
            self.connection.context.send_command(ServiceCommand::CloseConnection {
                connection: self.connection.clone(),
                notify: request.notify,
                cause: request.cause,
                reply: None,
            });
        }
    }
}

struct ConnectionInfo {
    id: Option<Uuid>,
    peer_id: Option<Uuid>,
    member: Option<Member>,
}

/// A physical connection to a remote peer, multiplexing any number of [Channel]s. Channel 0
///  always exists and carries the lifecycle protocol.
///
/// State changes (handshake, channel registration, close) happen on the owning peer's service
///  task; everything else may be called from any task.
pub struct Connection {
    handle: ConnectionHandle,
    myself: Weak<Connection>,
    context: Arc<PeerContext>,
    transport: Arc<dyn Transport>,

    state: RwLock<ConnectionState>,
    info: RwLock<ConnectionInfo>,
    factories: RwLock<Arc<MessageFactoryMap>>,

    channel0: Arc<Channel>,
    channels: AtomicMap<i32, Arc<Channel>>,
    pending_channels: AtomicMap<i32, Arc<Channel>>,

    reading: AtomicBool,
    ping_sent: Mutex<Option<Instant>>,
    connect_time: Mutex<Option<Instant>>,
    stats: ConnectionStats,
    activity: ActivityGate,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.id() {
            Some(id) => write!(f, "Connection({}, {})", id, self.transport.description()),
            None => write!(f, "Connection(pending #{}, {})", self.handle.0, self.transport.description()),
        }
    }
}

#[async_trait]
impl FrameHandler for Connection {
    async fn handle_frame(&self, buf: Bytes) {
        if let Some(myself) = self.myself.upgrade() {
            myself.on_frame(buf);
        }
    }
}

impl Connection {
    pub(crate) fn new(context: Arc<PeerContext>, transport: Arc<dyn Transport>) -> ExtendResult<Arc<Connection>> {
        let lifecycle = context.registry.lifecycle_factory()?;
        let request_timeout = context.request_timeout;

        Ok(Arc::new_cyclic(|myself: &Weak<Connection>| {
            let channel0 = Channel::new(0, myself.clone(), lifecycle.clone(), None, None, request_timeout);
            let channels = AtomicMap::new();
            channels.insert(0, channel0.clone());

            let mut factories = MessageFactoryMap::default();
            factories.insert(LIFECYCLE_PROTOCOL_NAME.to_string(), lifecycle);

            Connection {
                handle: ConnectionHandle::next(),
                myself: myself.clone(),
                context,
                transport,
                state: RwLock::new(ConnectionState::Pending),
                info: RwLock::new(ConnectionInfo { id: None, peer_id: None, member: None }),
                factories: RwLock::new(Arc::new(factories)),
                channel0,
                channels,
                pending_channels: AtomicMap::new(),
                reading: AtomicBool::new(false),
                ping_sent: Mutex::new(None),
                connect_time: Mutex::new(None),
                stats: ConnectionStats::default(),
                activity: ActivityGate::default(),
            }
        }))
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    /// assigned by the acceptor during the handshake
    pub fn id(&self) -> Option<Uuid> {
        self.info().id
    }

    /// process id of the remote peer
    pub fn peer_id(&self) -> Option<Uuid> {
        self.info().peer_id
    }

    pub fn member(&self) -> Option<Member> {
        self.info().member.clone()
    }

    fn info(&self) -> std::sync::RwLockReadGuard<'_, ConnectionInfo> {
        self.info.read()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn subject(&self) -> Option<Subject> {
        self.channel0.subject()
    }

    pub fn description(&self) -> String {
        self.transport.description()
    }

    pub(crate) fn context(&self) -> &Arc<PeerContext> {
        &self.context
    }

    pub fn channel(&self, channel_id: i32) -> Option<Arc<Channel>> {
        self.channels.get(&channel_id)
    }

    /// all open channels, including channel 0
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        let mut result = self.channels.values();
        result.sort_by_key(|c| c.id());
        result
    }

    pub fn pending_channel_count(&self) -> usize {
        self.pending_channels.len()
    }

    pub(crate) fn channel0(&self) -> &Arc<Channel> {
        &self.channel0
    }

    /// the factory for the version of the protocol negotiated for this connection
    pub fn message_factory(&self, protocol_name: &str) -> Option<Arc<dyn MessageFactory>> {
        self.factories.read()
            .unwrap_or_else(|e| e.into_inner())
            .get(protocol_name)
            .cloned()
    }

    pub fn protocol_names(&self) -> Vec<String> {
        self.protocol_versions().into_keys().collect()
    }

    pub fn protocol_versions(&self) -> BTreeMap<String, u32> {
        versions_of(&self.factories.read()
            .unwrap_or_else(|e| e.into_inner()))
    }

    pub(crate) fn set_identity(&self, id: Uuid, peer_id: Uuid, member: Option<Member>) {
        let mut info = self.info.write()
            .unwrap_or_else(|e| e.into_inner());
        info.id = Some(id);
        info.peer_id = Some(peer_id);
        info.member = member;
    }

    pub(crate) fn set_subject(&self, subject: Option<Subject>) {
        self.channel0.set_subject(subject);
    }

    /// replaces the factory map as a whole. This happens before the connection is marked open,
    ///  so no application message ever sees a partial map.
    pub(crate) fn install_factories(&self, factories: MessageFactoryMap) {
        *self.factories.write()
            .unwrap_or_else(|e| e.into_inner()) = Arc::new(factories);
    }

    /// Pending -> Open, returns `false` for any other state
    pub(crate) fn mark_open(&self) -> bool {
        let mut state = self.state.write()
            .unwrap_or_else(|e| e.into_inner());
        if *state != ConnectionState::Pending {
            return false;
        }
        *state = ConnectionState::Open;
        *self.connect_time.lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        true
    }

    fn check_open(&self) -> ExtendResult<()> {
        match self.state() {
            ConnectionState::Open => Ok(()),
            state => Err(ExtendError::connection(format!("{} is {:?}", self, state))),
        }
    }

    /// Starts delivering inbound frames. When the transport's stream ends, the service is told
    ///  so it can close the connection.
    pub(crate) fn start_reading(self: &Arc<Self>) {
        if self.reading.swap(true, Ordering::AcqRel) {
            return;
        }

        let connection = self.clone();
        tokio::spawn(async move {
            let handler: Arc<dyn FrameHandler> = connection.clone();
            let result = connection.transport.recv_loop(handler).await;
            if let Err(e) = &result {
                debug!("{}: receive loop terminated: {:#}", connection, e);
            }
            else {
                trace!("{}: receive loop terminated", connection);
            }
            connection.context.send_command(ServiceCommand::TransportClosed {
                connection: connection.clone(),
                error: result.err().map(ExtendError::from),
            });
        });
    }

    fn on_frame(self: &Arc<Self>, buf: Bytes) {
        let max = self.context.config.max_incoming_message_size;
        if max > 0 && buf.len() > max {
            warn!("{}: received a message of {} bytes, exceeding the maximum of {} - closing the connection", self, buf.len(), max);
            self.request_close(false, Some(ExtendError::connection(format!("received a message exceeding the maximum size of {} bytes", max))));
            return;
        }
        self.stats.record_received(buf.len());

        let frame = match Frame::try_deser(buf) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{}: received a corrupt frame - closing the connection because it is apparently compromised: {}", self, e);
                self.request_close(false, Some(ExtendError::connection("received a corrupt frame")));
                return;
            }
        };

        if frame.channel_id == 0 {
            self.context.send_command(ServiceCommand::Frame {
                connection: self.clone(),
                frame,
            });
            return;
        }

        let Some(channel) = self.channels.get(&frame.channel_id) else {
            debug!("{}: received a frame for unknown channel {} - dropping it", self, frame.channel_id);
            return;
        };

        if frame.kind == FrameKind::Response {
            channel.complete(frame);
            return;
        }

        let guard = self.enter();
        let result = self.context.daemon_pool.add(async move {
            let _guard = guard;
            channel.receive(frame).await;
        });
        if let Err(e) = result {
            debug!("{}: dropping frame: {}", self, e);
        }
    }

    pub(crate) fn enter(self: &Arc<Self>) -> ActivityGuard {
        self.activity.active.fetch_add(1, Ordering::AcqRel);
        ActivityGuard {
            connection: self.clone(),
        }
    }

    fn request_close(self: &Arc<Self>, notify: bool, cause: Option<ExtendError>) {
        self.context.send_command(ServiceCommand::CloseConnection {
            connection: self.clone(),
            notify,
            cause,
            reply: None,
        });
    }

    pub(crate) async fn send_frame(&self, frame: Frame) -> ExtendResult<()> {
        if self.state() == ConnectionState::Closed {
            return Err(ExtendError::connection(format!("{} is closed", self)));
        }

        let buf = frame.to_bytes();
        let len = buf.len();
        let max = self.context.config.max_outgoing_message_size;
        if max > 0 && len > max {
            return Err(ExtendError::illegal_argument(format!("message of {} bytes exceeds the maximum size of {} bytes", len, max)));
        }

        let send_timeout = self.context.config.send_timeout;
        match time::timeout(send_timeout, self.transport.send(buf)).await {
            Ok(Ok(())) => {
                self.stats.record_sent(len);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ExtendError::Transport { message: format!("send timed out after {:?}", send_timeout) }),
        }
    }

    pub(crate) async fn send_peer_message(&self, msg: &PeerMessage) -> ExtendResult<()> {
        self.send_frame(Frame::message(0, msg.type_id(), msg.to_bytes())).await
    }

    pub(crate) async fn send_peer_request(&self, msg: &PeerMessage, context: RequestContext) -> ExtendResult<Status> {
        self.channel0.send_request_with_context(msg.type_id(), msg.to_bytes(), context).await
    }

    pub(crate) async fn send_peer_response(&self, request_id: i64, result: ExtendResult<PeerMessage>) {
        let frame = match result {
            Ok(msg) => Frame::response(0, msg.type_id(), request_id, false, msg.to_bytes()),
            Err(e) => Frame::response(0, PeerMessageType::Response.into(), request_id, true, RemoteError::from(&e).to_bytes()),
        };
        if let Err(e) = self.send_frame(frame).await {
            debug!("{}: could not send response to request {}: {}", self, request_id, e);
        }
    }

    pub(crate) fn new_channel(&self, channel_id: i32, factory: Arc<dyn MessageFactory>, receiver: Option<Arc<dyn Receiver>>, subject: Option<Subject>) -> Arc<Channel> {
        Channel::new(channel_id, self.myself.clone(), factory, receiver, subject, self.context.request_timeout)
    }

    pub(crate) fn generate_channel_id(&self) -> i32 {
        let channels = self.channels.load();
        let pending = self.pending_channels.load();
        generate_channel_id::<RngRandom>(self.context.role, |id| channels.contains_key(&id) || pending.contains_key(&id))
    }

    pub(crate) fn register_channel(&self, channel: Arc<Channel>) -> ExtendResult<()> {
        self.channels.update(|channels| {
            if channels.contains_key(&channel.id()) {
                return Err(ExtendError::illegal_argument(format!("duplicate channel {}", channel.id())));
            }
            channels.insert(channel.id(), channel);
            Ok(())
        })
    }

    pub(crate) fn unregister_channel(&self, channel_id: i32) {
        self.channels.remove(&channel_id);
    }

    pub(crate) fn take_pending_channel(&self, channel_id: i32) -> Option<Arc<Channel>> {
        self.pending_channels.remove(&channel_id)
    }

    fn check_receiver(protocol_name: &str, receiver: Option<&Arc<dyn Receiver>>) -> ExtendResult<()> {
        match receiver {
            Some(receiver) if receiver.protocol_name() != protocol_name => Err(ExtendError::illegal_argument(format!(
                "receiver {} is bound to protocol {}, not {}", receiver.name(), receiver.protocol_name(), protocol_name
            ))),
            _ => Ok(()),
        }
    }

    fn factory_for(&self, protocol_name: &str) -> ExtendResult<Arc<dyn MessageFactory>> {
        self.message_factory(protocol_name)
            .ok_or_else(|| ExtendError::unsupported_protocol(protocol_name))
    }

    /// Opens a channel to a receiver registered under `receiver_name` on the remote peer. The
    ///  remote peer allocates the channel id.
    pub async fn open_channel(&self, protocol_name: &str, receiver_name: &str, receiver: Option<Arc<dyn Receiver>>, subject: Option<Subject>) -> ExtendResult<Arc<Channel>> {
        self.check_open()?;
        Self::check_receiver(protocol_name, receiver.as_ref())?;
        let factory = self.factory_for(protocol_name)?;
        let identity_token = self.context.identity_provider.create_token(subject.as_ref())?;

        let request = PeerMessage::OpenChannelRequest(OpenChannelRequestData {
            protocol_name: protocol_name.to_string(),
            receiver_name: receiver_name.to_string(),
            identity_token,
        });
        let response = self.send_peer_request(&request, RequestContext::OpenChannel { factory, receiver, subject }).await?
            .wait_for_response(None)
            .await?;

        match PeerMessage::deser(response.type_id, response.body)? {
            PeerMessage::OpenChannelResponse(data) => self.channel(data.channel_id)
                .ok_or(ExtendError::ChannelClosed { channel_id: data.channel_id }),
            other => Err(ExtendError::connection(format!("unexpected response {:?} to an open channel request", other.message_type()))),
        }
    }

    /// Creates a channel that stays pending until the remote peer accepts it with the returned
    ///  URI (see [Connection::accept_channel]).
    pub fn create_channel(&self, protocol_name: &str, receiver: Option<Arc<dyn Receiver>>) -> ExtendResult<ChannelUri> {
        self.check_open()?;
        Self::check_receiver(protocol_name, receiver.as_ref())?;
        let factory = self.factory_for(protocol_name)?;

        let channel_id = self.generate_channel_id();
        let channel = self.new_channel(channel_id, factory, receiver, None);
        let num_pending = self.pending_channels.update(|pending| {
            pending.insert(channel_id, channel);
            pending.len()
        });
        if num_pending > MAX_PENDING {
            warn!("{} has {} pending channels - are channels created but never accepted?", self, num_pending);
        }

        Ok(ChannelUri {
            channel_id,
            protocol_name: protocol_name.to_string(),
        })
    }

    /// Accepts a channel the remote peer created with [Connection::create_channel]
    pub async fn accept_channel(&self, uri: &ChannelUri, receiver: Option<Arc<dyn Receiver>>, subject: Option<Subject>) -> ExtendResult<Arc<Channel>> {
        self.check_open()?;
        if uri.channel_id == 0 {
            return Err(ExtendError::illegal_argument("channel 0 is reserved"));
        }
        if self.channels.contains_key(&uri.channel_id) {
            return Err(ExtendError::illegal_argument(format!("duplicate channel {}", uri.channel_id)));
        }
        Self::check_receiver(&uri.protocol_name, receiver.as_ref())?;
        let factory = self.factory_for(&uri.protocol_name)?;
        let identity_token = self.context.identity_provider.create_token(subject.as_ref())?;

        let request = PeerMessage::AcceptChannelRequest(AcceptChannelRequestData {
            channel_id: uri.channel_id,
            protocol_name: uri.protocol_name.clone(),
            identity_token,
        });
        let context = RequestContext::AcceptChannel { channel_id: uri.channel_id, factory, receiver, subject };
        self.send_peer_request(&request, context).await?
            .wait_for_response(None)
            .await?;

        self.channel(uri.channel_id)
            .ok_or(ExtendError::ChannelClosed { channel_id: uri.channel_id })
    }

    /// Sends a ping unless one is outstanding. Returns `true` if a ping was sent.
    pub(crate) async fn ping(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        {
            let mut ping_sent = self.ping_sent.lock()
                .unwrap_or_else(|e| e.into_inner());
            if ping_sent.is_some() {
                return false;
            }
            *ping_sent = Some(Instant::now());
        }

        match self.send_peer_request(&PeerMessage::PingRequest, RequestContext::Ping).await {
            Ok(status) => {
                status.detach();
                true
            }
            Err(e) => {
                debug!("{}: could not send ping: {}", self, e);
                self.clear_ping();
                false
            }
        }
    }

    pub(crate) fn clear_ping(&self) {
        self.ping_sent.lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// when the outstanding ping was sent, if there is one
    pub fn ping_last(&self) -> Option<Instant> {
        *self.ping_sent.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn connect_time(&self) -> Option<Instant> {
        *self.connect_time.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn bytes_sent(&self) -> u64 {
        self.stats.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.stats.bytes_received.load(Ordering::Relaxed)
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    pub fn format_stats(&self) -> String {
        format!(
            "BytesSent={}, BytesReceived={}, MessagesSent={}, MessagesReceived={}",
            self.stats.bytes_sent.load(Ordering::Relaxed),
            self.stats.bytes_received.load(Ordering::Relaxed),
            self.stats.messages_sent.load(Ordering::Relaxed),
            self.stats.messages_received.load(Ordering::Relaxed),
        )
    }

    /// Closes the connection and notifies the remote peer. Returns `false` if a worker is still
    ///  busy with the connection, in which case it is closed as soon as the worker is done.
    pub async fn close(self: &Arc<Self>) -> bool {
        self.context.close_connection(self.clone(), true, None).await
    }

    /// Must be called on the service task (or when the service is gone)
    pub(crate) async fn close_internal(self: &Arc<Self>, notify: bool, cause: Option<ExtendError>, grace: Duration) -> CloseOutcome {
        if self.state() == ConnectionState::Closed {
            return CloseOutcome::AlreadyClosed;
        }
        debug!("closing {} (notify: {}, cause: {:?})", self, notify, cause);

        for channel in self.channels.values() {
            if channel.id() != 0 {
                channel.close_internal(false, cause.clone()).await;
            }
        }

        self.activity.set_close_on_exit(Some(CloseRequest { notify, cause: cause.clone() }));
        if !self.activity.wait_drained(grace).await {
            debug!("{} is still in use after {:?}, closing it when the last worker leaves", self, grace);
            return CloseOutcome::Deferred;
        }
        self.activity.set_close_on_exit(None);

        if notify {
            let msg = PeerMessage::NotifyConnectionClosed(NotifyConnectionClosedData {
                cause: cause.as_ref().map(|e| e.to_string()),
            });
            if let Err(e) = self.send_peer_message(&msg).await {
                debug!("{}: could not notify peer of closing: {}", self, e);
            }
        }

        self.channel0.close_internal(false, cause).await;
        self.pending_channels.clear();
        self.channels.clear();
        self.clear_ping();
        *self.state.write()
            .unwrap_or_else(|e| e.into_inner()) = ConnectionState::Closed;

        self.transport.close().await;
        CloseOutcome::Closed
    }
}
