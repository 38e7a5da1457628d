use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::error::{ExtendError, ExtendResult};
use crate::messaging::envelope::{Frame, FrameKind};
use crate::messaging::message::ChannelMessage;
use crate::messaging::peer_messages::{AcceptChannelRequestData, OpenChannelRequestData, OpenChannelResponseData, PeerMessage, PeerMessageType};
use crate::net::channel::{Channel, PendingRequest, RequestContext};
use crate::net::connection::{CloseOutcome, Connection, ConnectionState};
use crate::peer::acceptor::AcceptorState;
use crate::peer::events::{ChannelEventData, ConnectionClosedData, ConnectionErrorData, ConnectionEvent, ConnectionOpenedData};
use crate::peer::identity::Subject;
use crate::peer::initiator::InitiatorState;
use crate::peer::{PeerContext, ServiceCommand};

tokio::task_local! {
    static SERVICE_TASK: ();
}

/// `true` when called from a peer's service task
pub(crate) fn on_service_task() -> bool {
    SERVICE_TASK.try_with(|_| ()).is_ok()
}

const MIN_TICK: Duration = Duration::from_millis(10);

/// grace periods when closing connections during shutdown: first attempt, then once more after
///  the daemon pool was stopped
const STOP_GRACE: Duration = Duration::from_millis(100);
const FORCED_STOP_GRACE: Duration = Duration::from_millis(1000);

pub(crate) enum RoleState {
    Acceptor(AcceptorState),
    Initiator(InitiatorState),
}

impl RoleState {
    fn open_connections(&self) -> Vec<Arc<Connection>> {
        match self {
            RoleState::Acceptor(s) => s.open_connections(),
            RoleState::Initiator(s) => s.open_connections(),
        }
    }

    fn on_connection_closed(&mut self, connection: &Arc<Connection>) {
        match self {
            RoleState::Acceptor(s) => s.on_connection_closed(connection),
            RoleState::Initiator(s) => s.on_connection_closed(connection),
        }
    }
}

/// Closes a connection and reports the close as an event. Returns `false` if the close was
///  deferred because a worker is still busy with the connection.
pub(crate) async fn close_and_report(ctx: &PeerContext, connection: &Arc<Connection>, notify: bool, cause: Option<ExtendError>, grace: Duration) -> bool {
    match connection.close_internal(notify, cause.clone(), grace).await {
        CloseOutcome::Closed => {
            let connection_id = connection.id();
            let event = match cause {
                None => ConnectionEvent::Closed(ConnectionClosedData { connection_id }),
                Some(error) => ConnectionEvent::Error(ConnectionErrorData { connection_id, error }),
            };
            ctx.events.send_event(event);
            true
        }
        CloseOutcome::AlreadyClosed => true,
        CloseOutcome::Deferred => false,
    }
}

/// Closes connections during shutdown. Connections that are still busy after a grace period get
///  a second chance after the daemon pool was stopped, and are abandoned after that.
pub(crate) async fn close_escalating(ctx: &PeerContext, connections: Vec<Arc<Connection>>) {
    let mut stuck = Vec::new();
    for connection in connections {
        if !close_and_report(ctx, &connection, true, None, STOP_GRACE).await {
            stuck.push(connection);
        }
    }
    if stuck.is_empty() {
        return;
    }

    warn!("{} connection(s) of {} did not close within {:?} - stopping the daemon pool", stuck.len(), ctx.service_name, STOP_GRACE);
    ctx.daemon_pool.stop();
    for connection in stuck {
        if !close_and_report(ctx, &connection, true, None, FORCED_STOP_GRACE).await {
            error!("unable to close {} - abandoning it", connection);
        }
    }
}

pub(crate) fn report_opened(ctx: &PeerContext, connection: &Connection) {
    let (Some(connection_id), Some(peer_id)) = (connection.id(), connection.peer_id()) else {
        return;
    };
    info!("opened {} to peer {}", connection, peer_id);
    ctx.events.send_event(ConnectionEvent::Opened(ConnectionOpenedData {
        connection_id,
        peer_id,
        member: connection.member(),
    }));
}

/// Asserts an identity token. The details of a failure are logged locally; the remote side only
///  learns that it was rejected.
pub(crate) fn assert_identity(ctx: &PeerContext, connection: &Connection, token: Option<&[u8]>) -> ExtendResult<Option<Subject>> {
    ctx.identity_asserter.assert_identity(token)
        .map_err(|e| {
            warn!("{}: identity assertion failed: {}", connection, e);
            match e {
                ExtendError::Security { .. } => e,
                other => ExtendError::security(other.to_string()),
            }
        })
}

/// The single task that owns a peer's connection state
pub(crate) struct PeerService {
    context: Arc<PeerContext>,
    commands: mpsc::UnboundedReceiver<ServiceCommand>,
    role: RoleState,
}

impl PeerService {
    pub(crate) fn new(context: Arc<PeerContext>, commands: mpsc::UnboundedReceiver<ServiceCommand>, role: RoleState) -> PeerService {
        PeerService {
            context,
            commands,
            role,
        }
    }

    pub(crate) async fn run(self) {
        SERVICE_TASK.scope((), self.run_loop()).await
    }

    async fn run_loop(mut self) {
        let ping_interval = self.context.config.ping_interval.max(MIN_TICK);
        let ping_check_interval = (self.context.config.ping_timeout / 4).max(MIN_TICK);
        let ping_enabled = !self.context.config.ping_interval.is_zero();

        let mut ping_ticker = time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping_check_ticker = time::interval_at(Instant::now() + ping_check_interval, ping_check_interval);
        ping_check_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if self.on_command(command).await.is_break() {
                        break;
                    }
                }
                _ = ping_ticker.tick(), if ping_enabled => {
                    self.send_pings().await;
                }
                _ = ping_check_ticker.tick(), if ping_enabled => {
                    self.check_ping_timeouts().await;
                }
            }
        }

        if let RoleState::Initiator(s) = &mut self.role {
            s.on_exit().await;
        }
        info!("{} terminated", self.context.service_name);
    }

    async fn on_command(&mut self, command: ServiceCommand) -> ControlFlow<()> {
        trace!("{}: {:?}", self.context.service_name, command);

        match command {
            ServiceCommand::Accepted { connection } => match &mut self.role {
                RoleState::Acceptor(s) => s.on_accepted(connection),
                RoleState::Initiator(_) => {
                    warn!("an initiator does not accept connections - closing {}", connection);
                    close_and_report(&self.context, &connection, false, None, Duration::ZERO).await;
                }
            },
            ServiceCommand::OpenConnection { connection, subject, reply } => match &mut self.role {
                RoleState::Initiator(s) => {
                    let result = s.on_open_connection(&self.context, &connection, subject).await;
                    let _ = reply.send(result);
                }
                RoleState::Acceptor(_) => {
                    let _ = reply.send(Err(ExtendError::illegal_argument("an acceptor does not open connections")));
                }
            },
            ServiceCommand::Frame { connection, frame } => self.on_frame(connection, frame).await,
            ServiceCommand::CloseConnection { connection, notify, cause, reply } => {
                let closed = self.close_connection(&connection, notify, cause, Duration::ZERO).await;
                if let Some(reply) = reply {
                    let _ = reply.send(closed);
                }
            }
            ServiceCommand::CloseChannel { channel, notify, cause, reply } => {
                channel.close_internal(notify, cause).await;
                if let Some(reply) = reply {
                    let _ = reply.send(true);
                }
            }
            ServiceCommand::TransportClosed { connection, error } => {
                if connection.state() != ConnectionState::Closed {
                    let cause = error.unwrap_or_else(|| ExtendError::connection("transport closed"));
                    info!("{}: {}", connection, cause);
                    self.close_connection(&connection, false, Some(cause), Duration::ZERO).await;
                }
            }
            ServiceCommand::Ping { reply } => {
                self.send_pings().await;
                let _ = reply.send(());
            }
            ServiceCommand::CheckPingTimeouts { reply } => {
                self.check_ping_timeouts().await;
                let _ = reply.send(());
            }
            ServiceCommand::Shutdown { reply } => {
                self.shutdown(true).await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
            ServiceCommand::Stop { reply } => {
                self.shutdown(false).await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn shutdown(&mut self, graceful: bool) {
        info!("{} {}", if graceful { "shutting down" } else { "stopping" }, self.context.service_name);
        self.context.set_running(false);

        match &mut self.role {
            RoleState::Acceptor(s) => {
                if graceful {
                    s.stopping(&self.context).await;
                }
                s.stopped(&self.context).await;
            }
            RoleState::Initiator(s) => {
                if graceful {
                    s.stopping(&self.context).await;
                }
                s.stopped(&self.context).await;
            }
        }

        self.context.daemon_pool.stop();
    }

    async fn close_connection(&mut self, connection: &Arc<Connection>, notify: bool, cause: Option<ExtendError>, grace: Duration) -> bool {
        let closed = close_and_report(&self.context, connection, notify, cause, grace).await;
        if closed {
            self.role.on_connection_closed(connection);
        }
        closed
    }

    async fn send_pings(&self) {
        for connection in self.role.open_connections() {
            if connection.ping().await {
                trace!("{}: sent ping", connection);
            }
        }
    }

    async fn check_ping_timeouts(&mut self) {
        let timeout = self.context.config.ping_timeout;
        for connection in self.role.open_connections() {
            let Some(sent) = connection.ping_last() else {
                continue;
            };
            if sent.elapsed() >= timeout {
                warn!("{}: no ping response within {:?} - closing the connection", connection, timeout);
                let cause = ExtendError::connection(format!("did not receive a response to a ping within {:?}", timeout));
                self.close_connection(&connection, false, Some(cause), Duration::ZERO).await;
            }
        }
    }

    async fn on_frame(&mut self, connection: Arc<Connection>, frame: Frame) {
        if connection.state() == ConnectionState::Closed {
            debug!("{} is closed - dropping lifecycle frame of type {}", connection, frame.type_id);
            return;
        }

        if frame.kind == FrameKind::Response {
            self.on_response(connection, frame).await;
            return;
        }

        let message_type = match PeerMessageType::try_from(frame.type_id) {
            Ok(t) if t.kind() == frame.kind => t,
            Ok(PeerMessageType::OpenConnectionResponse) if frame.kind == FrameKind::Request => {
                warn!("{}: rejecting a legacy client", connection);
                let cause = ExtendError::connection("unsupported protocol version");
                connection.send_peer_response(frame.request_id, Err(cause.clone())).await;
                self.close_connection(&connection, false, Some(cause), Duration::ZERO).await;
                return;
            }
            _ => {
                warn!("{}: unexpected lifecycle {:?} of type {} - dropping it", connection, frame.kind, frame.type_id);
                if frame.kind == FrameKind::Request {
                    let error = ExtendError::illegal_argument(format!("unexpected request type {}", frame.type_id));
                    connection.send_peer_response(frame.request_id, Err(error)).await;
                }
                return;
            }
        };

        let message = match PeerMessage::deser(frame.type_id, frame.body) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}: malformed lifecycle message of type {:?}: {:#}", connection, message_type, e);
                if frame.kind == FrameKind::Request {
                    let error = ExtendError::illegal_argument(format!("malformed {:?}", message_type));
                    connection.send_peer_response(frame.request_id, Err(error)).await;
                }
                return;
            }
        };

        self.on_peer_message(connection, frame.request_id, message).await;
    }

    async fn on_peer_message(&mut self, connection: Arc<Connection>, request_id: i64, message: PeerMessage) {
        let allowed_while_pending = matches!(message, PeerMessage::OpenConnectionRequest(_) | PeerMessage::NotifyConnectionClosed(_));
        if !connection.is_open() && !allowed_while_pending {
            debug!("{}: received {:?} before the handshake completed", connection, message.message_type());
            if message.message_type().kind() == FrameKind::Request {
                connection.send_peer_response(request_id, Err(ExtendError::connection("connection is not open"))).await;
            }
            return;
        }

        match message {
            PeerMessage::PingRequest => {
                connection.send_peer_response(request_id, Ok(PeerMessage::PingResponse)).await;
            }
            PeerMessage::NotifyConnectionClosed(data) => {
                debug!("{}: closed by peer (cause: {:?})", connection, data.cause);
                let cause = data.cause.map(ExtendError::connection);
                self.close_connection(&connection, false, cause, Duration::ZERO).await;
            }
            PeerMessage::NotifyChannelClosed(data) => {
                match connection.channel(data.channel_id) {
                    Some(channel) if data.channel_id != 0 => {
                        channel.close_internal(false, data.cause.map(ExtendError::connection)).await;
                    }
                    _ => debug!("{}: peer closed unknown channel {}", connection, data.channel_id),
                }
            }
            PeerMessage::OpenConnectionRequest(data) => match &mut self.role {
                RoleState::Acceptor(s) => {
                    if let Err(e) = s.on_open_connection_request(&self.context, &connection, request_id, data).await {
                        self.close_connection(&connection, false, Some(e), Duration::ZERO).await;
                    }
                }
                RoleState::Initiator(_) => {
                    let error = ExtendError::connection("an initiator does not accept connections");
                    connection.send_peer_response(request_id, Err(error)).await;
                }
            },
            PeerMessage::OpenChannelRequest(data) => {
                let result = self.on_open_channel_request(&connection, data).await;
                connection.send_peer_response(request_id, result).await;
            }
            PeerMessage::AcceptChannelRequest(data) => {
                let result = self.on_accept_channel_request(&connection, data).await;
                connection.send_peer_response(request_id, result).await;
            }
            other => debug!("{}: ignoring {:?}", connection, other.message_type()),
        }
    }

    async fn on_open_channel_request(&self, connection: &Arc<Connection>, data: OpenChannelRequestData) -> ExtendResult<PeerMessage> {
        let receiver = self.context.receivers.get(&data.receiver_name)
            .ok_or_else(|| ExtendError::illegal_argument(format!("no receiver {}", data.receiver_name)))?;
        if receiver.protocol_name() != data.protocol_name {
            return Err(ExtendError::illegal_argument(format!(
                "receiver {} is bound to protocol {}, not {}", data.receiver_name, receiver.protocol_name(), data.protocol_name
            )));
        }
        let factory = connection.message_factory(&data.protocol_name)
            .ok_or_else(|| ExtendError::unsupported_protocol(&data.protocol_name))?;
        let subject = assert_identity(&self.context, connection, data.identity_token.as_deref())?;

        let channel_id = connection.generate_channel_id();
        let channel = connection.new_channel(channel_id, factory, Some(receiver), subject);
        self.register_channel(connection, channel).await?;
        Ok(PeerMessage::OpenChannelResponse(OpenChannelResponseData { channel_id }))
    }

    async fn on_accept_channel_request(&self, connection: &Arc<Connection>, data: AcceptChannelRequestData) -> ExtendResult<PeerMessage> {
        if data.channel_id == 0 {
            return Err(ExtendError::illegal_argument("channel 0 is reserved"));
        }
        let channel = connection.take_pending_channel(data.channel_id)
            .ok_or_else(|| ExtendError::illegal_argument(format!("no pending channel {}", data.channel_id)))?;
        if channel.protocol_name() != data.protocol_name {
            return Err(ExtendError::illegal_argument(format!(
                "channel {} was created for protocol {}, not {}", data.channel_id, channel.protocol_name(), data.protocol_name
            )));
        }
        let subject = assert_identity(&self.context, connection, data.identity_token.as_deref())?;
        channel.set_subject(subject);

        self.register_channel(connection, channel).await?;
        Ok(PeerMessage::AcceptChannelResponse)
    }

    async fn register_channel(&self, connection: &Arc<Connection>, channel: Arc<Channel>) -> ExtendResult<()> {
        connection.register_channel(channel.clone())?;
        if let Some(receiver) = channel.receiver() {
            receiver.on_channel_opened(&channel).await;
        }
        debug!("{}: opened channel {} for protocol {}", connection, channel.id(), channel.protocol_name());
        self.context.events.send_event(ConnectionEvent::ChannelOpened(ChannelEventData {
            connection_id: connection.id(),
            channel_id: channel.id(),
            protocol_name: channel.protocol_name().to_string(),
        }));
        Ok(())
    }

    async fn on_response(&mut self, connection: Arc<Connection>, frame: Frame) {
        let Some(PendingRequest { completion, context }) = connection.channel0().take_request(frame.request_id) else {
            debug!("{}: dropping response to unknown lifecycle request {} - it may have timed out", connection, frame.request_id);
            return;
        };

        let result = match context {
            RequestContext::Plain => Channel::response_result(&frame),
            RequestContext::Ping => {
                connection.clear_ping();
                Channel::response_result(&frame)
            }
            RequestContext::OpenConnection => self.on_open_connection_response(&connection, &frame).await,
            RequestContext::OpenChannel { factory, receiver, subject } => {
                match Self::expect_open_channel_response(&frame) {
                    Ok((response, channel_id)) => {
                        let channel = connection.new_channel(channel_id, factory, receiver, subject);
                        self.register_channel(&connection, channel).await.map(|_| response)
                    }
                    Err(e) => Err(e),
                }
            }
            RequestContext::AcceptChannel { channel_id, factory, receiver, subject } => {
                match Channel::response_result(&frame) {
                    Ok(response) => {
                        let channel = connection.new_channel(channel_id, factory, receiver, subject);
                        self.register_channel(&connection, channel).await.map(|_| response)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        // the requester may have stopped waiting
        let _ = completion.send(result);
    }

    fn expect_open_channel_response(frame: &Frame) -> ExtendResult<(ChannelMessage, i32)> {
        let response = Channel::response_result(frame)?;
        match PeerMessage::deser(response.type_id, response.body.clone())? {
            PeerMessage::OpenChannelResponse(data) => Ok((response, data.channel_id)),
            other => Err(ExtendError::connection(format!("unexpected response {:?} to an open channel request", other.message_type()))),
        }
    }

    async fn on_open_connection_response(&mut self, connection: &Arc<Connection>, frame: &Frame) -> ExtendResult<ChannelMessage> {
        let result = match &mut self.role {
            RoleState::Initiator(s) => s.on_open_connection_response(&self.context, connection, frame),
            RoleState::Acceptor(_) => Err(ExtendError::illegal_argument("an acceptor does not open connections")),
        };

        match result {
            Ok(response) => {
                report_opened(&self.context, connection);
                Ok(response)
            }
            Err(e) => {
                info!("{}: handshake failed: {}", connection, e);
                self.close_connection(connection, false, Some(e.clone()), Duration::ZERO).await;
                Err(e)
            }
        }
    }
}
