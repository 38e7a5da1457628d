//! The passive side of a connection: accepts transports, runs the server side of the handshake
//!  and admits or rejects connections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AcceptorConfig;
use crate::error::{ExtendError, ExtendResult};
use crate::messaging::peer_messages::{OpenConnectionRequestData, OpenConnectionResponseData, PeerMessage};
use crate::net::connection::{Connection, ConnectionHandle};
use crate::net::transport::Transport;
use crate::peer::filter::ConnectionFilter;
use crate::peer::service::{assert_identity, close_and_report, close_escalating, report_opened, PeerService, RoleState};
use crate::peer::{Peer, PeerContext, PeerDependencies, PeerHandle, PeerRole, ServiceCommand};
use crate::protocol::negotiation::negotiate_protocols;
use crate::util::atomic_map::AtomicMap;

/// Connection state of an acceptor, visible to both the service task and API callers. A
///  connection is in at most one of the two sets.
pub(crate) struct AcceptorShared {
    pending: AtomicMap<ConnectionHandle, Arc<Connection>>,
    open: AtomicMap<ConnectionHandle, Arc<Connection>>,
    accepting: AtomicBool,
    /// 0 means 'unlimited'
    connection_limit: usize,
    filter: RwLock<Option<Arc<dyn ConnectionFilter>>>,
}

impl AcceptorShared {
    fn new(connection_limit: usize) -> AcceptorShared {
        AcceptorShared {
            pending: AtomicMap::new(),
            open: AtomicMap::new(),
            accepting: AtomicBool::new(true),
            connection_limit,
            filter: RwLock::new(None),
        }
    }

    fn is_accepting_connections(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
            && (self.connection_limit == 0 || self.open.len() < self.connection_limit)
    }

    fn filter(&self) -> Option<Arc<dyn ConnectionFilter>> {
        self.filter.read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// The acceptor's part of the service task's state
pub(crate) struct AcceptorState {
    shared: Arc<AcceptorShared>,
    /// connections that could not be closed while stopping, retried when stopped
    unclosed: Vec<Arc<Connection>>,
}

impl AcceptorState {
    fn new(shared: Arc<AcceptorShared>) -> AcceptorState {
        AcceptorState {
            shared,
            unclosed: Vec::new(),
        }
    }

    pub(crate) fn open_connections(&self) -> Vec<Arc<Connection>> {
        self.shared.open.values()
    }

    pub(crate) fn on_accepted(&mut self, connection: Arc<Connection>) {
        debug!("accepted {}", connection);
        self.shared.pending.insert(connection.handle(), connection.clone());
        connection.start_reading();
    }

    pub(crate) fn on_connection_closed(&mut self, connection: &Arc<Connection>) {
        self.shared.pending.remove(&connection.handle());
        self.shared.open.remove(&connection.handle());
    }

    /// Runs the acceptor side of the handshake and sends the response. An error means the
    ///  connection was rejected and must be closed.
    pub(crate) async fn on_open_connection_request(&mut self, ctx: &PeerContext, connection: &Arc<Connection>, request_id: i64, request: OpenConnectionRequestData) -> ExtendResult<()> {
        if !self.shared.pending.contains_key(&connection.handle()) {
            connection.send_peer_response(request_id, Err(ExtendError::connection("connection already open"))).await;
            return Ok(());
        }

        match self.admit(ctx, connection, request) {
            Ok(response) => {
                self.shared.pending.remove(&connection.handle());
                self.shared.open.insert(connection.handle(), connection.clone());
                connection.mark_open();

                connection.send_peer_response(request_id, Ok(PeerMessage::OpenConnectionResponse(response))).await;
                report_opened(ctx, connection);
                Ok(())
            }
            Err(e) => {
                info!("rejecting {}: {}", connection, e);
                self.shared.pending.remove(&connection.handle());
                let reply = match &e {
                    ExtendError::Connection { .. } | ExtendError::UnsupportedProtocol { .. } | ExtendError::ProtocolNegotiation { .. } => e.clone(),
                    _ => ExtendError::rejected(),
                };
                connection.send_peer_response(request_id, Err(reply)).await;
                Err(e)
            }
        }
    }

    fn admit(&self, ctx: &PeerContext, connection: &Arc<Connection>, request: OpenConnectionRequestData) -> ExtendResult<OpenConnectionResponseData> {
        if request.client_id.is_nil() {
            return Err(ExtendError::illegal_argument("missing client id"));
        }
        if request.protocol_versions.is_empty() {
            return Err(ExtendError::illegal_argument("no protocol versions were requested"));
        }
        if let Some(service_name) = &request.service_name {
            if service_name != &ctx.service_name {
                return Err(ExtendError::connection(format!("this is service {}, not {}", ctx.service_name, service_name)));
            }
        }

        connection.set_identity(Uuid::new_v4(), request.client_id, request.member);
        let subject = assert_identity(ctx, connection, request.identity_token.as_deref())?;
        connection.set_subject(subject);

        if let Some(filter) = self.shared.filter() {
            filter.check_connection(connection)?;
        }
        if !self.shared.is_accepting_connections() {
            return Err(ExtendError::rejected());
        }

        let negotiated = negotiate_protocols(&ctx.registry, &request.protocol_versions)?;
        connection.install_factories(negotiated.factories);

        Ok(OpenConnectionResponseData {
            connection_id: connection.id().unwrap_or_default(),
            peer_id: ctx.process_id,
            version_overrides: negotiated.overrides,
        })
    }

    /// First phase of a graceful shutdown: stop admitting, ask every connection to close
    pub(crate) async fn stopping(&mut self, ctx: &PeerContext) {
        self.shared.accepting.store(false, Ordering::Release);

        for connection in self.shared.pending.values().into_iter().chain(self.shared.open.values()) {
            self.on_connection_closed(&connection);
            if !close_and_report(ctx, &connection, true, None, Duration::ZERO).await {
                self.unclosed.push(connection);
            }
        }
    }

    pub(crate) async fn stopped(&mut self, ctx: &PeerContext) {
        self.shared.accepting.store(false, Ordering::Release);

        let mut remaining = std::mem::take(&mut self.unclosed);
        for connection in self.shared.pending.values().into_iter().chain(self.shared.open.values()) {
            self.on_connection_closed(&connection);
            remaining.push(connection);
        }
        close_escalating(ctx, remaining).await;
    }
}

/// The passive peer. Transports are handed to it via [Acceptor::accept], e.g. by a
///  [crate::net::tcp::TcpAcceptorListener].
pub struct Acceptor {
    handle: PeerHandle,
    shared: Arc<AcceptorShared>,
}

impl Acceptor {
    pub fn new(config: AcceptorConfig, dependencies: PeerDependencies) -> Acceptor {
        let request_timeout = config.peer.effective_request_timeout();
        let (context, commands) = PeerContext::new(PeerRole::Acceptor, config.peer, request_timeout, dependencies);
        let shared = Arc::new(AcceptorShared::new(config.connection_limit));
        let service = PeerService::new(context.clone(), commands, RoleState::Acceptor(AcceptorState::new(shared.clone())));

        Acceptor {
            handle: PeerHandle::new(context, service),
            shared,
        }
    }

    pub fn with_connection_filter(self, filter: Arc<dyn ConnectionFilter>) -> Acceptor {
        self.set_connection_filter(Some(filter));
        self
    }

    pub fn set_connection_filter(&self, filter: Option<Arc<dyn ConnectionFilter>>) {
        *self.shared.filter.write()
            .unwrap_or_else(|e| e.into_inner()) = filter;
    }

    /// Takes ownership of a freshly accepted transport. The connection stays pending until the
    ///  remote initiator completes the handshake.
    pub fn accept(&self, transport: Arc<dyn Transport>) -> ExtendResult<Arc<Connection>> {
        let context = self.handle.context();
        if !context.is_running() {
            warn!("{} is not running - refusing {}", context.service_name, transport.description());
            return Err(context.not_running());
        }

        let connection = Connection::new(context.clone(), transport)?;
        if !context.send_command(ServiceCommand::Accepted { connection: connection.clone() }) {
            return Err(context.not_running());
        }
        Ok(connection)
    }

    pub fn pending_connections(&self) -> Vec<Arc<Connection>> {
        self.shared.pending.values()
    }

    pub fn is_accepting_connections(&self) -> bool {
        self.is_running() && self.shared.is_accepting_connections()
    }
}

impl Peer for Acceptor {
    fn peer_handle(&self) -> &PeerHandle {
        &self.handle
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.open.values()
    }

    fn format_stats(&self) -> String {
        format!("Connections={}, {}", self.shared.open.len(), self.format_peer_stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::envelope::{Frame, FrameKind};
    use crate::messaging::message::ChannelMessage;
    use crate::messaging::peer_messages::PeerMessageType;
    use crate::net::channel::Channel;
    use crate::net::connection::ConnectionState;
    use crate::net::transport::{FrameHandler, MemoryTransport};
    use crate::peer::events::{ConnectionErrorData, ConnectionEvent};
    use crate::peer::filter::MockConnectionFilter;
    use crate::peer::identity::{SharedSecretIdentity, Subject};
    use crate::peer::initiator::Initiator;
    use crate::protocol::ProtocolRegistry;
    use crate::test_util::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use rstest::rstest;
    use tokio::sync::mpsc;

    struct CollectFrames(mpsc::UnboundedSender<Frame>);

    #[async_trait]
    impl FrameHandler for CollectFrames {
        async fn handle_frame(&self, buf: Bytes) {
            self.0.send(Frame::try_deser(buf).unwrap()).unwrap();
        }
    }

    /// a client that speaks the wire protocol by hand
    fn raw_client(acceptor: &Acceptor) -> (Arc<MemoryTransport>, mpsc::UnboundedReceiver<Frame>) {
        let (client, server) = MemoryTransport::pair("raw");
        acceptor.accept(server).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let receiving = client.clone();
        tokio::spawn(async move {
            let _ = receiving.recv_loop(Arc::new(CollectFrames(tx))).await;
        });
        (client, rx)
    }

    fn open_connection_request(request_id: i64, client_id: Uuid, service_name: Option<&str>) -> Frame {
        let msg = PeerMessage::OpenConnectionRequest(OpenConnectionRequestData {
            client_id,
            identity_token: None,
            member: None,
            protocol_versions: ProtocolRegistry::new(cache_protocols(2, 1)).requested_versions(),
            cluster_name: None,
            service_name: service_name.map(str::to_string),
        });
        Frame::request(0, msg.type_id(), request_id, msg.to_bytes())
    }

    fn started_acceptor(config: AcceptorConfig) -> Acceptor {
        let acceptor = Acceptor::new(config, PeerDependencies::new(cache_protocols(2, 1)));
        acceptor.start().unwrap();
        acceptor
    }

    #[tokio::test]
    async fn test_raw_handshake() {
        let acceptor = started_acceptor(test_acceptor_config());
        let (client, mut frames) = raw_client(&acceptor);
        let client_id = Uuid::new_v4();

        client.send(open_connection_request(1, client_id, Some("test-service")).to_bytes()).await.unwrap();

        let response = frames.recv().await.unwrap();
        assert_eq!(response.kind, FrameKind::Response);
        assert_eq!(response.request_id, 1);
        let response = Channel::response_result(&response).unwrap();
        let PeerMessage::OpenConnectionResponse(data) = PeerMessage::deser(response.type_id, response.body).unwrap() else {
            panic!("expected an open connection response");
        };
        assert_eq!(data.peer_id, acceptor.process_id());
        assert_eq!(data.version_overrides, None);

        let connections = acceptor.connections();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].id(), Some(data.connection_id));
        assert_eq!(connections[0].peer_id(), Some(client_id));
        assert!(acceptor.pending_connections().is_empty());
    }

    #[tokio::test]
    async fn test_legacy_client_is_rejected() {
        let acceptor = started_acceptor(test_acceptor_config());
        let (client, mut frames) = raw_client(&acceptor);

        let legacy = Frame::request(0, PeerMessageType::OpenConnectionResponse.into(), 1, Bytes::new());
        client.send(legacy.to_bytes()).await.unwrap();

        let response = frames.recv().await.unwrap();
        assert_eq!(Channel::response_result(&response), Err(ExtendError::connection("unsupported protocol version")));
        assert!(frames.recv().await.is_none());
        wait_until(|| acceptor.pending_connections().is_empty()).await;
    }

    #[rstest]
    #[case::nil_client_id(Uuid::nil(), None, ExtendError::rejected())]
    #[case::wrong_service(Uuid::from_u128(1), Some("other"), ExtendError::connection("this is service test-service, not other"))]
    #[tokio::test]
    async fn test_invalid_open_connection_request(#[case] client_id: Uuid, #[case] service_name: Option<&str>, #[case] expected: ExtendError) {
        let acceptor = started_acceptor(test_acceptor_config());
        let mut events = acceptor.subscribe();
        let (client, mut frames) = raw_client(&acceptor);

        client.send(open_connection_request(7, client_id, service_name).to_bytes()).await.unwrap();

        let response = frames.recv().await.unwrap();
        assert_eq!(Channel::response_result(&response), Err(expected));
        assert!(frames.recv().await.is_none());
        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Error(_)));
        assert!(acceptor.connections().is_empty());
        assert!(acceptor.pending_connections().is_empty());
    }

    #[tokio::test]
    async fn test_requests_before_handshake_are_refused() {
        let acceptor = started_acceptor(test_acceptor_config());
        let (client, mut frames) = raw_client(&acceptor);

        let ping = Frame::request(0, PeerMessageType::PingRequest.into(), 3, Bytes::new());
        client.send(ping.to_bytes()).await.unwrap();

        let response = frames.recv().await.unwrap();
        assert_eq!(Channel::response_result(&response), Err(ExtendError::connection("connection is not open")));
        assert_eq!(acceptor.pending_connections().len(), 1);
    }

    #[tokio::test]
    async fn test_second_open_connection_request_is_refused() {
        let acceptor = started_acceptor(test_acceptor_config());
        let (client, mut frames) = raw_client(&acceptor);

        client.send(open_connection_request(1, Uuid::new_v4(), None).to_bytes()).await.unwrap();
        assert!(Channel::response_result(&frames.recv().await.unwrap()).is_ok());

        client.send(open_connection_request(2, Uuid::new_v4(), None).to_bytes()).await.unwrap();
        let response = frames.recv().await.unwrap();
        assert_eq!(response.request_id, 2);
        assert_eq!(Channel::response_result(&response), Err(ExtendError::connection("connection already open")));
        assert!(acceptor.connections()[0].is_open());
    }

    #[tokio::test]
    async fn test_answers_pings() {
        let acceptor = started_acceptor(test_acceptor_config());
        let (client, mut frames) = raw_client(&acceptor);
        client.send(open_connection_request(1, Uuid::new_v4(), None).to_bytes()).await.unwrap();
        frames.recv().await.unwrap();

        client.send(Frame::request(0, PeerMessageType::PingRequest.into(), 2, Bytes::new()).to_bytes()).await.unwrap();
        let response = frames.recv().await.unwrap();
        assert_eq!(response.request_id, 2);
        assert_eq!(response.type_id, i32::from(PeerMessageType::PingResponse));
        assert!(!response.failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_pings_close_the_connection() {
        let mut config = test_acceptor_config();
        config.peer.ping_interval = Duration::from_millis(100);
        config.peer.ping_timeout = Duration::from_millis(300);
        let acceptor = started_acceptor(config);
        let mut events = acceptor.subscribe();

        let (client, mut frames) = raw_client(&acceptor);
        client.send(open_connection_request(1, Uuid::new_v4(), None).to_bytes()).await.unwrap();
        frames.recv().await.unwrap();
        let connection_id = acceptor.connections()[0].id();
        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Opened(_)));

        let ping = frames.recv().await.unwrap();
        assert_eq!(ping.type_id, i32::from(PeerMessageType::PingRequest));

        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Error(ConnectionErrorData {
            connection_id,
            error: ExtendError::connection("did not receive a response to a ping within 300ms"),
        }));
        assert!(acceptor.connections().is_empty());
        assert!(frames.recv().await.is_none());
    }

    fn initiator_for(acceptor: &Arc<Acceptor>, dependencies: PeerDependencies) -> Initiator {
        let initiator = Initiator::new(test_initiator_config(), dependencies, Arc::new(MemoryConnector::new(acceptor.clone())));
        initiator.start().unwrap();
        initiator
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = test_acceptor_config();
        config.connection_limit = 1;
        let acceptor = Arc::new(started_acceptor(config));

        let first = initiator_for(&acceptor, PeerDependencies::new(cache_protocols(2, 1)));
        let second = initiator_for(&acceptor, PeerDependencies::new(cache_protocols(2, 1)));

        first.ensure_connection().await.unwrap();
        assert!(!acceptor.is_accepting_connections());
        assert_eq!(second.ensure_connection().await.err(), Some(ExtendError::rejected()));
        assert_eq!(acceptor.connections().len(), 1);
        assert!(second.connection().is_none());

        assert!(first.close_connection().await);
        wait_until(|| acceptor.connections().is_empty()).await;
        assert!(acceptor.is_accepting_connections());

        let connection = second.ensure_connection().await.unwrap();
        assert!(connection.is_open());
        assert_eq!(acceptor.connections().len(), 1);
    }

    #[rstest]
    #[case::connection_error(ExtendError::connection("go away"), ExtendError::connection("go away"))]
    #[case::other_error(ExtendError::illegal_argument("redirect elsewhere"), ExtendError::rejected())]
    #[tokio::test]
    async fn test_filter_rejects_connection(#[case] filter_error: ExtendError, #[case] expected: ExtendError) {
        let mut filter = MockConnectionFilter::new();
        filter.expect_check_connection()
            .withf(|connection| connection.peer_id().is_some() && !connection.is_open())
            .times(1)
            .returning(move |_| Err(filter_error.clone()));

        let acceptor = Acceptor::new(test_acceptor_config(), PeerDependencies::new(cache_protocols(2, 1)))
            .with_connection_filter(Arc::new(filter));
        acceptor.start().unwrap();
        let acceptor = Arc::new(acceptor);

        let initiator = initiator_for(&acceptor, PeerDependencies::new(cache_protocols(2, 1)));
        let error = initiator.ensure_connection().await.err().unwrap();
        assert!(error.is_rejection());
        assert_eq!(error, expected);

        acceptor.set_connection_filter(None);
        assert!(initiator.ensure_connection().await.is_ok());
    }

    #[rstest]
    #[case::matching_secret("secret", true)]
    #[case::wrong_secret("guess", false)]
    #[tokio::test]
    async fn test_shared_secret_identity(#[case] initiator_secret: &str, #[case] expected_ok: bool) {
        let acceptor_identity = Arc::new(SharedSecretIdentity::new("secret"));
        let initiator_identity = Arc::new(SharedSecretIdentity::new(initiator_secret));

        let acceptor = Arc::new(Acceptor::new(
            test_acceptor_config(),
            PeerDependencies::new(cache_protocols(2, 1)).with_identity(acceptor_identity.clone(), acceptor_identity),
        ));
        acceptor.start().unwrap();

        let initiator = Initiator::new(
            test_initiator_config(),
            PeerDependencies::new(cache_protocols(2, 1)).with_identity(initiator_identity.clone(), initiator_identity),
            Arc::new(MemoryConnector::new(acceptor.clone())),
        ).with_subject(Subject::new(["alice"]));
        initiator.start().unwrap();

        let result = initiator.ensure_connection().await;
        if expected_ok {
            assert!(result.is_ok());
            assert_eq!(acceptor.connections()[0].subject(), Some(Subject::new(["alice"])));
        }
        else {
            // the details stay on the acceptor side
            assert_eq!(result.err(), Some(ExtendError::rejected()));
            assert!(acceptor.connections().is_empty());
        }
    }

    #[tokio::test]
    async fn test_accept_requires_running_acceptor() {
        let acceptor = Acceptor::new(test_acceptor_config(), PeerDependencies::new(cache_protocols(2, 1)));
        let (_client, server) = MemoryTransport::pair("early");

        assert_eq!(acceptor.accept(server).err(), Some(ExtendError::ServiceNotRunning { service: "test-service".to_string() }));
        assert!(!acceptor.is_accepting_connections());
    }

    #[tokio::test]
    async fn test_format_stats() {
        let acceptor = Arc::new(started_acceptor(test_acceptor_config()));
        let initiator = initiator_for(&acceptor, PeerDependencies::new(cache_protocols(2, 1)));
        initiator.ensure_connection().await.unwrap();

        let stats = acceptor.format_stats();
        assert!(stats.starts_with("Connections=1, "), "{}", stats);
        assert!(stats.contains("BytesReceived="), "{}", stats);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections_gracefully() {
        let acceptor = Arc::new(started_acceptor(test_acceptor_config()));
        let initiator = initiator_for(&acceptor, PeerDependencies::new(cache_protocols(2, 1)));
        let connection = initiator.ensure_connection().await.unwrap();
        let mut events = acceptor.subscribe();

        acceptor.shutdown().await;

        assert!(!acceptor.is_running());
        assert!(!acceptor.is_accepting_connections());
        assert!(acceptor.connections().is_empty());
        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Closed(_)));
        wait_until(|| initiator.connection().is_none()).await;
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_escalates_past_busy_workers() {
        let acceptor = Arc::new(started_acceptor(test_acceptor_config()));
        let stuck = Arc::new(TrackingReceiver::new("stuck", CACHE_PROTOCOL).with_request_delay(Duration::from_secs(3600)));
        acceptor.register_receiver(stuck.clone());

        let initiator = initiator_for(&acceptor, PeerDependencies::new(cache_protocols(2, 1)));
        let connection = initiator.ensure_connection().await.unwrap();
        let channel = connection.open_channel(CACHE_PROTOCOL, "stuck", None, None).await.unwrap();

        let request = tokio::spawn(async move {
            channel.request(ChannelMessage::new(1, "hello"), None).await
        });
        stuck.wait_for_requests(1).await;

        acceptor.shutdown().await;

        assert!(!acceptor.is_running());
        assert!(acceptor.connections().is_empty());
        assert_eq!(stuck.closed_count(), 1);
        assert!(request.await.unwrap().is_err());
    }
}
