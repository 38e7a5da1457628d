//! The active side of a connection: connects through a [Connector], runs the client side of the
//!  handshake and keeps (at most) one current connection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, warn};

use crate::config::InitiatorConfig;
use crate::error::{ExtendError, ExtendResult};
use crate::messaging::envelope::Frame;
use crate::messaging::message::ChannelMessage;
use crate::messaging::peer_messages::{OpenConnectionRequestData, PeerMessage};
use crate::net::channel::{Channel, RequestContext, Status};
use crate::net::connection::{Connection, ConnectionState};
use crate::net::transport::Connector;
use crate::peer::identity::Subject;
use crate::peer::service::{close_and_report, close_escalating, PeerService, RoleState};
use crate::peer::{Peer, PeerContext, PeerDependencies, PeerHandle, PeerRole, ServiceCommand};
use crate::protocol::negotiation::resolve_factories;

/// A resource that must be released when the initiator's service terminates
#[async_trait]
pub trait CloseOnExit: Send + Sync {
    async fn close(&self) -> anyhow::Result<()>;
}

pub(crate) struct InitiatorShared {
    config: InitiatorConfig,
    connector: Arc<dyn Connector>,
    current: RwLock<Option<Arc<Connection>>>,
    /// serializes connection attempts
    connect_lock: tokio::sync::Mutex<()>,
    subject: RwLock<Option<Subject>>,
    close_on_exit: Mutex<BTreeMap<u64, Arc<dyn CloseOnExit>>>,
    next_close_on_exit_key: AtomicU64,
}

impl InitiatorShared {
    fn current(&self) -> Option<Arc<Connection>> {
        self.current.read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn take_current(&self) -> Option<Arc<Connection>> {
        self.current.write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn subject(&self) -> Option<Subject> {
        self.subject.read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// The initiator's part of the service task's state
pub(crate) struct InitiatorState {
    shared: Arc<InitiatorShared>,
    /// the connection whose handshake is in progress
    connecting: Option<Arc<Connection>>,
    unclosed: Vec<Arc<Connection>>,
}

impl InitiatorState {
    fn new(shared: Arc<InitiatorShared>) -> InitiatorState {
        InitiatorState {
            shared,
            connecting: None,
            unclosed: Vec::new(),
        }
    }

    pub(crate) fn open_connections(&self) -> Vec<Arc<Connection>> {
        self.shared.current()
            .filter(|c| c.is_open())
            .into_iter()
            .collect()
    }

    pub(crate) fn on_connection_closed(&mut self, connection: &Arc<Connection>) {
        let mut current = self.shared.current.write()
            .unwrap_or_else(|e| e.into_inner());
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, connection)) {
            *current = None;
        }
        if self.connecting.as_ref().is_some_and(|c| Arc::ptr_eq(c, connection)) {
            self.connecting = None;
        }
    }

    /// Starts the handshake for a freshly connected transport
    pub(crate) async fn on_open_connection(&mut self, ctx: &PeerContext, connection: &Arc<Connection>, subject: Option<Subject>) -> ExtendResult<Status> {
        connection.start_reading();

        let identity_token = ctx.identity_provider.create_token(subject.as_ref())?;
        connection.set_subject(subject);

        let request = PeerMessage::OpenConnectionRequest(OpenConnectionRequestData {
            client_id: ctx.process_id,
            identity_token,
            member: ctx.config.member.clone(),
            protocol_versions: ctx.registry.requested_versions(),
            cluster_name: self.shared.config.remote_cluster_name.clone(),
            service_name: self.shared.config.remote_service_name.clone(),
        });
        let status = connection.send_peer_request(&request, RequestContext::OpenConnection).await?;
        self.connecting = Some(connection.clone());
        Ok(status)
    }

    /// Completes the handshake. On success the connection is open and current.
    pub(crate) fn on_open_connection_response(&mut self, ctx: &PeerContext, connection: &Arc<Connection>, frame: &Frame) -> ExtendResult<ChannelMessage> {
        let response = Channel::response_result(frame)?;
        let data = match PeerMessage::deser(response.type_id, response.body.clone())? {
            PeerMessage::OpenConnectionResponse(data) => data,
            other => return Err(ExtendError::connection(format!("unexpected response {:?} to an open connection request", other.message_type()))),
        };

        let factories = resolve_factories(&ctx.registry, data.version_overrides.as_ref())?;
        connection.set_identity(data.connection_id, data.peer_id, None);
        connection.install_factories(factories);
        if !connection.mark_open() {
            return Err(ExtendError::connection("connection was closed during the handshake"));
        }

        if self.connecting.as_ref().is_some_and(|c| Arc::ptr_eq(c, connection)) {
            self.connecting = None;
        }
        let mut current = self.shared.current.write()
            .unwrap_or_else(|e| e.into_inner());
        if current.as_ref().map_or(true, |c| !c.is_open()) {
            *current = Some(connection.clone());
        }
        Ok(response)
    }

    pub(crate) async fn stopping(&mut self, ctx: &PeerContext) {
        let connections = self.shared.take_current().into_iter().chain(self.connecting.take());
        for connection in connections {
            if !close_and_report(ctx, &connection, true, None, Duration::ZERO).await {
                self.unclosed.push(connection);
            }
        }
    }

    pub(crate) async fn stopped(&mut self, ctx: &PeerContext) {
        let mut remaining = std::mem::take(&mut self.unclosed);
        remaining.extend(self.shared.take_current());
        remaining.extend(self.connecting.take());
        close_escalating(ctx, remaining).await;
    }

    pub(crate) async fn on_exit(&mut self) {
        let resources = std::mem::take(&mut *self.shared.close_on_exit.lock()
            .unwrap_or_else(|e| e.into_inner()));
        for (key, resource) in resources {
            if let Err(e) = resource.close().await {
                warn!("could not close resource #{} on exit: {:#}", key, e);
            }
        }
    }
}

/// The active peer
pub struct Initiator {
    handle: PeerHandle,
    shared: Arc<InitiatorShared>,
}

impl Initiator {
    pub fn new(config: InitiatorConfig, dependencies: PeerDependencies, connector: Arc<dyn Connector>) -> Initiator {
        let request_timeout = config.effective_request_timeout();
        let (context, commands) = PeerContext::new(PeerRole::Initiator, config.peer.clone(), request_timeout, dependencies);
        let shared = Arc::new(InitiatorShared {
            config,
            connector,
            current: RwLock::new(None),
            connect_lock: Default::default(),
            subject: RwLock::new(None),
            close_on_exit: Mutex::new(BTreeMap::new()),
            next_close_on_exit_key: AtomicU64::new(1),
        });
        let service = PeerService::new(context.clone(), commands, RoleState::Initiator(InitiatorState::new(shared.clone())));

        Initiator {
            handle: PeerHandle::new(context, service),
            shared,
        }
    }

    /// the subject whose identity token is presented during the handshake
    pub fn with_subject(self, subject: Subject) -> Initiator {
        *self.shared.subject.write()
            .unwrap_or_else(|e| e.into_inner()) = Some(subject);
        self
    }

    /// Returns the current connection if it is open, and connects otherwise. Concurrent callers
    ///  share a single connection attempt.
    pub async fn ensure_connection(&self) -> ExtendResult<Arc<Connection>> {
        let context = self.handle.context();
        if !context.is_running() {
            return Err(context.not_running());
        }

        let _connect_lock = self.shared.connect_lock.lock().await;
        if let Some(connection) = self.shared.current() {
            if connection.is_open() {
                return Ok(connection);
            }
        }
        self.open_connection().await
    }

    #[tracing::instrument(skip_all, fields(service = %self.handle.context().service_name))]
    async fn open_connection(&self) -> ExtendResult<Arc<Connection>> {
        let context = self.handle.context();
        // one deadline for connecting and for the handshake
        let deadline = self.shared.config.effective_connect_timeout()
            .map(|timeout| (time::Instant::now() + timeout, timeout));

        let connect = self.shared.connector.connect();
        let transport = match deadline {
            Some((deadline, timeout)) => time::timeout_at(deadline, connect).await
                .map_err(|_| ExtendError::RequestTimeout { request_id: 0, timeout })?,
            None => connect.await,
        }.map_err(|e| ExtendError::connection(format!("could not connect: {:#}", e)))?;
        debug!("connected to {}", transport.description());

        let connection = Connection::new(context.clone(), transport)?;
        let (reply, status) = oneshot::channel();
        let command = ServiceCommand::OpenConnection {
            connection: connection.clone(),
            subject: self.shared.subject(),
            reply,
        };
        if !context.send_command(command) {
            return Err(context.not_running());
        }

        let status = match status.await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                context.close_connection(connection, false, Some(e.clone())).await;
                return Err(e);
            }
            Err(_) => return Err(context.not_running()),
        };

        let request_id = status.request_id();
        let response = status.wait_for_response(Some(Duration::ZERO));
        let result = match deadline {
            Some((deadline, timeout)) => time::timeout_at(deadline, response).await
                .unwrap_or(Err(ExtendError::RequestTimeout { request_id, timeout })),
            None => response.await,
        };
        match result {
            Ok(_) => Ok(connection),
            Err(e) => {
                if connection.state() != ConnectionState::Closed {
                    warn!("could not open {}: {}", connection, e);
                    context.close_connection(connection, false, Some(e.clone())).await;
                }
                Err(e)
            }
        }
    }

    /// the current connection, if there is one
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.shared.current()
    }

    /// Closes the current connection. The next [Initiator::ensure_connection] opens a new one.
    pub async fn close_connection(&self) -> bool {
        match self.shared.current() {
            Some(connection) => connection.close().await,
            None => true,
        }
    }

    /// Registers a resource to be closed when the service terminates. The returned key
    ///  unregisters it.
    pub fn register_close_on_exit(&self, resource: Arc<dyn CloseOnExit>) -> u64 {
        let key = self.shared.next_close_on_exit_key.fetch_add(1, Ordering::Relaxed);
        self.shared.close_on_exit.lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, resource);
        key
    }

    pub fn unregister_close_on_exit(&self, key: u64) -> Option<Arc<dyn CloseOnExit>> {
        self.shared.close_on_exit.lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key)
    }
}

impl Peer for Initiator {
    fn peer_handle(&self) -> &PeerHandle {
        &self.handle
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.current().into_iter().collect()
    }
}
