//! The two kinds of peers, [acceptor::Acceptor] and [initiator::Initiator], and the machinery they
//!  share.
//!
//! Each peer runs a single service task that owns all connection state: connection sets, the
//!  accepting flag, negotiated factory maps. Other tasks talk to it through [ServiceCommand]s.
//!  Application messages are dispatched to receivers on a [daemon_pool::DaemonPool].

pub mod acceptor;
pub mod daemon_pool;
pub mod events;
pub mod filter;
pub mod identity;
pub mod initiator;
pub(crate) mod service;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PeerConfig;
use crate::error::{ExtendError, ExtendResult};
use crate::messaging::envelope::Frame;
use crate::net::channel::{Channel, Receiver, Status};
use crate::net::connection::{CloseOutcome, Connection};
use crate::peer::daemon_pool::DaemonPool;
use crate::peer::events::{ConnectionEvent, ConnectionEventNotifier};
use crate::peer::identity::{DefaultIdentity, IdentityAsserter, IdentityProvider, Subject};
use crate::peer::service::{on_service_task, PeerService};
use crate::protocol::{Protocol, ProtocolRegistry};
use crate::util::atomic_map::AtomicMap;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeerRole {
    Acceptor,
    Initiator,
}

/// Collaborators injected into a peer at construction
pub struct PeerDependencies {
    pub protocols: Vec<Arc<dyn Protocol>>,
    pub identity_provider: Arc<dyn IdentityProvider>,
    pub identity_asserter: Arc<dyn IdentityAsserter>,
}

impl PeerDependencies {
    pub fn new(protocols: Vec<Arc<dyn Protocol>>) -> PeerDependencies {
        PeerDependencies {
            protocols,
            identity_provider: Arc::new(DefaultIdentity::default()),
            identity_asserter: Arc::new(DefaultIdentity::default()),
        }
    }

    pub fn with_identity(mut self, provider: Arc<dyn IdentityProvider>, asserter: Arc<dyn IdentityAsserter>) -> PeerDependencies {
        self.identity_provider = provider;
        self.identity_asserter = asserter;
        self
    }
}

/// Work for the service task. These are the internal-only messages of the lifecycle protocol:
///  they never go over the wire.
#[derive(Debug)]
pub(crate) enum ServiceCommand {
    Accepted {
        connection: Arc<Connection>,
    },
    OpenConnection {
        connection: Arc<Connection>,
        subject: Option<Subject>,
        reply: oneshot::Sender<ExtendResult<Status>>,
    },
    /// a frame that arrived on channel 0
    Frame {
        connection: Arc<Connection>,
        frame: Frame,
    },
    CloseConnection {
        connection: Arc<Connection>,
        notify: bool,
        cause: Option<ExtendError>,
        reply: Option<oneshot::Sender<bool>>,
    },
    CloseChannel {
        channel: Arc<Channel>,
        notify: bool,
        cause: Option<ExtendError>,
        reply: Option<oneshot::Sender<bool>>,
    },
    TransportClosed {
        connection: Arc<Connection>,
        error: Option<ExtendError>,
    },
    /// pings every open connection that has no ping outstanding
    Ping {
        reply: oneshot::Sender<()>,
    },
    CheckPingTimeouts {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// State and collaborators of a peer that are shared between its service task, its connections
///  and its public handle
pub(crate) struct PeerContext {
    pub service_name: String,
    pub process_id: Uuid,
    pub role: PeerRole,
    pub config: PeerConfig,
    /// default timeout for requests on this peer's channels, `None` for 'no timeout'
    pub request_timeout: Option<Duration>,
    pub registry: Arc<ProtocolRegistry>,
    pub daemon_pool: DaemonPool,
    pub events: ConnectionEventNotifier,
    pub receivers: AtomicMap<String, Arc<dyn Receiver>>,
    pub identity_provider: Arc<dyn IdentityProvider>,
    pub identity_asserter: Arc<dyn IdentityAsserter>,
    commands: mpsc::UnboundedSender<ServiceCommand>,
    running: AtomicBool,
}

impl PeerContext {
    pub(crate) fn new(role: PeerRole, config: PeerConfig, request_timeout: Option<Duration>, dependencies: PeerDependencies) -> (Arc<PeerContext>, mpsc::UnboundedReceiver<ServiceCommand>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let context = PeerContext {
            service_name: config.service_name.clone(),
            process_id: Uuid::new_v4(),
            role,
            daemon_pool: DaemonPool::new(config.service_name.clone(), config.daemon_pool.clone()),
            config,
            request_timeout,
            registry: Arc::new(ProtocolRegistry::new(dependencies.protocols)),
            events: ConnectionEventNotifier::new(),
            receivers: AtomicMap::new(),
            identity_provider: dependencies.identity_provider,
            identity_asserter: dependencies.identity_asserter,
            commands,
            running: AtomicBool::new(false),
        };
        (Arc::new(context), receiver)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub(crate) fn not_running(&self) -> ExtendError {
        ExtendError::ServiceNotRunning { service: self.service_name.clone() }
    }

    pub(crate) fn send_command(&self, command: ServiceCommand) -> bool {
        match self.commands.send(command) {
            Ok(()) => true,
            Err(e) => {
                debug!("service {} is gone, dropping {:?}", self.service_name, e.0);
                false
            }
        }
    }

    /// Routes a close through the service task. On the service task itself the close is queued
    ///  and `false` is returned; when the service is not running, the connection is closed
    ///  directly.
    pub(crate) async fn close_connection(&self, connection: Arc<Connection>, notify: bool, cause: Option<ExtendError>) -> bool {
        if on_service_task() {
            self.send_command(ServiceCommand::CloseConnection { connection, notify, cause, reply: None });
            return false;
        }

        if self.is_running() {
            let (reply, closed) = oneshot::channel();
            let command = ServiceCommand::CloseConnection {
                connection: connection.clone(),
                notify,
                cause: cause.clone(),
                reply: Some(reply),
            };
            if self.send_command(command) {
                if let Ok(closed) = closed.await {
                    return closed;
                }
            }
        }

        connection.close_internal(notify, cause, Duration::ZERO).await != CloseOutcome::Deferred
    }

    pub(crate) async fn close_channel(&self, channel: Arc<Channel>, notify: bool, cause: Option<ExtendError>) -> bool {
        if on_service_task() {
            self.send_command(ServiceCommand::CloseChannel { channel, notify, cause, reply: None });
            return false;
        }

        if self.is_running() {
            let (reply, closed) = oneshot::channel();
            let command = ServiceCommand::CloseChannel {
                channel: channel.clone(),
                notify,
                cause: cause.clone(),
                reply: Some(reply),
            };
            if self.send_command(command) {
                if let Ok(closed) = closed.await {
                    return closed;
                }
            }
        }

        channel.close_internal(notify, cause).await;
        true
    }
}

/// The parts of a peer that do not depend on its role: starting and stopping the service task,
///  receiver registration and events
pub struct PeerHandle {
    context: Arc<PeerContext>,
    service: Mutex<Option<PeerService>>,
}

impl PeerHandle {
    pub(crate) fn new(context: Arc<PeerContext>, service: PeerService) -> PeerHandle {
        PeerHandle {
            context,
            service: Mutex::new(Some(service)),
        }
    }

    pub(crate) fn context(&self) -> &Arc<PeerContext> {
        &self.context
    }

    pub fn start(&self) -> ExtendResult<()> {
        self.context.config.validate()
            .map_err(|e| ExtendError::illegal_argument(format!("{:#}", e)))?;

        let service = self.service.lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| ExtendError::illegal_argument(format!("{} was started before", self.context.service_name)))?;

        info!("starting {:?} {} ({})", self.context.role, self.context.service_name, self.context.process_id);
        self.context.daemon_pool.start();
        self.context.set_running(true);
        tokio::spawn(service.run());
        Ok(())
    }

    /// sends a command to the service task and waits until it was processed
    async fn run_command(&self, command: impl FnOnce(oneshot::Sender<()>) -> ServiceCommand) {
        if !self.context.is_running() {
            return;
        }
        let (reply, done) = oneshot::channel();
        if self.context.send_command(command(reply)) {
            let _ = done.await;
        }
    }
}

/// The operations all peers share
#[async_trait]
pub trait Peer: Send + Sync {
    fn peer_handle(&self) -> &PeerHandle;

    /// the connections this peer currently maintains
    fn connections(&self) -> Vec<Arc<Connection>>;

    fn start(&self) -> ExtendResult<()> {
        self.peer_handle().start()
    }

    /// Stops gracefully: no new connections, then all connections are closed with escalating
    ///  grace periods.
    async fn shutdown(&self) {
        self.peer_handle().run_command(|reply| ServiceCommand::Shutdown { reply }).await
    }

    /// Stops immediately, closing connections with short grace periods
    async fn stop(&self) {
        self.peer_handle().run_command(|reply| ServiceCommand::Stop { reply }).await
    }

    /// Pings all open connections now, independent of the configured ping interval
    async fn ping(&self) {
        self.peer_handle().run_command(|reply| ServiceCommand::Ping { reply }).await
    }

    /// Closes all open connections whose outstanding ping is older than the ping timeout
    async fn check_ping_timeouts(&self) {
        self.peer_handle().run_command(|reply| ServiceCommand::CheckPingTimeouts { reply }).await
    }

    fn is_running(&self) -> bool {
        self.peer_handle().context.is_running()
    }

    fn process_id(&self) -> Uuid {
        self.peer_handle().context.process_id
    }

    fn service_name(&self) -> &str {
        &self.peer_handle().context.service_name
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.peer_handle().context.events.subscribe()
    }

    /// Makes a receiver available to remote peers opening channels to it by name
    fn register_receiver(&self, receiver: Arc<dyn Receiver>) {
        self.peer_handle().context.receivers.insert(receiver.name().to_string(), receiver);
    }

    fn unregister_receiver(&self, name: &str) -> Option<Arc<dyn Receiver>> {
        self.peer_handle().context.receivers.remove(&name.to_string())
    }

    fn format_stats(&self) -> String {
        self.format_peer_stats()
    }

    fn format_peer_stats(&self) -> String {
        let connections = self.connections();
        format!(
            "{}, BytesSent={}, BytesReceived={}",
            self.peer_handle().context.daemon_pool.format_stats(),
            connections.iter().map(|c| c.bytes_sent()).sum::<u64>(),
            connections.iter().map(|c| c.bytes_received()).sum::<u64>(),
        )
    }
}
