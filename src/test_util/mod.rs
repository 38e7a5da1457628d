//! Building blocks for tests: in-memory connectors, a receiver that records what it gets, and
//!  ready-made peers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::time;

use crate::config::{AcceptorConfig, InitiatorConfig, PeerConfig};
use crate::error::ExtendResult;
use crate::messaging::message::ChannelMessage;
use crate::net::channel::{Channel, Receiver};
use crate::net::transport::{Connector, MemoryTransport, Transport};
use crate::peer::acceptor::Acceptor;
use crate::peer::initiator::Initiator;
use crate::peer::{Peer, PeerContext, PeerDependencies, PeerRole, ServiceCommand};
use crate::protocol::{Protocol, SimpleProtocol};

pub const CACHE_PROTOCOL: &str = "cache";

/// message types of the 'cache' test protocol: 1 and 2 exist from version 1, 3 was added in
///  version 2
pub fn cache_protocol(current_version: u32, supported_version: u32) -> Arc<dyn Protocol> {
    Arc::new(SimpleProtocol::new(CACHE_PROTOCOL, current_version, supported_version)
        .with_message_type(1, 1)
        .with_message_type(2, 1)
        .with_message_type(3, 2))
}

pub fn cache_protocols(current_version: u32, supported_version: u32) -> Vec<Arc<dyn Protocol>> {
    vec![cache_protocol(current_version, supported_version)]
}

pub(crate) fn peer_context(role: PeerRole, protocols: Vec<Arc<dyn Protocol>>) -> (Arc<PeerContext>, mpsc::UnboundedReceiver<ServiceCommand>) {
    let config = PeerConfig::new("test");
    let request_timeout = config.effective_request_timeout();
    PeerContext::new(role, config, request_timeout, PeerDependencies::new(protocols))
}

/// Records messages and lifecycle callbacks. Requests are echoed back, optionally after a delay.
pub struct TrackingReceiver {
    name: String,
    protocol_name: String,
    request_delay: Option<Duration>,
    messages: Mutex<Vec<ChannelMessage>>,
    requests: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    changed: Notify,
}

impl TrackingReceiver {
    pub fn new(name: &str, protocol_name: &str) -> TrackingReceiver {
        TrackingReceiver {
            name: name.to_string(),
            protocol_name: protocol_name.to_string(),
            request_delay: None,
            messages: Mutex::new(Vec::new()),
            requests: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            changed: Notify::new(),
        }
    }

    pub fn with_request_delay(mut self, delay: Duration) -> TrackingReceiver {
        self.request_delay = Some(delay);
        self
    }

    pub fn messages(&self) -> Vec<ChannelMessage> {
        self.messages.lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::Acquire)
    }

    /// waits until at least `n` messages arrived, returning all messages
    pub async fn wait_for_messages(&self, n: usize) -> Vec<ChannelMessage> {
        self.wait_until(|| self.messages.lock().unwrap_or_else(|e| e.into_inner()).len() >= n).await;
        self.messages()
    }

    /// waits until at least `n` requests started processing
    pub async fn wait_for_requests(&self, n: usize) {
        self.wait_until(|| self.requests.load(Ordering::Acquire) >= n).await
    }

    pub async fn wait_for_closed(&self, n: usize) {
        self.wait_until(|| self.closed_count() >= n).await
    }

    async fn wait_until(&self, condition: impl Fn() -> bool) {
        loop {
            let changed = self.changed.notified();
            if condition() {
                return;
            }
            changed.await;
        }
    }
}

#[async_trait]
impl Receiver for TrackingReceiver {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    async fn on_message(&self, _channel: &Arc<Channel>, message: ChannelMessage) {
        self.messages.lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        self.changed.notify_waiters();
    }

    async fn on_request(&self, _channel: &Arc<Channel>, request: ChannelMessage) -> ExtendResult<ChannelMessage> {
        self.requests.fetch_add(1, Ordering::AcqRel);
        self.changed.notify_waiters();
        if let Some(delay) = self.request_delay {
            time::sleep(delay).await;
        }
        Ok(request)
    }

    async fn on_channel_opened(&self, _channel: &Arc<Channel>) {
        self.opened.fetch_add(1, Ordering::AcqRel);
        self.changed.notify_waiters();
    }

    async fn on_channel_closed(&self, _channel: &Arc<Channel>) {
        self.closed.fetch_add(1, Ordering::AcqRel);
        self.changed.notify_waiters();
    }
}

/// Connects an initiator to an in-process acceptor through a [MemoryTransport] pair
pub struct MemoryConnector {
    acceptor: Arc<Acceptor>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(acceptor: Arc<Acceptor>) -> MemoryConnector {
        MemoryConnector {
            acceptor,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn Transport>> {
        let n = self.connects.fetch_add(1, Ordering::AcqRel);
        let (initiator_side, acceptor_side) = MemoryTransport::pair(&format!("memory-{}", n));
        self.acceptor.accept(acceptor_side)
            .map_err(|e| anyhow!(e))?;
        Ok(initiator_side)
    }
}

/// Hands out transports whose remote end never answers
#[derive(Default)]
pub struct BlackHoleConnector {
    transports: Mutex<Vec<(Arc<MemoryTransport>, Arc<MemoryTransport>)>>,
}

impl BlackHoleConnector {
    /// the local ends handed out so far
    pub fn transports(&self) -> Vec<Arc<MemoryTransport>> {
        self.transports.lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(local, _)| local.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for BlackHoleConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn Transport>> {
        let (local, remote) = MemoryTransport::pair("black-hole");
        self.transports.lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((local.clone(), remote));
        Ok(local)
    }
}

/// polls a condition every 10ms, panicking if it does not hold within five seconds
pub async fn wait_until(condition: impl Fn() -> bool) {
    let polling = async {
        while !condition() {
            time::sleep(Duration::from_millis(10)).await;
        }
    };
    time::timeout(Duration::from_secs(5), polling).await
        .expect("condition did not become true within five seconds");
}

pub fn test_acceptor_config() -> AcceptorConfig {
    let mut config = AcceptorConfig::new("test-service");
    config.peer.request_timeout = Duration::from_secs(5);
    config
}

pub fn test_initiator_config() -> InitiatorConfig {
    let mut config = InitiatorConfig::new("test-client");
    config.connect_timeout = Duration::from_secs(5);
    config.peer.request_timeout = Duration::from_secs(5);
    config
}

/// A started acceptor and a started initiator that connects to it in memory
pub fn connected_peers(acceptor: Acceptor, initiator_config: InitiatorConfig, dependencies: PeerDependencies) -> (Arc<Acceptor>, Initiator) {
    let acceptor = Arc::new(acceptor);
    let connector = Arc::new(MemoryConnector::new(acceptor.clone()));
    let initiator = Initiator::new(initiator_config, dependencies, connector);

    acceptor.start().expect("acceptor config is valid");
    initiator.start().expect("initiator config is valid");
    (acceptor, initiator)
}
