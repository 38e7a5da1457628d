use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::trace;

/// One physical, bidirectional connection to a remote peer. Frames are delivered whole: a
///  transport on top of a byte stream is responsible for framing.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, buf: Bytes) -> anyhow::Result<()>;

    /// Delivers inbound frames to the handler until the remote side or [Transport::close] ends
    ///  the stream. A regular end of stream returns `Ok`.
    async fn recv_loop(&self, handler: Arc<dyn FrameHandler>) -> anyhow::Result<()>;

    async fn close(&self);

    fn description(&self) -> String;
}

/// Decouples the transport from what happens to a frame once it is received.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle_frame(&self, buf: Bytes);
}

/// Creates the transport for an initiator's connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Arc<dyn Transport>>;
}

const MEMORY_TRANSPORT_CAPACITY: usize = 1024;

/// An in-process transport, one end of a pair created by [MemoryTransport::pair]. Closing either
///  end terminates the other end's receive loop.
pub struct MemoryTransport {
    name: String,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    closed: watch::Sender<bool>,
}

impl MemoryTransport {
    pub fn pair(name: &str) -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
        let (a_to_b, b_from_a) = mpsc::channel(MEMORY_TRANSPORT_CAPACITY);
        let (b_to_a, a_from_b) = mpsc::channel(MEMORY_TRANSPORT_CAPACITY);

        let a = MemoryTransport::new(format!("{}:a", name), a_to_b, a_from_b);
        let b = MemoryTransport::new(format!("{}:b", name), b_to_a, b_from_a);
        (Arc::new(a), Arc::new(b))
    }

    fn new(name: String, outbound: mpsc::Sender<Bytes>, inbound: mpsc::Receiver<Bytes>) -> MemoryTransport {
        let (closed, _) = watch::channel(false);
        MemoryTransport {
            name,
            outbound: Mutex::new(Some(outbound)),
            inbound: tokio::sync::Mutex::new(inbound),
            closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, buf: Bytes) -> anyhow::Result<()> {
        let sender = self.outbound.lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| anyhow!("{} is closed", self.name))?;

        sender.send(buf).await
            .map_err(|_| anyhow!("{}: remote end is closed", self.name))
    }

    async fn recv_loop(&self, handler: Arc<dyn FrameHandler>) -> anyhow::Result<()> {
        let mut closed = self.closed.subscribe();
        let mut inbound = self.inbound.lock().await;

        loop {
            tokio::select! {
                _ = async { let _ = closed.wait_for(|c| *c).await; } => {
                    trace!("{}: closed locally", self.name);
                    return Ok(());
                }
                buf = inbound.recv() => match buf {
                    Some(buf) => handler.handle_frame(buf).await,
                    None => {
                        trace!("{}: closed by remote end", self.name);
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn close(&self) {
        self.outbound.lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.closed.send_replace(true);
    }

    fn description(&self) -> String {
        format!("MemoryTransport({})", self.name)
    }
}
