//! [Transport] over TCP. Each frame goes on the wire as a 4 byte big-endian length followed by
//!  the frame's bytes.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::net::transport::{Connector, FrameHandler, Transport};
use crate::peer::acceptor::Acceptor;

pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub struct TcpTransport {
    description: String,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    max_frame_len: usize,
    closed: watch::Sender<bool>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, max_frame_len: usize) -> TcpTransport {
        let description = match (stream.local_addr(), stream.peer_addr()) {
            (Ok(local), Ok(peer)) => format!("tcp {} -> {}", local, peer),
            _ => "tcp".to_string(),
        };
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);

        TcpTransport {
            description,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            max_frame_len,
            closed,
        }
    }

    /// `Ok(None)` for a regular end of stream between frames
    async fn read_frame(&self, reader: &mut OwnedReadHalf) -> anyhow::Result<Option<Bytes>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let frame_len = u32::from_be_bytes(len_buf) as usize;
        if frame_len > self.max_frame_len {
            bail!("received a frame of {} bytes, exceeding the maximum of {} - closing the connection because it is apparently compromised", frame_len, self.max_frame_len);
        }

        let mut frame_buf = vec![0u8; frame_len];
        reader.read_exact(&mut frame_buf).await?;
        Ok(Some(frame_buf.into()))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, buf: Bytes) -> anyhow::Result<()> {
        if buf.len() > self.max_frame_len {
            bail!("frame of {} bytes exceeds the maximum of {}", buf.len(), self.max_frame_len);
        }
        let frame_len = u32::try_from(buf.len())?;

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut()
            .ok_or_else(|| anyhow!("{} is closed", self.description))?;

        let mut out = BytesMut::with_capacity(4 + buf.len());
        out.put_u32(frame_len);
        out.put_slice(&buf);
        writer.write_all(&out).await?;
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn FrameHandler>) -> anyhow::Result<()> {
        let mut reader = self.reader.lock().await
            .take()
            .ok_or_else(|| anyhow!("{}: receive loop was started before", self.description))?;
        let mut closed = self.closed.subscribe();

        loop {
            if *closed.borrow() {
                return Ok(());
            }
            select! {
                frame = self.read_frame(&mut reader) => {
                    match frame? {
                        Some(frame) => handler.handle_frame(frame).await,
                        None => {
                            debug!("{}: end of stream", self.description);
                            return Ok(());
                        }
                    }
                }
                _ = closed.changed() => {}
            }
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("{}: error shutting down: {}", self.description, e);
            }
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}

/// Connects to the first reachable of a list of addresses
pub struct TcpConnector {
    addresses: Vec<SocketAddr>,
    /// per address, `None` for the OS default
    connect_timeout: Option<Duration>,
    max_frame_len: usize,
}

impl TcpConnector {
    pub fn new(addresses: Vec<SocketAddr>) -> TcpConnector {
        TcpConnector {
            addresses,
            connect_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> TcpConnector {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> TcpConnector {
        self.max_frame_len = max_frame_len;
        self
    }

    async fn connect_to(&self, address: SocketAddr) -> anyhow::Result<TcpStream> {
        let stream = match self.connect_timeout {
            Some(timeout) => time::timeout(timeout, TcpStream::connect(address)).await
                .map_err(|_| anyhow!("timed out after {:?}", timeout))??,
            None => TcpStream::connect(address).await?,
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn Transport>> {
        let mut failures = Vec::new();
        for &address in &self.addresses {
            match self.connect_to(address).await {
                Ok(stream) => return Ok(Arc::new(TcpTransport::new(stream, self.max_frame_len))),
                Err(e) => {
                    debug!("could not connect to {}: {}", address, e);
                    failures.push(format!("{}: {}", address, e));
                }
            }
        }
        bail!("could not connect to any address: [{}]", failures.join(", "))
    }
}

/// Listens on a TCP socket and hands accepted streams to an [Acceptor]
pub struct TcpAcceptorListener {
    listener: TcpListener,
    max_frame_len: usize,
}

impl TcpAcceptorListener {
    pub async fn bind(address: impl ToSocketAddrs) -> anyhow::Result<TcpAcceptorListener> {
        Ok(TcpAcceptorListener {
            listener: TcpListener::bind(address).await?,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        })
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> TcpAcceptorListener {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the returned handle is aborted
    pub fn spawn(self, acceptor: Arc<Acceptor>) -> JoinHandle<()> {
        tokio::spawn(self.accept_loop(acceptor))
    }

    async fn accept_loop(self, acceptor: Arc<Acceptor>) {
        if let Ok(address) = self.listener.local_addr() {
            info!("accepting connections on {}", address);
        }

        loop {
            let (stream, peer_address) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("error accepting a connection: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("could not set TCP_NODELAY for {}: {}", peer_address, e);
            }

            let transport = Arc::new(TcpTransport::new(stream, self.max_frame_len));
            if let Err(e) = acceptor.accept(transport.clone()) {
                warn!("refusing connection from {}: {}", peer_address, e);
                transport.close().await;
            }
        }
    }
}
