//! Direct stream transport over TCP.
//!
//! Envelope frames are self-delimiting: the fixed prefix carries the whole
//! frame length, so the reader pulls the prefix, then exactly the rest.
//! Connections are one-way; a peer answers over its own outbound link to
//! the reply endpoint it learned during the handshake. The read half of an
//! outbound link is still watched so a peer that went away marks the link
//! closed before the next frame is written into a dead socket.

use crate::core::{Error, Result, TransportKind};
use crate::envelope::{frame_len, PREFIX_LEN};
use crate::transport::{InboundFrame, Link, TransportBackend};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// A listening TCP backend.
pub struct TcpTransport {
    local_addr: SocketAddr,
    accept: JoinHandle<()>,
}

impl TcpTransport {
    /// Listen on `addr`; every frame received goes to `inbound`.
    pub async fn bind(addr: &str, inbound: mpsc::Sender<InboundFrame>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "tcp transport listening");
        let accept = tokio::spawn(accept_loop(listener, inbound));
        Ok(Self { local_addr, accept })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections.
    pub fn shutdown(&self) {
        self.accept.abort();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

#[async_trait]
impl TransportBackend for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn local_address(&self) -> String {
        self.local_addr.to_string()
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn Link>> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| Error::unavailable(format!("connect {}: {}", address, e)))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        debug!(peer = %address, "tcp link connected");
        let closed = Arc::new(AtomicBool::new(false));
        let watch = tokio::spawn(watch_peer(reader, address.to_string(), closed.clone()));
        Ok(Arc::new(TcpLink {
            address: address.to_string(),
            writer: Mutex::new(writer),
            closed,
            watch,
        }))
    }
}

async fn accept_loop(listener: TcpListener, inbound: mpsc::Sender<InboundFrame>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(peer = %addr, "tcp connection accepted");
                let inbound = inbound.clone();
                tokio::spawn(async move {
                    let (mut reader, _writer) = stream.into_split();
                    if let Err(e) = read_loop(&mut reader, addr, &inbound).await {
                        debug!(peer = %addr, error = %e, "tcp connection ended");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "tcp accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn read_loop(
    reader: &mut OwnedReadHalf,
    addr: SocketAddr,
    inbound: &mpsc::Sender<InboundFrame>,
) -> Result<()> {
    loop {
        let Some(frame) = read_frame(reader).await? else {
            return Ok(());
        };
        let frame = InboundFrame {
            kind: TransportKind::Direct,
            from: Some(addr.to_string()),
            frame,
        };
        if inbound.send(frame).await.is_err() {
            return Ok(());
        }
    }
}

/// Drains the unused read half of an outbound link and flags the link on
/// end of stream or error.
async fn watch_peer(mut reader: OwnedReadHalf, address: String, closed: Arc<AtomicBool>) {
    let mut scratch = [0u8; 512];
    loop {
        match reader.read(&mut scratch).await {
            Ok(0) => {
                debug!(peer = %address, "tcp link closed by peer");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(peer = %address, error = %e, "tcp link read failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::Relaxed);
}

/// Read one frame; `None` on clean end of stream.
pub async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Option<Bytes>> {
    let mut prefix = [0u8; PREFIX_LEN];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }
    let len = frame_len(&prefix)?;
    let mut frame = BytesMut::with_capacity(len);
    frame.extend_from_slice(&prefix);
    frame.resize(len, 0);
    reader.read_exact(&mut frame[PREFIX_LEN..]).await?;
    Ok(Some(frame.freeze()))
}

struct TcpLink {
    address: String,
    writer: Mutex<OwnedWriteHalf>,
    closed: Arc<AtomicBool>,
    watch: JoinHandle<()>,
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.watch.abort();
    }
}

#[async_trait]
impl Link for TcpLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn send_frame(&self, frame: Bytes) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        written.map_err(|e| {
            self.closed.store(true, Ordering::Relaxed);
            Error::unavailable(format!("write to {}: {}", self.address, e))
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}
