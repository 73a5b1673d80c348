//! Peer transports
//!
//! A transport hands out framed duplex connections carrying [`Frame`]s with
//! reliable, ordered delivery per connection. Socket I/O lives on dedicated
//! per-connection tasks with bounded queues on both sides; nothing upstream
//! ever blocks on a socket.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use pequi_api::remote::Frame;
use pequi_common::PequiError;

/// Upper bound on a single frame; anything larger is a protocol error
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Bound of the per-connection frame queues
const CONN_QUEUE_SIZE: usize = 128;

/// Bound of the pending-accept queue
const ACCEPT_QUEUE_SIZE: usize = 16;

/// One framed duplex connection to a peer
pub struct PeerConn {
    /// Where the connection came from or went to, for logs
    pub remote: String,
    pub tx: mpsc::Sender<Frame>,
    pub rx: mpsc::Receiver<Frame>,
}

/// A transport able to dial peers and accept inbound connections
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Connects to a peer at `addr`
    async fn connect(&self, addr: &str) -> Result<PeerConn, PequiError>;

    /// Starts listening on `addr`; returns the bound address and the stream
    /// of inbound connections
    async fn listen(&self, addr: &str) -> Result<(String, mpsc::Receiver<PeerConn>), PequiError>;
}

/// TCP transport: length-prefixed JSON frames over a tokio socket
#[derive(Clone, Debug, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }

    fn spawn_io(stream: TcpStream, remote: String) -> PeerConn {
        let (read_half, write_half) = stream.into_split();
        let (in_tx, in_rx) = mpsc::channel(CONN_QUEUE_SIZE);
        let (out_tx, out_rx) = mpsc::channel(CONN_QUEUE_SIZE);

        tokio::spawn(read_loop(read_half, in_tx, remote.clone()));
        tokio::spawn(write_loop(write_half, out_rx, remote.clone()));

        PeerConn {
            remote,
            tx: out_tx,
            rx: in_rx,
        }
    }
}

async fn read_loop(mut read_half: OwnedReadHalf, in_tx: mpsc::Sender<Frame>, remote: String) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(frame) => {
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(remote = %remote, error = %e, "peer connection read ended");
                break;
            }
        }
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut out_rx: mpsc::Receiver<Frame>, remote: String) {
    while let Some(frame) = out_rx.recv().await {
        if let Err(e) = write_frame(&mut write_half, &frame).await {
            debug!(remote = %remote, error = %e, "peer connection write ended");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn read_frame(read_half: &mut OwnedReadHalf) -> Result<Frame, PequiError> {
    let mut len_buf = [0u8; 4];
    read_half.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(PequiError::TransportError(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut payload = vec![0u8; len];
    read_half.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(|e| PequiError::TransportError(e.to_string()))
}

async fn write_frame(write_half: &mut OwnedWriteHalf, frame: &Frame) -> Result<(), PequiError> {
    let payload = serde_json::to_vec(frame).map_err(|e| PequiError::TransportError(e.to_string()))?;
    write_half
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    write_half.write_all(&payload).await?;
    Ok(())
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn connect(&self, addr: &str) -> Result<PeerConn, PequiError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(PequiError::transport)?;
        debug!(addr = addr, "connected to peer");
        Ok(Self::spawn_io(stream, addr.to_string()))
    }

    async fn listen(&self, addr: &str) -> Result<(String, mpsc::Receiver<PeerConn>), PequiError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(PequiError::transport)?;
        let local = listener
            .local_addr()
            .map_err(PequiError::transport)?
            .to_string();
        info!(addr = %local, "listening for peer connections");

        let (conn_tx, conn_rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let conn = TcpTransport::spawn_io(stream, peer_addr.to_string());
                        if conn_tx.send(conn).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept peer connection");
                    }
                }
            }
        });
        Ok((local, conn_rx))
    }
}

/// In-process transport: a hub wiring connection pairs over channels.
///
/// Every manager in a test or embedded cluster shares one hub; listening
/// registers an address, connecting crosses two channel pairs.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    listeners: Arc<DashMap<String, mpsc::Sender<PeerConn>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn connect(&self, addr: &str) -> Result<PeerConn, PequiError> {
        let accept_tx = self
            .listeners
            .get(addr)
            .map(|e| e.value().clone())
            .ok_or_else(|| PequiError::TransportError(format!("connection refused: {}", addr)))?;

        let (client_tx, server_rx) = mpsc::channel(CONN_QUEUE_SIZE);
        let (server_tx, client_rx) = mpsc::channel(CONN_QUEUE_SIZE);

        let server_conn = PeerConn {
            remote: format!("mem->{}", addr),
            tx: server_tx,
            rx: server_rx,
        };
        accept_tx
            .send(server_conn)
            .await
            .map_err(|_| PequiError::TransportError(format!("listener gone: {}", addr)))?;

        Ok(PeerConn {
            remote: addr.to_string(),
            tx: client_tx,
            rx: client_rx,
        })
    }

    async fn listen(&self, addr: &str) -> Result<(String, mpsc::Receiver<PeerConn>), PequiError> {
        let (conn_tx, conn_rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);
        self.listeners.insert(addr.to_string(), conn_tx);
        Ok((addr.to_string(), conn_rx))
    }
}

#[cfg(test)]
mod tests {
    use pequi_api::remote::PeerCredentials;

    use super::*;

    #[tokio::test]
    async fn test_tcp_frame_round_trip() {
        let transport = TcpTransport::new();
        let (addr, mut incoming) = transport.listen("127.0.0.1:0").await.unwrap();

        let mut client = transport.connect(&addr).await.unwrap();
        let mut server = incoming.recv().await.unwrap();

        let frame = Frame::Auth {
            credentials: PeerCredentials::sign("secret", "alpha").unwrap(),
        };
        client.tx.send(frame.clone()).await.unwrap();
        assert_eq!(server.rx.recv().await.unwrap(), frame);

        server.tx.send(Frame::Bye).await.unwrap();
        assert_eq!(client.rx.recv().await.unwrap(), Frame::Bye);
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let transport = TcpTransport::new();
        // a port nobody listens on
        let result = transport.connect("127.0.0.1:1").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_memory_round_trip() {
        let hub = MemoryTransport::new();
        let (addr, mut incoming) = hub.listen("alpha:4780").await.unwrap();
        assert_eq!(addr, "alpha:4780");

        let mut client = hub.connect("alpha:4780").await.unwrap();
        let mut server = incoming.recv().await.unwrap();

        client.tx.send(Frame::Bye).await.unwrap();
        assert_eq!(server.rx.recv().await.unwrap(), Frame::Bye);
        server.tx.send(Frame::Bye).await.unwrap();
        assert_eq!(client.rx.recv().await.unwrap(), Frame::Bye);
    }

    #[tokio::test]
    async fn test_memory_connect_unknown_address() {
        let hub = MemoryTransport::new();
        assert!(hub.connect("nowhere:1").await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_connection_ends_stream() {
        let hub = MemoryTransport::new();
        let (_, mut incoming) = hub.listen("beta:4780").await.unwrap();
        let client = hub.connect("beta:4780").await.unwrap();
        let mut server = incoming.recv().await.unwrap();

        drop(client);
        assert!(server.rx.recv().await.is_none());
    }
}
