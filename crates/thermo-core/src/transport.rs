//! Datagram transport for the radio link
//!
//! The physical radio driver is an external collaborator; this module only
//! defines the boundary the tasks depend on ([`PacketTransport`]) plus two
//! stand-ins: a UDP socket pair for running the nodes as separate processes
//! and an in-memory lossy link for tests and simulation.
//!
//! Delivery is unreliable and unacknowledged. A send that goes nowhere is
//! not an error, and callers treat every [`TransportError`] as "skip this
//! cycle".

use parking_lot::Mutex;
use rand::Rng;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use thiserror::Error;

/// Largest datagram a transport will hand back
pub const MAX_DATAGRAM: usize = 64;

/// Transport failures. None of these are fatal to a node.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket or driver error
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// Address could not be resolved
    #[error("cannot resolve address {0}")]
    Address(String),

    /// The other end of an in-memory link was dropped
    #[error("link disconnected")]
    Disconnected,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Send/receive raw datagrams over an unreliable peer-to-peer link.
pub trait PacketTransport: Send + Sync {
    /// Send one datagram to the peer. Silent loss is not reported.
    fn send(&self, datagram: &[u8]) -> TransportResult<()>;

    /// Wait up to `timeout` for one datagram.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    fn recv_timeout(&self, timeout: Duration) -> TransportResult<Option<Vec<u8>>>;
}

// ============================================================================
// UDP
// ============================================================================

/// UDP datagrams standing in for the radio link.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpTransport {
    /// Bind `bind` and send everything to `peer`.
    pub fn bind(bind: &str, peer: &str) -> TransportResult<Self> {
        let socket = UdpSocket::bind(bind)?;
        let peer = peer
            .to_socket_addrs()
            .map_err(|_| TransportError::Address(peer.to_string()))?
            .next()
            .ok_or_else(|| TransportError::Address(peer.to_string()))?;

        tracing::debug!(local = ?socket.local_addr().ok(), %peer, "UDP transport bound");
        Ok(Self { socket, peer })
    }

    /// Local address actually bound (useful with port 0)
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl PacketTransport for UdpTransport {
    fn send(&self, datagram: &[u8]) -> TransportResult<()> {
        match self.socket.send_to(datagram, self.peer) {
            Ok(_) => Ok(()),
            // Peer not listening yet; the radio would simply lose the frame
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn recv_timeout(&self, timeout: Duration) -> TransportResult<Option<Vec<u8>>> {
        // A zero timeout would make the socket blocking
        let timeout = timeout.max(Duration::from_millis(1));
        self.socket.set_read_timeout(Some(timeout))?;

        let mut buf = [0u8; MAX_DATAGRAM];
        match self.socket.recv_from(&mut buf) {
            Ok((len, _from)) => Ok(Some(buf[..len].to_vec())),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::ConnectionRefused
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// In-memory link
// ============================================================================

/// One end of an in-memory datagram link.
pub struct LoopbackLink {
    tx: Sender<Vec<u8>>,
    rx: Mutex<Receiver<Vec<u8>>>,
    loss: f64,
}

impl LoopbackLink {
    /// Create two connected, lossless ends.
    pub fn pair() -> (LoopbackLink, LoopbackLink) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (
            LoopbackLink {
                tx: a_tx,
                rx: Mutex::new(a_rx),
                loss: 0.0,
            },
            LoopbackLink {
                tx: b_tx,
                rx: Mutex::new(b_rx),
                loss: 0.0,
            },
        )
    }

    /// Drop outgoing datagrams with probability `loss` (0.0 to 1.0).
    pub fn with_loss(mut self, loss: f64) -> Self {
        self.loss = loss.clamp(0.0, 1.0);
        self
    }
}

impl std::fmt::Debug for LoopbackLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackLink").field("loss", &self.loss).finish()
    }
}

impl PacketTransport for LoopbackLink {
    fn send(&self, datagram: &[u8]) -> TransportResult<()> {
        if self.loss > 0.0 && rand::thread_rng().gen_bool(self.loss) {
            tracing::trace!(len = datagram.len(), "loopback dropped datagram");
            return Ok(());
        }
        self.tx
            .send(datagram.to_vec())
            .map_err(|_| TransportError::Disconnected)
    }

    fn recv_timeout(&self, timeout: Duration) -> TransportResult<Option<Vec<u8>>> {
        let rx = self.rx.lock();
        match rx.recv_timeout(timeout) {
            Ok(datagram) => Ok(Some(datagram)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }
}
