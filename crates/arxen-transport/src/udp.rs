//! UDP datagram transport.
//!
//! One socket, two loops. The receive loop reads datagrams and pushes them
//! onto the inbound queue; the send loop drains the outbound queue onto the
//! socket. Callers never touch the socket: [`UdpTransport::send`] only
//! enqueues, and inbound datagrams are pulled from [`Inbound`].
//!
//! ## Lifecycle
//!
//! 1. [`UdpTransport::bind`] binds the socket and spawns both loops.
//! 2. The owner hands [`Inbound`] to its consumer and keeps the transport.
//! 3. [`UdpTransport::close`] signals shutdown, joins both loops, and drops
//!    whatever is still queued in either direction.
//!
//! Dropping the transport without calling `close` also stops both loops,
//! since the shutdown channel closes with it, but nothing waits for them.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::wire::MAX_DATAGRAM_SIZE;
use crate::TransportError;

/// Default UDP port.
pub const DEFAULT_PORT: u16 = 55667;

/// Default capacity of each of the inbound and outbound queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Configuration for a [`UdpTransport`].
#[derive(Clone, Debug)]
pub struct UdpConfig {
    /// Local address to bind to.
    pub bind_addr: SocketAddr,
    /// Capacity of the inbound and outbound queues.
    pub queue_capacity: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// One datagram and its remote peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    /// Payload bytes.
    pub data: Vec<u8>,
    /// Source (inbound) or destination (outbound) address.
    pub addr: SocketAddr,
}

/// Cloneable, non-blocking handle for enqueueing outbound datagrams.
#[derive(Clone, Debug)]
pub struct UdpSender {
    outbound: mpsc::Sender<Datagram>,
}

impl UdpSender {
    /// Enqueue `data` for delivery to `addr` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PayloadTooLarge`] for payloads above
    /// [`MAX_DATAGRAM_SIZE`], [`TransportError::QueueFull`] if the outbound
    /// queue is saturated, and [`TransportError::Closed`] once the send loop
    /// has stopped.
    pub fn send(&self, data: Vec<u8>, addr: SocketAddr) -> Result<(), TransportError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: data.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        self.outbound
            .try_send(Datagram { data, addr })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            })
    }
}

/// The inbound datagram stream.
///
/// Yields nothing once the transport has been closed, even if datagrams are
/// still queued.
#[derive(Debug)]
pub struct Inbound {
    rx: mpsc::Receiver<Datagram>,
    shutdown: watch::Receiver<bool>,
}

impl Inbound {
    /// Wait for the next datagram. Returns `None` after the transport closes.
    pub async fn recv(&mut self) -> Option<Datagram> {
        if *self.shutdown.borrow() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => None,
            next = self.rx.recv() => next,
        }
    }

    /// Take up to `max` already-queued datagrams without waiting.
    pub fn drain(&mut self, max: usize) -> Vec<Datagram> {
        let mut out = Vec::new();
        if *self.shutdown.borrow() {
            return out;
        }
        while out.len() < max {
            match self.rx.try_recv() {
                Ok(datagram) => out.push(datagram),
                Err(_) => break,
            }
        }
        out
    }
}

/// A bound UDP socket with its receive and send loops.
pub struct UdpTransport {
    local_addr: SocketAddr,
    sender: UdpSender,
    shutdown: watch::Sender<bool>,
    recv_task: JoinHandle<()>,
    send_task: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind the socket and start both I/O loops.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Binding`] if the socket cannot be bound.
    pub async fn bind(config: UdpConfig) -> Result<(Self, Inbound), TransportError> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|e| TransportError::Binding(format!("{}: {e}", config.bind_addr)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| TransportError::Binding(e.to_string()))?;
        let socket = Arc::new(socket);

        let capacity = config.queue_capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let recv_task = tokio::spawn(recv_loop(
            socket.clone(),
            inbound_tx,
            shutdown_rx.clone(),
        ));
        let send_task = tokio::spawn(send_loop(socket, outbound_rx, shutdown_rx.clone()));

        info!(%local_addr, "UDP transport bound");

        Ok((
            Self {
                local_addr,
                sender: UdpSender {
                    outbound: outbound_tx,
                },
                shutdown: shutdown_tx,
                recv_task,
                send_task,
            },
            Inbound {
                rx: inbound_rx,
                shutdown: shutdown_rx,
            },
        ))
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A cloneable handle for enqueueing outbound datagrams.
    pub fn sender(&self) -> UdpSender {
        self.sender.clone()
    }

    /// Enqueue a datagram. See [`UdpSender::send`].
    pub fn send(&self, data: Vec<u8>, addr: SocketAddr) -> Result<(), TransportError> {
        self.sender.send(data, addr)
    }

    /// Stop both loops, wait for them to exit, and discard queued data.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.recv_task.await {
            warn!(error = %e, "UDP receive loop ended abnormally");
        }
        if let Err(e) = self.send_task.await {
            warn!(error = %e, "UDP send loop ended abnormally");
        }
        info!(local_addr = %self.local_addr, "UDP transport closed");
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    inbound: mpsc::Sender<Datagram>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("UDP receive loop started");
    // One spare byte so oversized datagrams are detected rather than truncated.
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, addr)) if len > MAX_DATAGRAM_SIZE => {
                    warn!(peer = %addr, "Dropping oversized datagram");
                }
                Ok((len, addr)) => {
                    trace!(peer = %addr, len, "Datagram received");
                    let datagram = Datagram { data: buf[..len].to_vec(), addr };
                    match inbound.try_send(datagram) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(peer = %addr, "Inbound queue full, dropping datagram");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                Err(e) => {
                    // ICMP errors surface here on some platforms; the socket stays usable.
                    debug!(error = %e, "UDP receive error");
                }
            },
        }
    }
    debug!("UDP receive loop stopped");
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::Receiver<Datagram>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("UDP send loop started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = outbound.recv() => match next {
                Some(datagram) => {
                    if let Err(e) = socket.send_to(&datagram.data, datagram.addr).await {
                        warn!(peer = %datagram.addr, error = %e, "UDP send failed");
                    }
                }
                None => break,
            },
        }
    }
    debug!("UDP send loop stopped");
}
