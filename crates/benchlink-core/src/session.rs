//! Datagram session with a single measurement device.
//!
//! A [`Session`] owns at most one connected UDP socket (a *link*) and the
//! background task that reads from it. Inbound datagrams are handed to a
//! [`DatagramHandler`] in arrival order.
//!
//! - [`connect`](Session::connect) is idempotent: while a link exists it
//!   returns [`Connection::AlreadyConnected`] without dialing again.
//! - [`disconnect`](Session::disconnect) cancels the receive loop and drops
//!   the socket. Calling it again is a no-op.
//! - [`send`](Session::send) fails fast with [`SessionError::NotConnected`]
//!   when there is no link.
//! - Reads use a bounded wait. A timeout means "no data yet"; any other read
//!   error closes the link and reports it to the handler exactly once.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use benchlink_core::config::ControllerConfig;
//! use benchlink_core::session::{DatagramHandler, Session};
//!
//! struct Print;
//!
//! #[async_trait::async_trait]
//! impl DatagramHandler for Print {
//!     async fn on_datagram(&self, bytes: &[u8]) {
//!         println!("{} bytes", bytes.len());
//!     }
//!     async fn on_connection_lost(&self, error: &std::io::Error) {
//!         eprintln!("lost: {error}");
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::new(&ControllerConfig::default());
//! session.connect("192.168.1.50", 8888, Arc::new(Print)).await?;
//! session.send(b"ID;").await?;
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, trace, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::ControllerConfig;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur on the device socket.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Attempted to send without an open link.
    #[error("not connected to device")]
    NotConnected,

    /// The host name could not be resolved.
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    /// Resolution succeeded but produced no address.
    #[error("no address found for {host}")]
    NoAddress { host: String },

    /// Binding or connecting the socket failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Resolving and connecting took longer than the configured bound.
    #[error("connect timed out")]
    Timeout,

    /// An I/O error occurred on an open link.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Lifecycle of the session's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Never connected.
    Idle,
    /// A link is open and the receive loop is running.
    Connected,
    /// A link existed and has been released.
    Closed,
}

/// Outcome of [`Session::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    /// A new link was opened to this address.
    Established(SocketAddr),
    /// A link to this address already existed; nothing was dialed.
    AlreadyConnected(SocketAddr),
}

impl Connection {
    pub fn remote(&self) -> SocketAddr {
        match self {
            Connection::Established(addr) | Connection::AlreadyConnected(addr) => *addr,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Connection::Established(_))
    }
}

/// Receiver of inbound traffic for a session.
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    /// Called once per received datagram, in arrival order.
    async fn on_datagram(&self, bytes: &[u8]);

    /// Called at most once per link, after a read error closed it.
    async fn on_connection_lost(&self, error: &io::Error);
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Link {
    id: Uuid,
    remote: SocketAddr,
    socket: Arc<UdpSocket>,
    cancel_token: CancellationToken,
}

#[derive(Default)]
struct Slot {
    link: Option<Link>,
    closed: bool,
}

impl Slot {
    fn release(&mut self) -> Option<Link> {
        let link = self.link.take()?;
        self.closed = true;
        Some(link)
    }
}

/// One device connection. See the module docs for the contract.
pub struct Session {
    slot: Arc<Mutex<Slot>>,
    /// Held for a whole dial so concurrent connects open one socket.
    dial: Mutex<()>,
    shutdown: CancellationToken,
    read_timeout: Duration,
    connect_timeout: Duration,
    recv_buffer_size: usize,
    span: Span,
}

impl Session {
    pub fn new(config: &ControllerConfig) -> Self {
        Self::with_span(config, Span::current())
    }

    /// Create a session whose receive loops are children of `span`.
    pub fn with_span(config: &ControllerConfig, span: Span) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
            dial: Mutex::new(()),
            shutdown: CancellationToken::new(),
            read_timeout: config.read_timeout(),
            connect_timeout: config.connect_timeout(),
            recv_buffer_size: config.recv_buffer_size.max(1),
            span,
        }
    }

    /// Open a link to `host:port` and start the receive loop.
    ///
    /// Concurrent callers queue on the dial lock, so only one socket is ever
    /// opened. The slot itself is only locked briefly, and `send`, `state`
    /// and `disconnect` answer immediately while a dial is in flight.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        handler: Arc<dyn DatagramHandler>,
    ) -> Result<Connection, SessionError> {
        let _dial = self.dial.lock().await;
        if let Some(remote) = self.remote_addr().await {
            debug!(%remote, "already connected");
            return Ok(Connection::AlreadyConnected(remote));
        }

        let (socket, remote) = timeout(self.connect_timeout, open_socket(host, port))
            .await
            .map_err(|_| SessionError::Timeout)??;

        let mut slot = self.slot.lock().await;

        let id = Uuid::new_v4();
        let socket = Arc::new(socket);
        let cancel_token = self.shutdown.child_token();
        let span = debug_span!(parent: &self.span, "device_link", link_id = %id, %remote);

        tokio::spawn(
            receive_loop(ReceiveLoop {
                slot: Arc::downgrade(&self.slot),
                link_id: id,
                socket: socket.clone(),
                handler,
                cancel_token: cancel_token.clone(),
                read_timeout: self.read_timeout,
                buffer_size: self.recv_buffer_size,
            })
            .instrument(span),
        );

        slot.link = Some(Link {
            id,
            remote,
            socket,
            cancel_token,
        });
        slot.closed = false;
        info!(%remote, link_id = %id, "connected to device");
        Ok(Connection::Established(remote))
    }

    /// Release the link, if any. Returns `true` if a link was open.
    ///
    /// No connection-lost notification is produced for a caller-initiated
    /// disconnect.
    pub async fn disconnect(&self) -> bool {
        let released = self.slot.lock().await.release();
        match released {
            Some(link) => {
                link.cancel_token.cancel();
                info!(remote = %link.remote, link_id = %link.id, "disconnected from device");
                true
            }
            None => false,
        }
    }

    /// Write one datagram to the device.
    pub async fn send(&self, bytes: &[u8]) -> Result<usize, SessionError> {
        let socket = {
            let slot = self.slot.lock().await;
            let link = slot.link.as_ref().ok_or(SessionError::NotConnected)?;
            link.socket.clone()
        };
        trace!(bytes = bytes.len(), "sending datagram");
        Ok(socket.send(bytes).await?)
    }

    pub async fn state(&self) -> SessionState {
        let slot = self.slot.lock().await;
        match (&slot.link, slot.closed) {
            (Some(_), _) => SessionState::Connected,
            (None, true) => SessionState::Closed,
            (None, false) => SessionState::Idle,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.link.is_some()
    }

    /// Address of the device, while connected.
    pub async fn remote_addr(&self) -> Option<SocketAddr> {
        self.slot.lock().await.link.as_ref().map(|link| link.remote)
    }

    /// Local address of the socket, while connected.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let slot = self.slot.lock().await;
        slot.link
            .as_ref()
            .and_then(|link| link.socket.local_addr().ok())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("slot", &"<Mutex<Slot>>")
            .field("dial", &"<Mutex<()>>")
            .field("read_timeout", &self.read_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("recv_buffer_size", &self.recv_buffer_size)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Socket setup
// ---------------------------------------------------------------------------

async fn open_socket(host: &str, port: u16) -> Result<(UdpSocket, SocketAddr), SessionError> {
    let remote = lookup_host((host, port))
        .await
        .map_err(|source| SessionError::Resolve {
            host: host.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| SessionError::NoAddress {
            host: host.to_string(),
        })?;

    let local: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(local)
        .await
        .map_err(|source| SessionError::Connect {
            addr: remote,
            source,
        })?;
    socket
        .connect(remote)
        .await
        .map_err(|source| SessionError::Connect {
            addr: remote,
            source,
        })?;

    Ok((socket, remote))
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

struct ReceiveLoop {
    slot: Weak<Mutex<Slot>>,
    link_id: Uuid,
    socket: Arc<UdpSocket>,
    handler: Arc<dyn DatagramHandler>,
    cancel_token: CancellationToken,
    read_timeout: Duration,
    buffer_size: usize,
}

async fn receive_loop(ctx: ReceiveLoop) {
    let mut buf = vec![0u8; ctx.buffer_size];
    debug!("receive loop started");

    loop {
        let received = tokio::select! {
            _ = ctx.cancel_token.cancelled() => {
                debug!("receive loop cancelled");
                return;
            }
            received = timeout(ctx.read_timeout, ctx.socket.recv(&mut buf)) => received,
        };

        match received {
            Err(_) => {
                trace!("no data yet");
            }
            Ok(Ok(len)) => {
                trace!(bytes = len, "datagram received");
                ctx.handler.on_datagram(&buf[..len]).await;
            }
            Ok(Err(error)) => {
                warn!(%error, "receive failed, closing link");
                if release_if_current(&ctx.slot, ctx.link_id).await {
                    ctx.handler.on_connection_lost(&error).await;
                }
                return;
            }
        }
    }
}

/// Release the link only if it is still the one this loop serves, so a
/// concurrent disconnect or reconnect is never reported as a loss.
async fn release_if_current(slot: &Weak<Mutex<Slot>>, link_id: Uuid) -> bool {
    let Some(slot) = slot.upgrade() else {
        return false;
    };
    let mut slot = slot.lock().await;
    if slot.link.as_ref().map(|link| link.id) != Some(link_id) {
        return false;
    }
    slot.release().is_some()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
