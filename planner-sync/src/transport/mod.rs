//! Transport layer abstraction for the sync engine.
//!
//! A [`Connector`] performs one handshake with the hub and hands back a
//! [`Session`]: a pair of channels carrying decoded commands out and decoded
//! frames in. The session ends when the incoming channel closes. Reconnect
//! policy lives one level up in [`crate::connection`].
//!
//! Concrete connectors:
//! - [`ws::WsConnector`]: WebSocket client using JSON text frames
//! - [`loopback::LoopbackConnector`]: in-process channels for testing

pub mod loopback;
pub mod ws;

use std::fmt;
use std::future::Future;

use tokio::sync::mpsc;

use planner_proto::command::ClientCommand;
use planner_proto::event::ServerFrame;
use planner_proto::task::UserId;

/// Describes which kind of transport is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// WebSocket connection to a hub.
    WebSocket,
    /// In-process loopback for testing.
    Loopback,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "WebSocket"),
            Self::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection to the hub has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The hub could not be reached at the given address.
    #[error("hub at {0} is unreachable")]
    Unreachable(String),

    /// The hub answered the handshake with something other than `welcome`.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One live connection to the hub.
///
/// Dropping `outgoing` asks the transport to close the connection. The
/// transport closes `incoming` when the connection goes away for any reason.
#[derive(Debug)]
pub struct Session {
    /// Identity the hub registered for this session.
    pub user: UserId,
    /// Commands to deliver to the hub.
    pub outgoing: mpsc::Sender<ClientCommand>,
    /// Frames pushed by the hub, in arrival order.
    pub incoming: mpsc::Receiver<ServerFrame>,
}

/// Establishes sessions with the hub.
///
/// `connect` performs exactly one attempt. It may take arbitrarily long;
/// callers bound it with their own handshake timeout.
pub trait Connector: Send + Sync + 'static {
    /// Open a session and complete the `hello`/`welcome` handshake.
    fn connect(
        &self,
        user: &UserId,
    ) -> impl Future<Output = Result<Session, TransportError>> + Send;

    /// Return the type of this transport.
    fn transport_type(&self) -> TransportType;
}
