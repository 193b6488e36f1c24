//! Loopback transport for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels in place of a socket.
//! [`LoopbackConnector::create`] returns the client-side connector plus a
//! [`LoopbackAcceptor`] that plays the hub: each accepted handshake yields
//! a [`LoopbackPeer`] that can push frames, read commands, and hang up.
//!
//! The connector can be told to refuse or stall handshakes to exercise the
//! reconnect path without real networking.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use planner_proto::command::ClientCommand;
use planner_proto::event::ServerFrame;
use planner_proto::task::UserId;

use super::{Connector, Session, TransportError, TransportType};

/// How the connector answers the next handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMode {
    /// Complete the handshake and hand a peer to the acceptor.
    Accept,
    /// Fail immediately as if nothing were listening.
    Refuse,
    /// Never complete; the caller's timeout decides.
    Stall,
}

#[derive(Debug)]
struct Shared {
    mode: Mutex<HandshakeMode>,
    attempts: AtomicU32,
    accepted: mpsc::UnboundedSender<LoopbackPeer>,
}

/// Client side of the loopback transport.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    shared: Arc<Shared>,
    buffer: usize,
}

/// Hub side of the loopback transport: yields one peer per handshake.
#[derive(Debug)]
pub struct LoopbackAcceptor {
    accepted: mpsc::UnboundedReceiver<LoopbackPeer>,
}

/// Hub-side view of one accepted session.
#[derive(Debug)]
pub struct LoopbackPeer {
    /// Identity sent in the client's `hello`.
    pub user: UserId,
    /// Commands the client sent, in order.
    pub commands: mpsc::Receiver<ClientCommand>,
    frames: mpsc::Sender<ServerFrame>,
}

impl LoopbackConnector {
    /// Create a connector and its acceptor.
    ///
    /// The `buffer` parameter controls the channel capacity for each
    /// direction of every session.
    #[must_use]
    pub fn create(buffer: usize) -> (Self, LoopbackAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            mode: Mutex::new(HandshakeMode::Accept),
            attempts: AtomicU32::new(0),
            accepted: tx,
        });
        (
            Self {
                shared,
                buffer: buffer.max(1),
            },
            LoopbackAcceptor { accepted: rx },
        )
    }

    /// Change how subsequent handshakes are answered.
    pub fn set_mode(&self, mode: HandshakeMode) {
        *self.shared.mode.lock() = mode;
    }

    /// Number of handshakes attempted so far, successful or not.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for LoopbackConnector {
    async fn connect(&self, user: &UserId) -> Result<Session, TransportError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        let mode = *self.shared.mode.lock();
        match mode {
            HandshakeMode::Accept => {}
            HandshakeMode::Refuse => {
                return Err(TransportError::Unreachable("loopback".to_string()));
            }
            HandshakeMode::Stall => std::future::pending::<()>().await,
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(self.buffer);
        let (frame_tx, frame_rx) = mpsc::channel(self.buffer);
        let peer = LoopbackPeer {
            user: user.clone(),
            commands: cmd_rx,
            frames: frame_tx,
        };
        self.shared
            .accepted
            .send(peer)
            .map_err(|_| TransportError::ConnectionClosed)?;

        Ok(Session {
            user: user.clone(),
            outgoing: cmd_tx,
            incoming: frame_rx,
        })
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }
}

impl LoopbackAcceptor {
    /// Wait for the next successful handshake.
    ///
    /// Returns `None` once every connector clone has been dropped.
    pub async fn accept(&mut self) -> Option<LoopbackPeer> {
        self.accepted.recv().await
    }
}

impl LoopbackPeer {
    /// Push a frame to the client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the client dropped the session.
    pub async fn push(&self, frame: ServerFrame) -> Result<(), TransportError> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Wait for the client's next command.
    pub async fn next_command(&mut self) -> Option<ClientCommand> {
        self.commands.recv().await
    }

    /// Hang up, as if the socket had died.
    pub fn hang_up(self) {
        drop(self);
    }
}
