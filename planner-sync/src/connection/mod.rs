//! Connection supervision: one live session at a time, reconnect with
//! exponential backoff, and a terminal state once the budget runs out.
//!
//! [`ConnectionManager::spawn`] starts a supervisor task that owns the
//! current [`Session`]. Callers drive it with fire-and-forget controls
//! (`connect`, `disconnect`, `send`) and observe it through two outputs:
//!
//! - a [`watch`] channel holding the latest [`ConnectionState`], for
//!   status displays that only care about "now"
//! - an ordered [`ConnectionEvent`] stream carrying state changes,
//!   incoming frames, and send failures, for the engine
//!
//! ```text
//! engine ── control ──▶ supervisor ── Session ──▶ Connector (ws / loopback)
//!        ◀── events ───            ◀── frames ───
//! ```

pub mod backoff;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use planner_proto::command::ClientCommand;
use planner_proto::event::ServerFrame;
use planner_proto::task::UserId;

use crate::transport::{Connector, Session, TransportError, TransportType};

pub use backoff::{Backoff, ReconnectConfig};

/// Default bound on a single handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the event channel.
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Settings for a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Identity sent in `hello`.
    pub user: UserId,
    /// Bound on one handshake; expiry counts as a failed attempt.
    pub handshake_timeout: Duration,
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,
    /// Capacity of the event channel.
    pub event_buffer: usize,
}

impl ConnectionConfig {
    /// Default settings for `user`.
    #[must_use]
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            reconnect: ReconnectConfig::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Whether a session is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// No session and no handshake in flight.
    Disconnected,
    /// A handshake is in flight.
    Connecting,
    /// A session is up.
    Connected,
}

/// Observable connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    /// Link status.
    pub status: LinkStatus,
    /// An automatic reconnect is scheduled or in flight.
    pub reconnecting: bool,
    /// Consecutive failed attempts in the current budget.
    pub attempt: u32,
    /// Most recent failure, cleared on success.
    pub last_error: Option<String>,
    /// The budget ran out; only an explicit `connect` retries.
    pub terminal: bool,
}

impl ConnectionState {
    /// The initial state.
    #[must_use]
    pub const fn disconnected() -> Self {
        Self {
            status: LinkStatus::Disconnected,
            reconnecting: false,
            attempt: 0,
            last_error: None,
            terminal: false,
        }
    }

    /// Whether a session is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status == LinkStatus::Connected
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::disconnected()
    }
}

/// Ordered output of the supervisor.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The state changed.
    StateChanged(ConnectionState),
    /// The hub pushed a frame.
    Frame(ServerFrame),
    /// A command could not be handed to the transport.
    SendFailed {
        /// Wire name of the command.
        command: &'static str,
        /// Why it failed.
        error: String,
    },
    /// The reconnect budget is exhausted.
    Terminal {
        /// Attempts made in the exhausted budget.
        attempts: u32,
        /// The last failure.
        last_error: Option<String>,
    },
}

#[derive(Debug)]
enum Control {
    Connect,
    Disconnect,
    Send(ClientCommand),
    Shutdown,
}

/// Handle to the supervisor task.
///
/// Dropping the handle stops the supervisor and closes any live session.
#[derive(Debug)]
pub struct ConnectionManager {
    control: mpsc::UnboundedSender<Control>,
    state: watch::Receiver<ConnectionState>,
    transport_type: TransportType,
}

impl ConnectionManager {
    /// Spawn a supervisor for `connector` and return its handle and event stream.
    ///
    /// The supervisor starts disconnected; call [`connect`](Self::connect).
    pub fn spawn<C: Connector>(
        connector: C,
        config: ConnectionConfig,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::disconnected());
        let transport_type = connector.transport_type();

        let supervisor = Supervisor {
            connector: Arc::new(connector),
            backoff: Backoff::new(config.reconnect),
            config,
            state: ConnectionState::disconnected(),
            state_tx,
            events: event_tx,
            session: None,
            handshake: None,
            retry_at: None,
        };
        tokio::spawn(supervisor.run(control_rx));

        (
            Self {
                control: control_tx,
                state: state_rx,
                transport_type,
            },
            event_rx,
        )
    }

    /// Start connecting with a fresh attempt budget.
    ///
    /// A no-op while a session is up or a handshake is in flight. Also the
    /// only way out of the terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the supervisor has stopped.
    pub fn connect(&self) -> Result<(), TransportError> {
        self.control(Control::Connect)
    }

    /// Close the session and stop reconnecting.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the supervisor has stopped.
    pub fn disconnect(&self) -> Result<(), TransportError> {
        self.control(Control::Disconnect)
    }

    /// Queue a command for the hub.
    ///
    /// Delivery is best-effort; a failure to hand it to the transport is
    /// reported as [`ConnectionEvent::SendFailed`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the supervisor has stopped.
    pub fn send(&self, command: ClientCommand) -> Result<(), TransportError> {
        self.control(Control::Send(command))
    }

    /// Stop the supervisor.
    pub fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
    }

    /// Latest state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// A receiver that observes every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Return the type of the underlying transport.
    #[must_use]
    pub const fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    fn control(&self, control: Control) -> Result<(), TransportError> {
        self.control
            .send(control)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

type Handshake = Pin<Box<dyn Future<Output = Result<Session, TransportError>> + Send>>;

struct Supervisor<C> {
    connector: Arc<C>,
    config: ConnectionConfig,
    backoff: Backoff,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::Sender<ConnectionEvent>,
    session: Option<Session>,
    handshake: Option<Handshake>,
    retry_at: Option<Instant>,
}

impl<C: Connector> Supervisor<C> {
    async fn run(mut self, mut control: mpsc::UnboundedReceiver<Control>) {
        loop {
            let keep_going = tokio::select! {
                ctl = control.recv() => match ctl {
                    None | Some(Control::Shutdown) => false,
                    Some(ctl) => self.on_control(ctl).await,
                },
                result = finish_handshake(self.handshake.as_mut()), if self.handshake.is_some() => {
                    self.handshake = None;
                    self.on_handshake(result).await
                }
                frame = next_frame(self.session.as_mut()), if self.session.is_some() => match frame {
                    Some(frame) => self.emit(ConnectionEvent::Frame(frame)).await,
                    None => self.on_session_lost().await,
                },
                () = wait_until(self.retry_at), if self.retry_at.is_some() => {
                    self.retry_at = None;
                    self.start_handshake().await
                }
            };
            if !keep_going {
                break;
            }
        }
        tracing::debug!("connection supervisor exiting");
    }

    async fn on_control(&mut self, control: Control) -> bool {
        match control {
            Control::Connect => {
                if self.session.is_some() || self.handshake.is_some() {
                    return true;
                }
                self.backoff.reset();
                self.retry_at = None;
                self.state.terminal = false;
                self.state.last_error = None;
                self.start_handshake().await
            }
            Control::Disconnect => {
                self.session = None;
                self.handshake = None;
                self.retry_at = None;
                self.backoff.reset();
                tracing::info!("disconnected on request");
                self.publish(ConnectionState::disconnected()).await
            }
            Control::Send(command) => {
                let name = command.name();
                let error = match &self.session {
                    Some(session) => match session.outgoing.send(command).await {
                        Ok(()) => return true,
                        Err(_) => TransportError::ConnectionClosed.to_string(),
                    },
                    None => "not connected".to_string(),
                };
                tracing::warn!(command = name, %error, "command not sent");
                self.emit(ConnectionEvent::SendFailed {
                    command: name,
                    error,
                })
                .await
            }
            Control::Shutdown => false,
        }
    }

    async fn start_handshake(&mut self) -> bool {
        let connector = Arc::clone(&self.connector);
        let user = self.config.user.clone();
        let timeout = self.config.handshake_timeout;
        self.session = None;
        self.handshake = Some(Box::pin(async move {
            tokio::time::timeout(timeout, connector.connect(&user))
                .await
                .map_err(|_| TransportError::Timeout)?
        }));
        tracing::debug!(attempt = self.backoff.next_attempt(), "starting handshake");
        let next = ConnectionState {
            status: LinkStatus::Connecting,
            ..self.state.clone()
        };
        self.publish(next).await
    }

    async fn on_handshake(&mut self, result: Result<Session, TransportError>) -> bool {
        match result {
            Ok(session) => {
                tracing::info!(user = %session.user, "session established");
                self.backoff.reset();
                self.session = Some(session);
                self.publish(ConnectionState {
                    status: LinkStatus::Connected,
                    ..ConnectionState::disconnected()
                })
                .await
            }
            Err(e) => {
                let error = e.to_string();
                match self.backoff.record_failure() {
                    Some(delay) => {
                        tracing::warn!(
                            attempt = self.backoff.failures(),
                            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            %error,
                            "handshake failed, retrying"
                        );
                        self.retry_at = Some(Instant::now() + delay);
                        self.publish(ConnectionState {
                            status: LinkStatus::Disconnected,
                            reconnecting: true,
                            attempt: self.backoff.failures(),
                            last_error: Some(error),
                            terminal: false,
                        })
                        .await
                    }
                    None => {
                        let attempts = self.backoff.failures();
                        tracing::error!(attempts, %error, "reconnect budget exhausted");
                        let published = self
                            .publish(ConnectionState {
                                status: LinkStatus::Disconnected,
                                reconnecting: false,
                                attempt: attempts,
                                last_error: Some(error.clone()),
                                terminal: true,
                            })
                            .await;
                        published
                            && self
                                .emit(ConnectionEvent::Terminal {
                                    attempts,
                                    last_error: Some(error),
                                })
                                .await
                    }
                }
            }
        }
    }

    async fn on_session_lost(&mut self) -> bool {
        self.session = None;
        let delay = self.backoff.delay_for(1);
        tracing::warn!(
            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "session lost, scheduling reconnect"
        );
        self.retry_at = Some(Instant::now() + delay);
        self.publish(ConnectionState {
            status: LinkStatus::Disconnected,
            reconnecting: true,
            attempt: 0,
            last_error: Some(TransportError::ConnectionClosed.to_string()),
            terminal: false,
        })
        .await
    }

    async fn publish(&mut self, state: ConnectionState) -> bool {
        if state == self.state {
            return true;
        }
        self.state = state.clone();
        self.state_tx.send_replace(state.clone());
        self.emit(ConnectionEvent::StateChanged(state)).await
    }

    /// Returns `false` once nobody listens for events anymore.
    async fn emit(&mut self, event: ConnectionEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

async fn finish_handshake(handshake: Option<&mut Handshake>) -> Result<Session, TransportError> {
    match handshake {
        Some(handshake) => handshake.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(session: Option<&mut Session>) -> Option<ServerFrame> {
    match session {
        Some(session) => session.incoming.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
