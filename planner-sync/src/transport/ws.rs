//! WebSocket transport to a planner hub.
//!
//! Every command and frame is a single JSON text message. After the socket
//! opens the client sends `hello` and waits for `welcome`; only then is the
//! session handed to the caller. A background pump task owns the socket and
//! shuttles messages between it and the session channels.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use planner_proto::codec;
use planner_proto::command::ClientCommand;
use planner_proto::event::{PushEvent, ServerFrame};
use planner_proto::task::UserId;

use super::{Connector, Session, TransportError, TransportType};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connects to a hub over WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    /// The hub URL (ws:// or wss://).
    url: String,
    /// Capacity of the session channels in each direction.
    buffer: usize,
}

impl WsConnector {
    /// Creates a connector for `url` with session channels of `buffer` slots.
    pub fn new(url: impl Into<String>, buffer: usize) -> Self {
        Self {
            url: url.into(),
            buffer: buffer.max(1),
        }
    }

    /// Return the hub URL this connector dials.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    /// Dial the hub, send `hello`, and wait for `welcome`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Unreachable`] if nothing listens at the URL.
    /// - [`TransportError::Handshake`] if the hub answers with anything but `welcome`.
    /// - [`TransportError::ConnectionClosed`] if the socket closes mid-handshake.
    /// - [`TransportError::Io`] for other socket failures.
    async fn connect(&self, user: &UserId) -> Result<Session, TransportError> {
        let (mut ws, _response) = connect_async(self.url.as_str()).await.map_err(|e| {
            tracing::warn!(url = %self.url, err = %e, "hub WebSocket connect failed");
            map_ws_connect_error(&self.url, e)
        })?;

        let hello = ClientCommand::Hello { user: user.clone() };
        let text = codec::encode_command(&hello)
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        ws.send(Message::text(text)).await.map_err(|e| {
            tracing::warn!(err = %e, "failed to send hello");
            TransportError::Io(std::io::Error::other(format!("failed to send hello: {e}")))
        })?;

        let registered = await_welcome(&mut ws).await?;
        tracing::info!(user = %registered, url = %self.url, "connected to hub");

        let (out_tx, out_rx) = mpsc::channel(self.buffer);
        let (in_tx, in_rx) = mpsc::channel(self.buffer);
        tokio::spawn(pump(ws, out_rx, in_tx));

        Ok(Session {
            user: registered,
            outgoing: out_tx,
            incoming: in_rx,
        })
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }
}

/// Reads frames until the hub's answer to `hello` arrives.
async fn await_welcome(ws: &mut WsStream) -> Result<UserId, TransportError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => match codec::decode_frame(text.as_str()) {
                Ok(ServerFrame {
                    event: PushEvent::Welcome { user },
                    ..
                }) => return Ok(user),
                Ok(ServerFrame {
                    event: PushEvent::CommandFailed(failure),
                    ..
                }) => {
                    tracing::warn!(reason = %failure.message, "hub rejected hello");
                    return Err(TransportError::Handshake(failure.message));
                }
                Ok(other) => {
                    tracing::warn!(event = other.event.name(), "unexpected frame during handshake");
                    return Err(TransportError::Handshake(format!(
                        "expected welcome, got {}",
                        other.event.name()
                    )));
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed handshake response");
                    return Err(TransportError::Handshake(e.to_string()));
                }
            },
            Some(Ok(Message::Close(_))) | None => {
                tracing::warn!("hub closed connection during handshake");
                return Err(TransportError::ConnectionClosed);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::warn!(err = %e, "WebSocket error during handshake");
                return Err(TransportError::Io(std::io::Error::other(format!(
                    "WebSocket error during handshake: {e}"
                ))));
            }
        }
    }
}

/// Background task owning the socket for the lifetime of a session.
///
/// Exits when the hub closes the socket, on a read or write error, or when
/// the session's command sender is dropped. Dropping `incoming` on exit is
/// what tells the connection manager the session ended.
async fn pump(
    ws: WsStream,
    mut outgoing: mpsc::Receiver<ClientCommand>,
    incoming: mpsc::Sender<ServerFrame>,
) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            cmd = outgoing.recv() => {
                let Some(cmd) = cmd else {
                    tracing::debug!("session dropped, closing socket");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let text = match codec::encode_command(&cmd) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(command = cmd.name(), err = %e, "failed to encode command");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::text(text)).await {
                    tracing::warn!(command = cmd.name(), err = %e, "hub send failed");
                    break;
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match codec::decode_frame(text.as_str()) {
                    Ok(frame) => {
                        if incoming.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // Skip malformed frames instead of dropping the session.
                        tracing::warn!(err = %e, "malformed hub frame, skipping");
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("hub closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(err = %e, "hub WebSocket read error");
                    break;
                }
            },
        }
    }
    tracing::debug!("hub pump task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) => TransportError::Io(std::io::Error::other(format!(
            "hub HTTP error: status {}",
            response.status()
        ))),
        other => TransportError::Io(std::io::Error::other(format!(
            "hub connection error: {other}"
        ))),
    }
}
