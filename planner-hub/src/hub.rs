//! Hub core: shared state, WebSocket handler, session registry, and
//! command handling.
//!
//! Each WebSocket connection is one session. The session starts with a
//! `hello`/`welcome` handshake, then sends commands as JSON text frames.
//! The hub answers with push frames: responses go to the sender only,
//! changes are broadcast to every session in the room (the sender
//! included, so its optimistic change is confirmed by the echo).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::Instant;

use planner_proto::codec;
use planner_proto::command::{ClientCommand, ConflictChoice};
use planner_proto::event::{CommandFailure, FailureKind, PushEvent, ServerFrame};
use planner_proto::task::{AssigneeId, Task, TaskId, UserId, WorkspaceKey};

use crate::rooms::{Departure, RoomRegistry, SessionId};
use crate::workload::{WorkloadError, WorkloadStore};

/// Default window in which changes by two users count as concurrent.
pub const DEFAULT_CONCURRENT_EDIT_WINDOW: Duration = Duration::from_secs(2);

struct SessionHandle {
    user: UserId,
    sender: mpsc::UnboundedSender<Message>,
}

/// Shared hub state: sessions, rooms, and workload data.
pub struct HubState {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    next_session: AtomicU64,
    /// Room membership.
    pub rooms: RoomRegistry,
    /// Authoritative tasks and assignees.
    pub workload: WorkloadStore,
    recent_changes: Mutex<HashMap<(WorkspaceKey, TaskId), (UserId, Instant)>>,
    concurrent_edit_window: Duration,
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

impl HubState {
    /// Creates a hub with no sessions and no data.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(WorkloadStore::new(), DEFAULT_CONCURRENT_EDIT_WINDOW)
    }

    /// Creates a hub serving `workload`.
    #[must_use]
    pub fn with_config(workload: WorkloadStore, concurrent_edit_window: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            rooms: RoomRegistry::new(),
            workload,
            recent_changes: Mutex::new(HashMap::new()),
            concurrent_edit_window,
        }
    }

    async fn register(&self, user: UserId, sender: mpsc::UnboundedSender<Message>) -> SessionId {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .write()
            .await
            .insert(id, SessionHandle { user, sender });
        id
    }

    async fn unregister(&self, session: SessionId) {
        self.sessions.write().await.remove(&session);
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Push `event` to every session in `room`.
    ///
    /// Used internally for room broadcasts; also lets embedders publish
    /// backend-originated events such as alerts or batch updates.
    pub async fn publish(&self, room: &WorkspaceKey, event: PushEvent) {
        self.broadcast(room, None, event).await;
    }

    /// Set an assignee's capacity and announce it with `capacity_change`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadError::Invalid`] if the assignee is unknown.
    pub async fn set_capacity(
        &self,
        room: &WorkspaceKey,
        assignee_id: &AssigneeId,
        capacity_hours: f64,
    ) -> Result<f64, WorkloadError> {
        let capacity_hours = self
            .workload
            .set_capacity(room, assignee_id, capacity_hours)
            .await?;
        tracing::info!(room = %room, assignee = %assignee_id, capacity_hours, "capacity changed");
        let event = PushEvent::CapacityChange {
            assignee_id: assignee_id.clone(),
            capacity_hours,
        };
        self.publish(room, event).await;
        Ok(capacity_hours)
    }

    /// Push `event` to every session in `room` except `skip`.
    async fn broadcast(&self, room: &WorkspaceKey, skip: Option<SessionId>, event: PushEvent) {
        let frame = ServerFrame::in_room(room.clone(), event);
        let Some(message) = encode(&frame) else {
            return;
        };
        let members = self.rooms.members(room).await;
        let sessions = self.sessions.read().await;
        for id in members.into_iter().filter(|id| Some(*id) != skip) {
            if let Some(handle) = sessions.get(&id) {
                let _ = handle.sender.send(message.clone());
            }
        }
    }

    /// Push `frame` to one session.
    async fn send_to(&self, session: SessionId, frame: &ServerFrame) {
        let Some(message) = encode(frame) else {
            return;
        };
        if let Some(handle) = self.sessions.read().await.get(&session) {
            let _ = handle.sender.send(message);
        }
    }

    /// Send a Close frame to every session.
    ///
    /// Clients see the session end and reconnect. Useful for graceful
    /// shutdown and for testing reconnect paths.
    pub async fn close_all_connections(&self) {
        let sessions = self.sessions.read().await;
        for (id, handle) in sessions.iter() {
            tracing::info!(session = id, user = %handle.user, "sending close frame");
            let _ = handle.sender.send(Message::Close(None));
        }
    }

    /// Record that `user` changed a task; returns the other user if the
    /// change collides with theirs.
    async fn note_change(&self, room: &WorkspaceKey, task_id: &TaskId, user: &UserId) -> Option<UserId> {
        let now = Instant::now();
        let mut recent = self.recent_changes.lock().await;
        let key = (room.clone(), task_id.clone());
        let previous = recent.insert(key, (user.clone(), now));
        previous.and_then(|(other, at)| {
            (other != *user && now.duration_since(at) <= self.concurrent_edit_window)
                .then_some(other)
        })
    }
}

/// Handles an upgraded WebSocket connection for a single session.
///
/// The connection lifecycle:
/// 1. Wait for `hello` and answer `welcome`.
/// 2. Register the session.
/// 3. Handle commands until the socket closes.
/// 4. Leave any room (announcing `user_left`) and unregister.
pub async fn handle_socket(socket: WebSocket, state: Arc<HubState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let user = match wait_for_hello(&mut ws_receiver).await {
        Ok(user) => user,
        Err(reason) => {
            tracing::warn!(%reason, "handshake failed");
            let failure = ServerFrame::session(PushEvent::CommandFailed(CommandFailure {
                command: "hello".into(),
                kind: FailureKind::Validation,
                message: reason,
                task_id: None,
            }));
            if let Some(message) = encode(&failure) {
                let _ = ws_sender.send(message).await;
            }
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    let welcome = ServerFrame::session(PushEvent::Welcome { user: user.clone() });
    let Some(message) = encode(&welcome) else {
        return;
    };
    if let Err(e) = ws_sender.send(message).await {
        tracing::error!(user = %user, error = %e, "failed to send welcome");
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let session = state.register(user.clone(), tx).await;
    tracing::info!(session, user = %user, "session started");

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(session, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let reader_user = user.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => match codec::decode_command(text.as_str()) {
                    Ok(command) => {
                        handle_command(&reader_state, session, &reader_user, command).await;
                    }
                    Err(e) => tracing::warn!(session, error = %e, "malformed command"),
                },
                Message::Close(_) => {
                    tracing::info!(session, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    if let Some(departure) = state.rooms.disconnect(session).await {
        announce_departure(&state, &departure).await;
    }
    state.unregister(session).await;
    tracing::info!(session, user = %user, "session ended");
}

/// Waits for the `hello` command, returning the announced user.
async fn wait_for_hello(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Result<UserId, String> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                return match codec::decode_command(text.as_str()) {
                    Ok(ClientCommand::Hello { user }) if !user.as_str().trim().is_empty() => {
                        Ok(user)
                    }
                    Ok(ClientCommand::Hello { .. }) => Err("empty user id".into()),
                    Ok(other) => Err(format!("expected hello, got {}", other.name())),
                    Err(e) => Err(e.to_string()),
                };
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err("connection closed before hello".into())
}

/// Handles one command from a registered session.
#[allow(clippy::too_many_lines)]
async fn handle_command(state: &Arc<HubState>, session: SessionId, user: &UserId, command: ClientCommand) {
    tracing::debug!(session, command = command.name(), "command received");
    match command {
        ClientCommand::Hello { .. } => {
            tracing::warn!(session, "duplicate hello ignored");
        }
        ClientCommand::JoinRoom { room } => join(state, session, user, room).await,
        ClientCommand::LeaveRoom { room } => {
            if let Some(departure) = state.rooms.leave(&room, session).await {
                tracing::info!(session, room = %room, "left room");
                state
                    .send_to(session, &ServerFrame::in_room(room, PushEvent::RoomLeft))
                    .await;
                announce_departure(state, &departure).await;
            }
        }
        ClientCommand::BroadcastActivity {
            activity_type,
            payload,
        } => {
            let Some(room) = require_room(state, session, "broadcast_activity", None).await else {
                return;
            };
            let event = PushEvent::UserActivity {
                user: user.clone(),
                activity_type,
                payload,
                timestamp_ms: now_ms(),
            };
            state.broadcast(&room, Some(session), event).await;
        }
        ClientCommand::SubmitMove {
            task_id,
            assignee,
            start,
            end,
        } => {
            let Some(room) = require_room(state, session, "submit_move", Some(&task_id)).await
            else {
                return;
            };
            match state
                .workload
                .apply_move(&room, &task_id, assignee, start, end)
                .await
            {
                Ok(task) => {
                    tracing::info!(session, task = %task_id, "task moved");
                    let changed_by = Some(user.clone());
                    announce_change(state, &room, user, task, |task| PushEvent::TaskMoved {
                        task,
                        changed_by,
                    })
                    .await;
                }
                Err(e) => fail(state, session, "submit_move", &e, Some(task_id)).await,
            }
        }
        ClientCommand::SubmitEdit { task_id, patch } => {
            let Some(room) = require_room(state, session, "submit_edit", Some(&task_id)).await
            else {
                return;
            };
            match state.workload.apply_edit(&room, &task_id, &patch).await {
                Ok(task) => {
                    tracing::info!(session, task = %task_id, "task edited");
                    let changed_by = Some(user.clone());
                    announce_change(state, &room, user, task, |task| PushEvent::TaskUpdate {
                        task,
                        changed_by,
                    })
                    .await;
                }
                Err(e) => fail(state, session, "submit_edit", &e, Some(task_id)).await,
            }
        }
        ClientCommand::SubmitBatch { batch_id, changes } => {
            let Some(room) = require_room(state, session, "submit_batch", None).await else {
                return;
            };
            match state.workload.apply_batch(&room, &changes).await {
                Ok(tasks) => {
                    tracing::info!(session, batch = %batch_id, tasks = tasks.len(), "batch applied");
                    for task in &tasks {
                        state.note_change(&room, &task.id, user).await;
                    }
                    let event = PushEvent::BatchTaskUpdate {
                        tasks,
                        batch_id: Some(batch_id),
                    };
                    state.publish(&room, event).await;
                }
                Err(e) => {
                    let task_id = e.task_id().cloned();
                    fail(state, session, "submit_batch", &e, task_id).await;
                }
            }
        }
        ClientCommand::ResolveConflict {
            task_id,
            choice,
            task,
        } => resolve(state, session, user, task_id, choice, task).await,
        ClientCommand::FetchWorkload { room, range } => {
            let (tasks, assignees) = state.workload.snapshot(&room, range).await;
            tracing::debug!(session, room = %room, tasks = tasks.len(), ranged = range.is_some(), "snapshot sent");
            let frame = ServerFrame::in_room(
                room,
                PushEvent::WorkloadSnapshot {
                    tasks,
                    assignees,
                    range,
                },
            );
            state.send_to(session, &frame).await;
        }
    }
}

async fn join(state: &Arc<HubState>, session: SessionId, user: &UserId, room: WorkspaceKey) {
    match state.rooms.join(&room, session, user).await {
        Ok(joined) => {
            tracing::info!(session, room = %room, viewers = joined.active_users.len(), "joined room");
            if let Some(departure) = &joined.left {
                announce_departure(state, departure).await;
            }
            let ack = ServerFrame::in_room(
                room.clone(),
                PushEvent::RoomJoined {
                    active_users: joined.active_users,
                },
            );
            state.send_to(session, &ack).await;
            if joined.newly_present {
                state
                    .broadcast(&room, Some(session), PushEvent::UserJoined { user: user.clone() })
                    .await;
            }
        }
        Err(e) => {
            tracing::warn!(session, room = %room, error = %e, "join rejected");
            let frame = ServerFrame::in_room(
                room,
                PushEvent::JoinRejected {
                    reason: e.to_string(),
                },
            );
            state.send_to(session, &frame).await;
        }
    }
}

async fn resolve(
    state: &Arc<HubState>,
    session: SessionId,
    user: &UserId,
    task_id: TaskId,
    choice: ConflictChoice,
    task: Task,
) {
    let Some(room) = require_room(state, session, "resolve_conflict", Some(&task_id)).await else {
        return;
    };
    if task.id != task_id {
        let err = WorkloadError::Invalid("resolved task does not match task id".into());
        fail(state, session, "resolve_conflict", &err, Some(task_id)).await;
        return;
    }
    match choice {
        ConflictChoice::Server => {
            tracing::info!(session, task = %task_id, "conflict settled with hub version");
        }
        ConflictChoice::Local => match state.workload.replace(&room, task).await {
            Ok(task) => {
                tracing::info!(session, task = %task_id, "conflict settled with client version");
                let event = PushEvent::TaskUpdate {
                    task,
                    changed_by: Some(user.clone()),
                };
                state.publish(&room, event).await;
            }
            Err(e) => fail(state, session, "resolve_conflict", &e, Some(task_id)).await,
        },
    }
}

/// Broadcast a change, followed by `task_conflict` if another user changed
/// the same task within the concurrency window.
async fn announce_change(
    state: &Arc<HubState>,
    room: &WorkspaceKey,
    user: &UserId,
    task: Task,
    event: impl FnOnce(Task) -> PushEvent,
) {
    let other = state.note_change(room, &task.id, user).await;
    state.publish(room, event(task.clone())).await;
    if let Some(other) = other {
        tracing::warn!(task = %task.id, first = %other, second = %user, "concurrent edit");
        let users = vec![other, user.clone()];
        state.publish(room, PushEvent::TaskConflict { task, users }).await;
    }
}

async fn announce_departure(state: &Arc<HubState>, departure: &Departure) {
    if departure.gone {
        state
            .publish(
                &departure.room,
                PushEvent::UserLeft {
                    user: departure.user.clone(),
                },
            )
            .await;
    }
}

/// The session's room, or a `command_failed` reply if it has none.
async fn require_room(
    state: &Arc<HubState>,
    session: SessionId,
    command: &str,
    task_id: Option<&TaskId>,
) -> Option<WorkspaceKey> {
    let room = state.rooms.room_of(session).await;
    if room.is_none() {
        let err = WorkloadError::Invalid("not in a room".into());
        fail(state, session, command, &err, task_id.cloned()).await;
    }
    room
}

async fn fail(
    state: &Arc<HubState>,
    session: SessionId,
    command: &str,
    err: &WorkloadError,
    task_id: Option<TaskId>,
) {
    tracing::warn!(session, command, error = %err, "command failed");
    let frame = ServerFrame::session(PushEvent::CommandFailed(CommandFailure {
        command: command.to_string(),
        kind: err.failure_kind(),
        message: err.to_string(),
        task_id,
    }));
    state.send_to(session, &frame).await;
}

fn encode(frame: &ServerFrame) -> Option<Message> {
    match codec::encode_frame(frame) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            tracing::error!(event = frame.event.name(), error = %e, "failed to encode frame");
            None
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Starts the hub on the given address and returns the bound address and a
/// join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(HubState::new())).await
}

/// Starts the hub with a pre-built [`HubState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<HubState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "hub server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<HubState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
