//! The per-session sync engine.
//!
//! [`SyncEngine::spawn`] builds every component (connection manager, room
//! session, entity store, cache) and moves them into one tokio task. That
//! task is the only owner of the store: UI commands, connection events, and
//! the presence sweep are all turned into [`EngineInput`] and handled in
//! arrival order, so nothing needs a lock.
//!
//! ```text
//! SyncHandle ── EngineCommand ──▶ ┌──────────────┐ ── ClientCommand ──▶ ConnectionManager
//!                                 │  SyncEngine  │
//! UI ◀────────── Notification ─── └──────────────┘ ◀── ConnectionEvent ──
//! ```
//!
//! Local changes are applied to the store before their command is sent.
//! Submission failures land on the error feed and never roll anything back.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use planner_proto::command::{ClientCommand, ConflictChoice, DateRange, TaskChange};
use planner_proto::event::{ActivityPayload, Alert, PushEvent, Recommendation, ServerFrame};
use planner_proto::task::{Assignee, AssigneeId, Task, TaskId, TaskPatch, UserId, WorkspaceKey};

use crate::cache::CacheLayer;
use crate::clock::Clock;
use crate::connection::{ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState};
use crate::error::{ErrorKind, SyncError};
use crate::room::{ActivityRecord, DEFAULT_ACTIVITY_TTL, JoinAck, RoomError, RoomSession};
use crate::store::{ApplyOutcome, Conflict, EntityStore, MutationToken, StoreError, StoreOp};
use crate::transport::Connector;

/// Most recent workload alerts kept.
pub const DEFAULT_ALERT_CAPACITY: usize = 20;

/// Most recent recommendations kept.
pub const DEFAULT_RECOMMENDATION_CAPACITY: usize = 10;

/// Default interval of the activity sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Settings for a [`SyncEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Connection settings, including the local user.
    pub connection: ConnectionConfig,
    /// How long a peer's activity stays visible.
    pub activity_ttl: Duration,
    /// How often expired activity is swept.
    pub sweep_interval: Duration,
    /// Size of the alert log.
    pub alert_capacity: usize,
    /// Size of the recommendation log.
    pub recommendation_capacity: usize,
    /// Capacity of the command and notification channels.
    pub channel_capacity: usize,
}

impl EngineConfig {
    /// Default settings for `user`.
    #[must_use]
    pub fn new(user: UserId) -> Self {
        Self {
            connection: ConnectionConfig::new(user),
            activity_ttl: DEFAULT_ACTIVITY_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            alert_capacity: DEFAULT_ALERT_CAPACITY,
            recommendation_capacity: DEFAULT_RECOMMENDATION_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Errors returned through a [`SyncHandle`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Joining or leaving a room failed.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The request needs a workspace and none is loaded.
    #[error("no workspace is loaded")]
    NoWorkspace,

    /// The engine task has stopped.
    #[error("sync engine is not running")]
    Stopped,
}

/// What the engine tells the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// The connection state changed.
    ConnectionChanged(ConnectionState),
    /// An automatic reconnect is scheduled.
    Reconnecting {
        /// Consecutive failed attempts so far.
        attempt: u32,
    },
    /// The room is live.
    RoomJoined {
        /// Which room.
        room: WorkspaceKey,
        /// Whether this re-established membership after a reconnect.
        rejoined: bool,
    },
    /// The room was left or switched away from.
    RoomLeft {
        /// Which room.
        room: WorkspaceKey,
    },
    /// The set of viewers in the room changed.
    PresenceChanged {
        /// Current viewers.
        active_users: Vec<UserId>,
    },
    /// A peer reported activity.
    PeerActivity(ActivityRecord),
    /// Activity records expired.
    ActivityExpired(Vec<UserId>),
    /// Tasks or assignees changed; derived statistics are stale.
    StoreChanged,
    /// The hub confirmed a local change.
    MutationConfirmed {
        /// The confirmed task.
        task_id: TaskId,
        /// The confirmed change.
        token: MutationToken,
    },
    /// A remote event contradicts an unconfirmed local change.
    ConflictDetected(Conflict),
    /// The hub reported simultaneous edits of a task.
    ConcurrentEdit {
        /// The task.
        task_id: TaskId,
        /// Who edited it.
        users: Vec<UserId>,
    },
    /// A conflict was settled.
    ConflictResolved {
        /// The task.
        task_id: TaskId,
        /// Which side was kept.
        choice: ConflictChoice,
    },
    /// A workload alert arrived.
    Alert(Alert),
    /// A recommendation arrived.
    Recommendation(Recommendation),
    /// Something failed outside a caller's request.
    Error(SyncError),
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;
type Query = Box<dyn FnOnce(&EngineView<'_>) + Send>;

/// Requests accepted by the engine task.
pub enum EngineCommand {
    /// Start connecting.
    Connect,
    /// Disconnect without reconnecting.
    Disconnect,
    /// Join a workspace room.
    Join {
        /// Room to join.
        key: WorkspaceKey,
        /// Answered once the hub acknowledges or refuses the join.
        reply: Reply<JoinAck>,
    },
    /// Leave a workspace room.
    Leave {
        /// Room to leave.
        key: WorkspaceKey,
    },
    /// Move a task.
    MoveTask {
        /// Task to move.
        task_id: TaskId,
        /// New assignee.
        assignee: Option<AssigneeId>,
        /// New start.
        start: Option<NaiveDateTime>,
        /// New end.
        end: Option<NaiveDateTime>,
        /// Answered as soon as the change is applied locally.
        reply: Reply<MutationToken>,
    },
    /// Edit a task.
    EditTask {
        /// Task to edit.
        task_id: TaskId,
        /// Fields to change.
        patch: TaskPatch,
        /// Answered as soon as the change is applied locally.
        reply: Reply<MutationToken>,
    },
    /// Apply several changes as one unit and submit them together.
    SubmitBatch {
        /// Changes, in order.
        changes: Vec<TaskChange>,
        /// One token per change, answered once applied locally.
        reply: Reply<Vec<MutationToken>>,
    },
    /// Undo unconfirmed changes to a task.
    RevertTask {
        /// Task to revert.
        task_id: TaskId,
        /// The restored task.
        reply: Reply<Task>,
    },
    /// Settle a conflict.
    ResolveConflict {
        /// Task in conflict.
        task_id: TaskId,
        /// Side to keep.
        choice: ConflictChoice,
        /// The version now shown.
        reply: Reply<Task>,
    },
    /// Tell peers what this user is doing.
    BroadcastActivity {
        /// Kind of activity.
        activity_type: String,
        /// Details.
        payload: ActivityPayload,
    },
    /// Drop the cached snapshot and fetch the workspace again.
    Refresh,
    /// Fetch the current workspace, optionally limited to a date window.
    FetchWorkload {
        /// Window to fetch; `None` fetches everything.
        range: Option<DateRange>,
        /// Answered once the request is sent.
        reply: Reply<()>,
    },
    /// Forget an alert.
    DismissAlert {
        /// Alert to drop.
        alert_id: String,
        /// Whether the alert was present.
        reply: Reply<bool>,
    },
    /// Forget a recommendation.
    DismissRecommendation {
        /// Recommendation to drop.
        recommendation_id: String,
        /// Whether the recommendation was present.
        reply: Reply<bool>,
    },
    /// Run a read-only closure against the engine state.
    Query(Query),
    /// Stop the engine.
    Shutdown(oneshot::Sender<()>),
}

impl std::fmt::Debug for EngineCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connect => "Connect",
            Self::Disconnect => "Disconnect",
            Self::Join { .. } => "Join",
            Self::Leave { .. } => "Leave",
            Self::MoveTask { .. } => "MoveTask",
            Self::EditTask { .. } => "EditTask",
            Self::SubmitBatch { .. } => "SubmitBatch",
            Self::RevertTask { .. } => "RevertTask",
            Self::ResolveConflict { .. } => "ResolveConflict",
            Self::BroadcastActivity { .. } => "BroadcastActivity",
            Self::Refresh => "Refresh",
            Self::FetchWorkload { .. } => "FetchWorkload",
            Self::DismissAlert { .. } => "DismissAlert",
            Self::DismissRecommendation { .. } => "DismissRecommendation",
            Self::Query(_) => "Query",
            Self::Shutdown(_) => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Everything the dispatch loop reacts to.
#[derive(Debug)]
pub enum EngineInput {
    /// A request from a [`SyncHandle`].
    Command(EngineCommand),
    /// Output of the connection manager.
    Connection(ConnectionEvent),
    /// The presence sweep timer fired.
    Sweep,
}

/// Read-only view of the engine state handed to queries.
#[derive(Debug)]
pub struct EngineView<'a> {
    /// Tasks, assignees, pending changes, and conflicts.
    pub store: &'a EntityStore,
    /// Room membership and presence.
    pub room: &'a RoomSession,
    /// Workspace whose data the store holds.
    pub workspace: Option<&'a WorkspaceKey>,
    /// Recent alerts, newest first.
    pub alerts: &'a VecDeque<Alert>,
    /// Recent recommendations, newest first.
    pub recommendations: &'a VecDeque<Recommendation>,
    /// Current time in ms, from the engine's clock.
    pub now_ms: u64,
}

impl EngineView<'_> {
    /// Current time as a naive UTC timestamp, for date comparisons.
    #[must_use]
    pub fn now(&self) -> NaiveDateTime {
        i64::try_from(self.now_ms)
            .ok()
            .and_then(chrono::DateTime::from_timestamp_millis)
            .unwrap_or_default()
            .naive_utc()
    }
}

/// Cloneable handle to a running engine.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<EngineCommand>,
    connection: watch::Receiver<ConnectionState>,
}

impl SyncHandle {
    /// Start connecting.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] if the engine is gone.
    pub async fn connect(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Connect).await
    }

    /// Disconnect and stop reconnecting.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] if the engine is gone.
    pub async fn disconnect(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Disconnect).await
    }

    /// Join `key`, waiting for the hub's answer.
    ///
    /// Fails immediately when not connected.
    ///
    /// # Errors
    ///
    /// - [`RoomError::NotConnected`] if the connection is down.
    /// - [`RoomError::Rejected`] if the hub refused.
    /// - [`RoomError::Interrupted`] / [`RoomError::Superseded`] if the join
    ///   was abandoned before an answer arrived.
    pub async fn join(&self, key: impl Into<WorkspaceKey>) -> Result<JoinAck, EngineError> {
        let key = key.into();
        self.request(|reply| EngineCommand::Join { key, reply }).await
    }

    /// Leave `key` if it is the current room.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] if the engine is gone.
    pub async fn leave(&self, key: impl Into<WorkspaceKey>) -> Result<(), EngineError> {
        self.send(EngineCommand::Leave { key: key.into() }).await
    }

    /// Move a task; returns once applied locally.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the move is rejected.
    pub async fn move_task(
        &self,
        task_id: impl Into<TaskId>,
        assignee: Option<AssigneeId>,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> Result<MutationToken, EngineError> {
        let task_id = task_id.into();
        self.request(|reply| EngineCommand::MoveTask {
            task_id,
            assignee,
            start,
            end,
            reply,
        })
        .await
    }

    /// Edit a task; returns once applied locally.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the edit is rejected.
    pub async fn edit_task(
        &self,
        task_id: impl Into<TaskId>,
        patch: TaskPatch,
    ) -> Result<MutationToken, EngineError> {
        let task_id = task_id.into();
        self.request(|reply| EngineCommand::EditTask {
            task_id,
            patch,
            reply,
        })
        .await
    }

    /// Apply several changes at once; returns one token per change once
    /// applied locally. Either every change applies or none does.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if any change is rejected.
    pub async fn submit_batch(
        &self,
        changes: Vec<TaskChange>,
    ) -> Result<Vec<MutationToken>, EngineError> {
        self.request(|reply| EngineCommand::SubmitBatch { changes, reply })
            .await
    }

    /// Undo unconfirmed changes to a task.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if there is nothing to revert.
    pub async fn revert_task(&self, task_id: impl Into<TaskId>) -> Result<Task, EngineError> {
        let task_id = task_id.into();
        self.request(|reply| EngineCommand::RevertTask { task_id, reply })
            .await
    }

    /// Settle a conflict and re-fetch the workspace.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the task has no open conflict.
    pub async fn resolve_conflict(
        &self,
        task_id: impl Into<TaskId>,
        choice: ConflictChoice,
    ) -> Result<Task, EngineError> {
        let task_id = task_id.into();
        self.request(|reply| EngineCommand::ResolveConflict {
            task_id,
            choice,
            reply,
        })
        .await
    }

    /// Tell peers what this user is doing. Dropped when the room is not live.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] if the engine is gone.
    pub async fn broadcast_activity(
        &self,
        activity_type: impl Into<String>,
        payload: ActivityPayload,
    ) -> Result<(), EngineError> {
        self.send(EngineCommand::BroadcastActivity {
            activity_type: activity_type.into(),
            payload,
        })
        .await
    }

    /// Drop the cached snapshot and fetch the workspace again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] if the engine is gone.
    pub async fn refresh(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Refresh).await
    }

    /// Fetch the current workspace. A ranged fetch merges the tasks in the
    /// window into the store and leaves the rest untouched.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoWorkspace`] if no room was joined yet.
    pub async fn fetch_workload(&self, range: Option<DateRange>) -> Result<(), EngineError> {
        self.request(|reply| EngineCommand::FetchWorkload { range, reply })
            .await
    }

    /// Drop an alert from the log.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] if the engine is gone.
    pub async fn dismiss_alert(&self, alert_id: impl Into<String>) -> Result<bool, EngineError> {
        let alert_id = alert_id.into();
        self.request(|reply| EngineCommand::DismissAlert { alert_id, reply })
            .await
    }

    /// Drop a recommendation from the log.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] if the engine is gone.
    pub async fn dismiss_recommendation(
        &self,
        recommendation_id: impl Into<String>,
    ) -> Result<bool, EngineError> {
        let recommendation_id = recommendation_id.into();
        self.request(|reply| EngineCommand::DismissRecommendation {
            recommendation_id,
            reply,
        })
        .await
    }

    /// Run `f` against the engine state and return its result.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] if the engine is gone.
    pub async fn query<R, F>(&self, f: F) -> Result<R, EngineError>
    where
        R: Send + 'static,
        F: FnOnce(&EngineView<'_>) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let query: Query = Box::new(move |view: &EngineView<'_>| {
            let _ = tx.send(f(view));
        });
        self.send(EngineCommand::Query(query)).await?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Run `f` against the entity store.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] if the engine is gone.
    pub async fn with_store<R, F>(&self, f: F) -> Result<R, EngineError>
    where
        R: Send + 'static,
        F: FnOnce(&EntityStore) -> R + Send + 'static,
    {
        self.query(move |view| f(view.store)).await
    }

    /// Latest connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.borrow().clone()
    }

    /// A receiver observing every connection state change.
    #[must_use]
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Stop the engine and close the connection. Waits for the loop to exit.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(EngineCommand::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Stopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }
}

/// The engine task's state.
pub struct SyncEngine {
    config: EngineConfig,
    connection: ConnectionManager,
    room: RoomSession,
    store: EntityStore,
    cache: CacheLayer,
    clock: Arc<dyn Clock>,
    notifications: mpsc::Sender<Notification>,
    workspace: Option<WorkspaceKey>,
    warm: bool,
    link_up: bool,
    pending_join: Option<(WorkspaceKey, Reply<JoinAck>)>,
    alerts: VecDeque<Alert>,
    recommendations: VecDeque<Recommendation>,
}

impl SyncEngine {
    /// Build the engine around `connector` and start its task.
    ///
    /// Returns the handle and the notification stream. The engine starts
    /// disconnected.
    pub fn spawn<C: Connector>(
        connector: C,
        config: EngineConfig,
        cache: CacheLayer,
        clock: Arc<dyn Clock>,
    ) -> (SyncHandle, mpsc::Receiver<Notification>) {
        let capacity = config.channel_capacity.max(1);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (notify_tx, notify_rx) = mpsc::channel(capacity);
        let (connection, events) = ConnectionManager::spawn(connector, config.connection.clone());
        let handle = SyncHandle {
            commands: command_tx,
            connection: connection.subscribe(),
        };

        let engine = Self {
            room: RoomSession::new(config.connection.user.clone(), config.activity_ttl),
            alerts: VecDeque::with_capacity(config.alert_capacity),
            recommendations: VecDeque::with_capacity(config.recommendation_capacity),
            config,
            connection,
            store: EntityStore::new(),
            cache,
            clock,
            notifications: notify_tx,
            workspace: None,
            warm: false,
            link_up: false,
            pending_join: None,
        };
        tokio::spawn(engine.run(command_rx, events));
        (handle, notify_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut events: mpsc::Receiver<ConnectionEvent>,
    ) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        let mut stopped = None;
        loop {
            let input = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(EngineCommand::Shutdown(done)) => {
                        stopped = Some(done);
                        break;
                    }
                    Some(cmd) => EngineInput::Command(cmd),
                    None => break,
                },
                event = events.recv() => match event {
                    Some(event) => EngineInput::Connection(event),
                    None => break,
                },
                _ = sweep.tick() => EngineInput::Sweep,
            };
            self.handle(input).await;
        }

        drop(commands);
        self.connection.shutdown();
        tracing::info!("sync engine stopped");
        if let Some(done) = stopped {
            let _ = done.send(());
        }
    }

    async fn handle(&mut self, input: EngineInput) {
        match input {
            EngineInput::Command(command) => self.on_command(command).await,
            EngineInput::Connection(event) => self.on_connection_event(event).await,
            EngineInput::Sweep => self.on_sweep().await,
        }
    }

    async fn on_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Connect => {
                if self.connection.connect().is_err() {
                    self.report_stopped_connection().await;
                }
            }
            EngineCommand::Disconnect => {
                if self.connection.disconnect().is_err() {
                    self.report_stopped_connection().await;
                }
            }
            EngineCommand::Join { key, reply } => self.join(key, reply).await,
            EngineCommand::Leave { key } => self.leave(&key).await,
            EngineCommand::MoveTask {
                task_id,
                assignee,
                start,
                end,
                reply,
            } => {
                let result = self.move_task(task_id, assignee, start, end).await;
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineCommand::EditTask {
                task_id,
                patch,
                reply,
            } => {
                let result = self.edit_task(task_id, patch).await;
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineCommand::SubmitBatch { changes, reply } => {
                let result = self.submit_batch(changes).await;
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineCommand::RevertTask { task_id, reply } => {
                let result = self.store.revert(&task_id);
                if result.is_ok() {
                    self.notify(Notification::StoreChanged).await;
                }
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineCommand::ResolveConflict {
                task_id,
                choice,
                reply,
            } => {
                let result = self.resolve(&task_id, choice).await;
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineCommand::BroadcastActivity {
                activity_type,
                payload,
            } => match self.room.broadcast_activity(activity_type, payload) {
                Some(command) => self.send(command).await,
                None => tracing::debug!("room not live, activity dropped"),
            },
            EngineCommand::Refresh => {
                if let Some(key) = self.workspace.clone() {
                    self.cache.invalidate(&key);
                    self.warm = false;
                    self.fetch(key).await;
                }
            }
            EngineCommand::FetchWorkload { range, reply } => {
                let result = match self.workspace.clone() {
                    Some(key) => {
                        self.fetch_range(key, range).await;
                        Ok(())
                    }
                    None => Err(EngineError::NoWorkspace),
                };
                let _ = reply.send(result);
            }
            EngineCommand::DismissAlert { alert_id, reply } => {
                let _ = reply.send(Ok(dismiss(&mut self.alerts, |a| a.alert_id == alert_id)));
            }
            EngineCommand::DismissRecommendation {
                recommendation_id,
                reply,
            } => {
                let found = dismiss(&mut self.recommendations, |r| {
                    r.recommendation_id == recommendation_id
                });
                let _ = reply.send(Ok(found));
            }
            EngineCommand::Query(query) => {
                let view = EngineView {
                    store: &self.store,
                    room: &self.room,
                    workspace: self.workspace.as_ref(),
                    alerts: &self.alerts,
                    recommendations: &self.recommendations,
                    now_ms: self.clock.now_ms(),
                };
                query(&view);
            }
            EngineCommand::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn join(&mut self, key: WorkspaceKey, reply: Reply<JoinAck>) {
        let previous = self.room.room().cloned();
        let connected = self.connection.state().is_connected();
        let commands = match self.room.join(&key, connected) {
            Ok(commands) => commands,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        if commands.is_empty() {
            if self.room.is_live() {
                let _ = reply.send(Ok(JoinAck {
                    room: key,
                    rejoined: false,
                }));
            } else {
                self.supersede_join(&key);
                self.pending_join = Some((key, reply));
            }
            return;
        }

        self.supersede_join(&key);
        if let Some(old) = previous {
            self.notify(Notification::RoomLeft { room: old }).await;
        }
        if self.workspace.as_ref() != Some(&key) {
            self.switch_workspace(&key).await;
        }
        for command in commands {
            self.send(command).await;
        }
        self.pending_join = Some((key, reply));
    }

    /// Point the store at `key`: drop the old data, warm from cache if possible.
    async fn switch_workspace(&mut self, key: &WorkspaceKey) {
        if let Some(old) = self.workspace.take() {
            self.cache.invalidate(&old);
        }
        self.store.clear();
        self.warm = false;
        if let Some(snapshot) = self.cache.read(key) {
            tracing::info!(
                workspace = %key,
                tasks = snapshot.tasks.len(),
                "warm start from cache"
            );
            self.store.load_snapshot(snapshot.tasks, snapshot.assignees);
            self.warm = true;
        }
        self.workspace = Some(key.clone());
        self.notify(Notification::StoreChanged).await;
    }

    async fn leave(&mut self, key: &WorkspaceKey) {
        let Some(command) = self.room.leave(key) else {
            tracing::debug!(room = %key, "leave ignored, not the current room");
            return;
        };
        if let Some((_, reply)) = self.pending_join.take() {
            let _ = reply.send(Err(RoomError::Interrupted.into()));
        }
        self.send(command).await;
        self.notify(Notification::RoomLeft { room: key.clone() }).await;
    }

    fn supersede_join(&mut self, by: &WorkspaceKey) {
        if let Some((_, reply)) = self.pending_join.take() {
            let _ = reply.send(Err(RoomError::Superseded(by.clone()).into()));
        }
    }

    async fn move_task(
        &mut self,
        task_id: TaskId,
        assignee: Option<AssigneeId>,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> Result<MutationToken, StoreError> {
        let token = self
            .store
            .apply_local_move(&task_id, assignee.clone(), start, end)?;
        let end = self.store.task(&task_id).and_then(|task| task.end);
        self.submit(
            token,
            ClientCommand::SubmitMove {
                task_id,
                assignee,
                start,
                end,
            },
        )
        .await;
        Ok(token)
    }

    async fn edit_task(&mut self, task_id: TaskId, patch: TaskPatch) -> Result<MutationToken, StoreError> {
        let token = self.store.apply_local_edit(&task_id, patch.clone())?;
        self.submit(token, ClientCommand::SubmitEdit { task_id, patch })
            .await;
        Ok(token)
    }

    async fn submit_batch(&mut self, changes: Vec<TaskChange>) -> Result<Vec<MutationToken>, StoreError> {
        let tokens = self.store.apply_local_batch(&changes)?;
        let changes = changes
            .into_iter()
            .map(|change| match change {
                TaskChange::Move {
                    task_id,
                    assignee,
                    start,
                    ..
                } => {
                    let end = self.store.task(&task_id).and_then(|task| task.end);
                    TaskChange::Move {
                        task_id,
                        assignee,
                        start,
                        end,
                    }
                }
                edit @ TaskChange::Edit { .. } => edit,
            })
            .collect();
        let batch_id = MutationToken::new().to_string();
        tracing::debug!(batch = %batch_id, changes = tokens.len(), "submitting batch");
        self.notify(Notification::StoreChanged).await;
        self.send(ClientCommand::SubmitBatch { batch_id, changes })
            .await;
        Ok(tokens)
    }

    /// Send a command for a change already applied to the store.
    async fn submit(&self, token: MutationToken, command: ClientCommand) {
        tracing::debug!(token = %token, command = command.name(), "submitting local change");
        self.notify(Notification::StoreChanged).await;
        self.send(command).await;
    }

    async fn resolve(&mut self, task_id: &TaskId, choice: ConflictChoice) -> Result<Task, StoreError> {
        let resolution = self.store.resolve(task_id, choice)?;
        self.send(ClientCommand::ResolveConflict {
            task_id: task_id.clone(),
            choice,
            task: resolution.task.clone(),
        })
        .await;
        self.notify(Notification::ConflictResolved {
            task_id: task_id.clone(),
            choice,
        })
        .await;
        for outcome in &resolution.replayed {
            self.report_outcome(outcome).await;
        }
        self.notify(Notification::StoreChanged).await;
        if let Some(key) = self.workspace.clone() {
            self.fetch(key).await;
        }
        Ok(resolution.task)
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(state) => self.on_state_changed(state).await,
            ConnectionEvent::Frame(frame) => self.on_frame(frame).await,
            ConnectionEvent::SendFailed { command, error } => {
                self.notify(Notification::Error(SyncError::new(
                    ErrorKind::Network,
                    format!("{command}: {error}"),
                )))
                .await;
            }
            ConnectionEvent::Terminal {
                attempts,
                last_error,
            } => {
                self.notify(Notification::Error(SyncError::reconnect_exhausted(
                    attempts,
                    last_error.as_deref(),
                )))
                .await;
            }
        }
    }

    async fn on_state_changed(&mut self, state: ConnectionState) {
        let connected = state.is_connected();
        let reconnecting = state.reconnecting.then_some(state.attempt);
        self.notify(Notification::ConnectionChanged(state)).await;

        if connected && !self.link_up {
            self.link_up = true;
            if let Some(command) = self.room.on_connected() {
                self.send(command).await;
            }
        } else if !connected && self.link_up {
            self.link_up = false;
            if self.room.on_disconnected().is_some()
                && let Some((_, reply)) = self.pending_join.take()
            {
                let _ = reply.send(Err(RoomError::Interrupted.into()));
            }
            self.notify(Notification::PresenceChanged {
                active_users: Vec::new(),
            })
            .await;
        }

        if let Some(attempt) = reconnecting {
            self.notify(Notification::Reconnecting { attempt }).await;
        }
    }

    async fn on_frame(&mut self, frame: ServerFrame) {
        if !self.room.accepts(frame.room.as_ref()) {
            tracing::debug!(
                event = frame.event.name(),
                room = ?frame.room,
                "frame for another room discarded"
            );
            return;
        }

        match frame.event {
            PushEvent::Welcome { .. } | PushEvent::RoomLeft => {}
            PushEvent::TaskUpdate { task, .. } | PushEvent::TaskMoved { task, .. } => {
                self.apply_remote(StoreOp::RemoteTaskUpdate(task)).await;
            }
            PushEvent::BatchTaskUpdate { tasks, batch_id } => {
                tracing::debug!(count = tasks.len(), batch = ?batch_id, "batch update");
                self.apply_remote(StoreOp::RemoteBatchUpdate(tasks)).await;
            }
            PushEvent::TaskCreated { task } => {
                self.apply_remote(StoreOp::RemoteTaskCreated(task)).await;
            }
            PushEvent::TaskDeleted { task_id } => {
                self.apply_remote(StoreOp::RemoteTaskDeleted(task_id)).await;
            }
            PushEvent::CapacityChange {
                assignee_id,
                capacity_hours,
            } => {
                self.apply_remote(StoreOp::RemoteCapacityChange {
                    assignee_id,
                    capacity_hours,
                })
                .await;
            }
            PushEvent::TaskConflict { task, users } => {
                let task_id = task.id.clone();
                tracing::warn!(task = %task_id, users = users.len(), "hub reported concurrent edit");
                self.apply_remote(StoreOp::RemoteTaskUpdate(task)).await;
                self.notify(Notification::ConcurrentEdit { task_id, users }).await;
            }
            PushEvent::WorkloadAlert(alert) => {
                push_bounded(&mut self.alerts, alert.clone(), self.config.alert_capacity);
                self.notify(Notification::Alert(alert)).await;
            }
            PushEvent::AiRecommendation(recommendation) => {
                push_bounded(
                    &mut self.recommendations,
                    recommendation.clone(),
                    self.config.recommendation_capacity,
                );
                self.notify(Notification::Recommendation(recommendation)).await;
            }
            PushEvent::UserActivity {
                user,
                activity_type,
                payload,
                timestamp_ms,
            } => {
                if &user == self.room.local_user() {
                    return;
                }
                let now = self.clock.now_ms();
                let record = self
                    .room
                    .on_activity(user, activity_type, payload, timestamp_ms, now)
                    .clone();
                self.notify(Notification::PeerActivity(record)).await;
            }
            PushEvent::UserJoined { user } => {
                if self.room.on_user_joined(user) {
                    self.notify_presence().await;
                }
            }
            PushEvent::UserLeft { user } => {
                if self.room.on_user_left(&user) {
                    self.notify_presence().await;
                }
            }
            PushEvent::RoomJoined { active_users } => self.on_room_joined(active_users).await,
            PushEvent::JoinRejected { reason } => self.on_join_rejected(reason).await,
            PushEvent::WorkloadSnapshot {
                tasks,
                assignees,
                range,
            } => {
                self.on_snapshot(tasks, assignees, range).await;
            }
            PushEvent::CommandFailed(failure) => {
                tracing::warn!(
                    command = %failure.command,
                    kind = ?failure.kind,
                    message = %failure.message,
                    "hub rejected command"
                );
                self.notify(Notification::Error(SyncError::from(&failure))).await;
            }
        }
    }

    async fn on_room_joined(&mut self, active_users: Vec<UserId>) {
        let Some(ack) = self.room.on_room_joined(active_users) else {
            tracing::debug!("unexpected room_joined ignored");
            return;
        };
        tracing::info!(room = %ack.room, rejoined = ack.rejoined, "joined room");
        if let Some((_, reply)) = self.pending_join.take() {
            let _ = reply.send(Ok(ack.clone()));
        }
        self.notify(Notification::RoomJoined {
            room: ack.room.clone(),
            rejoined: ack.rejoined,
        })
        .await;
        self.notify_presence().await;
        if ack.rejoined || !self.warm {
            self.fetch(ack.room).await;
        }
    }

    async fn on_join_rejected(&mut self, reason: String) {
        let Some(key) = self.room.on_join_rejected() else {
            return;
        };
        tracing::warn!(room = %key, %reason, "join rejected");
        match self.pending_join.take() {
            Some((_, reply)) => {
                let _ = reply.send(Err(RoomError::Rejected(reason).into()));
            }
            None => {
                self.notify(Notification::Error(SyncError::new(
                    ErrorKind::Authorization,
                    format!("rejoining {key} refused: {reason}"),
                )))
                .await;
            }
        }
    }

    /// Full snapshots replace the store; ranged ones are merged into it.
    async fn on_snapshot(
        &mut self,
        tasks: Vec<Task>,
        assignees: Vec<Assignee>,
        range: Option<DateRange>,
    ) {
        let Some(key) = self.workspace.clone() else {
            tracing::debug!("snapshot without a workspace ignored");
            return;
        };
        let outcomes = if range.is_some() {
            self.store.merge_snapshot(tasks, assignees)
        } else {
            let outcomes = self.store.load_snapshot(tasks, assignees);
            self.warm = true;
            outcomes
        };
        for outcome in &outcomes {
            self.report_outcome(outcome).await;
        }
        // A ranged merge into a cold store is not a complete dataset.
        if self.warm {
            let (tasks, assignees) = self.store.confirmed_snapshot();
            self.cache.write(&key, &tasks, &assignees);
        }
        self.notify(Notification::StoreChanged).await;
    }

    async fn apply_remote(&mut self, op: StoreOp) {
        match self.store.apply(op) {
            Ok(outcome) => {
                self.report_outcome(&outcome).await;
                if outcome.changed() {
                    self.notify(Notification::StoreChanged).await;
                }
            }
            Err(e) => tracing::warn!(error = %e, "remote event not applied"),
        }
    }

    async fn report_outcome(&self, outcome: &ApplyOutcome) {
        for (task_id, token) in outcome.confirmations() {
            self.notify(Notification::MutationConfirmed {
                task_id: task_id.clone(),
                token,
            })
            .await;
        }
        for conflict in outcome.conflicts() {
            self.notify(Notification::ConflictDetected(conflict.clone())).await;
        }
    }

    async fn on_sweep(&mut self) {
        let now = self.clock.now_ms();
        let expired = self.room.sweep(now);
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "activity expired");
            self.notify(Notification::ActivityExpired(expired)).await;
        }
        self.recommendations
            .retain(|r| r.expires_at_ms.is_none_or(|at| at > now));
    }

    async fn fetch(&self, room: WorkspaceKey) {
        self.fetch_range(room, None).await;
    }

    async fn fetch_range(&self, room: WorkspaceKey, range: Option<DateRange>) {
        tracing::debug!(workspace = %room, ranged = range.is_some(), "fetching workload");
        self.send(ClientCommand::FetchWorkload { room, range }).await;
    }

    async fn send(&self, command: ClientCommand) {
        if let Err(e) = self.connection.send(command) {
            self.notify(Notification::Error(SyncError::from(&e))).await;
        }
    }

    async fn notify_presence(&self) {
        self.notify(Notification::PresenceChanged {
            active_users: self.room.active_users().iter().cloned().collect(),
        })
        .await;
    }

    async fn report_stopped_connection(&self) {
        self.notify(Notification::Error(SyncError::with_message(
            ErrorKind::Network,
            "connection supervisor stopped",
        )))
        .await;
    }

    async fn notify(&self, notification: Notification) {
        if self.notifications.send(notification).await.is_err() {
            tracing::trace!("notification receiver dropped");
        }
    }
}

fn push_bounded<T>(log: &mut VecDeque<T>, item: T, capacity: usize) {
    log.push_front(item);
    log.truncate(capacity);
}

fn dismiss<T>(log: &mut VecDeque<T>, matches: impl Fn(&T) -> bool) -> bool {
    let before = log.len();
    log.retain(|item| !matches(item));
    log.len() != before
}
