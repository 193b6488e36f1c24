//! Server-to-client push events.
//!
//! Every frame the hub pushes is a [`ServerFrame`]: an optional room tag
//! plus a [`PushEvent`]. On the wire this is a JSON object of the form
//! `{"room": "engineering", "event": "task_moved", "data": {...}}`.
//!
//! Events are authoritative but not reliable: the transport may drop,
//! duplicate or reorder them, and clients must stay correct regardless.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::command::DateRange;
use crate::task::{Assignee, AssigneeId, Task, TaskId, UserId, WorkspaceKey};

/// Free-form key/value payload attached to user activity.
pub type ActivityPayload = BTreeMap<String, String>;

/// A single frame pushed by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    /// Room the event was broadcast to; `None` for session-level events.
    #[serde(default)]
    pub room: Option<WorkspaceKey>,
    /// The event itself.
    #[serde(flatten)]
    pub event: PushEvent,
}

impl ServerFrame {
    /// A frame addressed to a room.
    #[must_use]
    pub const fn in_room(room: WorkspaceKey, event: PushEvent) -> Self {
        Self {
            room: Some(room),
            event,
        }
    }

    /// A frame addressed to the session only.
    #[must_use]
    pub const fn session(event: PushEvent) -> Self {
        Self { room: None, event }
    }
}

/// Push events understood by the client engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum PushEvent {
    /// Handshake acknowledgment for a `hello` command.
    Welcome {
        /// The user id the hub registered for this session.
        user: UserId,
    },
    /// A task's fields changed.
    TaskUpdate {
        /// Full authoritative task state.
        task: Task,
        /// Who made the change.
        #[serde(default)]
        changed_by: Option<UserId>,
    },
    /// A task was moved to a different assignee or time slot.
    TaskMoved {
        /// Full authoritative task state after the move.
        task: Task,
        /// Who moved it.
        #[serde(default)]
        changed_by: Option<UserId>,
    },
    /// Several tasks changed at once.
    BatchTaskUpdate {
        /// Authoritative state of every changed task.
        tasks: Vec<Task>,
        /// Identifier of the batch, for logging.
        #[serde(default)]
        batch_id: Option<String>,
    },
    /// A task was created.
    TaskCreated {
        /// The new task.
        task: Task,
    },
    /// A task was deleted.
    TaskDeleted {
        /// Id of the removed task.
        task_id: TaskId,
    },
    /// An assignee's capacity changed.
    CapacityChange {
        /// Whose capacity changed.
        assignee_id: AssigneeId,
        /// New available hours for the current period.
        capacity_hours: f64,
    },
    /// The backend detected a workload problem.
    WorkloadAlert(Alert),
    /// The backend produced a scheduling recommendation.
    AiRecommendation(Recommendation),
    /// The backend itself detected concurrent edits to a task.
    TaskConflict {
        /// Current authoritative state of the task.
        task: Task,
        /// Users whose edits collided.
        #[serde(default)]
        users: Vec<UserId>,
    },
    /// A peer did something worth showing (dragging, editing, ...).
    UserActivity {
        /// Who is active.
        user: UserId,
        /// Kind of activity, e.g. `dragging`.
        activity_type: String,
        /// Activity details.
        #[serde(default)]
        payload: ActivityPayload,
        /// When the peer reported it, milliseconds since the UNIX epoch.
        timestamp_ms: u64,
    },
    /// A viewer joined the room.
    UserJoined {
        /// Who joined.
        user: UserId,
    },
    /// A viewer left the room.
    UserLeft {
        /// Who left.
        user: UserId,
    },
    /// The hub accepted a `join_room` command.
    RoomJoined {
        /// Viewers currently in the room, including the joiner.
        active_users: Vec<UserId>,
    },
    /// The hub refused a `join_room` command.
    JoinRejected {
        /// Human-readable reason.
        reason: String,
    },
    /// The hub confirmed a `leave_room` command.
    RoomLeft,
    /// Answer to `fetch_workload`: the full dataset of a workspace.
    WorkloadSnapshot {
        /// Every task in the workspace (optionally filtered by date range).
        tasks: Vec<Task>,
        /// Every assignee in the workspace.
        assignees: Vec<Assignee>,
        /// The window the tasks were filtered by; `None` for a full snapshot.
        #[serde(default)]
        range: Option<DateRange>,
    },
    /// A command sent by this session failed on the backend.
    CommandFailed(CommandFailure),
}

impl PushEvent {
    /// Wire name of the event, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::TaskUpdate { .. } => "task_update",
            Self::TaskMoved { .. } => "task_moved",
            Self::BatchTaskUpdate { .. } => "batch_task_update",
            Self::TaskCreated { .. } => "task_created",
            Self::TaskDeleted { .. } => "task_deleted",
            Self::CapacityChange { .. } => "capacity_change",
            Self::WorkloadAlert(_) => "workload_alert",
            Self::AiRecommendation(_) => "ai_recommendation",
            Self::TaskConflict { .. } => "task_conflict",
            Self::UserActivity { .. } => "user_activity",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::RoomJoined { .. } => "room_joined",
            Self::JoinRejected { .. } => "join_rejected",
            Self::RoomLeft => "room_left",
            Self::WorkloadSnapshot { .. } => "workload_snapshot",
            Self::CommandFailed(_) => "command_failed",
        }
    }
}

/// How urgent an alert is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Low,
    /// Worth a look.
    Medium,
    /// Needs action.
    High,
    /// Needs action now.
    Critical,
}

impl Severity {
    /// Whether the alert asks the user to act.
    #[must_use]
    pub const fn requires_action(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

/// Payload of a `workload_alert` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Unique id of the alert.
    pub alert_id: String,
    /// Category, e.g. `overallocation` or `bottleneck`.
    pub alert_type: String,
    /// How urgent the alert is.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// Assignees the alert is about.
    #[serde(default)]
    pub affected: Vec<AssigneeId>,
}

/// Payload of an `ai_recommendation` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Unique id of the recommendation.
    pub recommendation_id: String,
    /// Human-readable suggestion.
    pub message: String,
    /// Task the recommendation is about, if any.
    #[serde(default)]
    pub task_id: Option<TaskId>,
    /// When the suggestion stops being relevant, ms since the UNIX epoch.
    #[serde(default)]
    pub expires_at_ms: Option<u64>,
}

/// Category of a backend-side command failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The backend rejected the input.
    Validation,
    /// The session may not perform the action.
    Authorization,
    /// The referenced entity does not exist.
    NotFound,
    /// The backend refused because of a concurrent edit.
    Conflict,
    /// The backend failed internally.
    Server,
}

/// Payload of a `command_failed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailure {
    /// Wire name of the failed command.
    pub command: String,
    /// Why it failed.
    pub kind: FailureKind,
    /// Human-readable description.
    pub message: String,
    /// Task the command targeted, if any.
    #[serde(default)]
    pub task_id: Option<TaskId>,
}
