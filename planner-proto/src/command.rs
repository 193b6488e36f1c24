//! Client-to-server commands.
//!
//! Commands are fire-and-forget from the client's point of view: the hub
//! answers with push events (`room_joined`, `task_moved`, `command_failed`,
//! ...) rather than with per-command replies.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::event::ActivityPayload;
use crate::task::{AssigneeId, Task, TaskId, TaskPatch, UserId, WorkspaceKey};

/// Inclusive date window used to scope a workload fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    /// First instant of the window.
    pub start: NaiveDateTime,
    /// Last instant of the window.
    pub end: NaiveDateTime,
}

/// One change inside a `submit_batch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskChange {
    /// Reassign and/or reschedule.
    Move {
        /// Task to move.
        task_id: TaskId,
        /// New assignee, `None` to unassign.
        assignee: Option<AssigneeId>,
        /// New start.
        start: Option<NaiveDateTime>,
        /// New end.
        end: Option<NaiveDateTime>,
    },
    /// Change descriptive fields.
    Edit {
        /// Task to edit.
        task_id: TaskId,
        /// Fields to change.
        patch: TaskPatch,
    },
}

impl TaskChange {
    /// The task this change targets.
    #[must_use]
    pub const fn task_id(&self) -> &TaskId {
        match self {
            Self::Move { task_id, .. } | Self::Edit { task_id, .. } => task_id,
        }
    }
}

/// Which side of a conflict the user kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    /// Keep this client's optimistic version.
    Local,
    /// Accept the version the backend pushed.
    Server,
}

/// Commands a client sends to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    /// First frame of every session; answered with `welcome`.
    Hello {
        /// Identity of the connecting viewer.
        user: UserId,
    },
    /// Subscribe to a workspace room.
    JoinRoom {
        /// Room to join.
        room: WorkspaceKey,
    },
    /// Unsubscribe from a workspace room.
    LeaveRoom {
        /// Room to leave.
        room: WorkspaceKey,
    },
    /// Tell the other viewers what this user is doing.
    BroadcastActivity {
        /// Kind of activity.
        activity_type: String,
        /// Activity details.
        payload: ActivityPayload,
    },
    /// Reassign and/or reschedule a task.
    SubmitMove {
        /// Task to move.
        task_id: TaskId,
        /// New assignee, `None` to unassign.
        assignee: Option<AssigneeId>,
        /// New start.
        start: Option<NaiveDateTime>,
        /// New end.
        end: Option<NaiveDateTime>,
    },
    /// Change descriptive task fields.
    SubmitEdit {
        /// Task to edit.
        task_id: TaskId,
        /// Fields to change.
        patch: TaskPatch,
    },
    /// Apply several changes as one unit; answered with `batch_task_update`.
    SubmitBatch {
        /// Client-chosen id, echoed in the broadcast.
        batch_id: String,
        /// Changes in application order, at most one per task.
        changes: Vec<TaskChange>,
    },
    /// Settle a conflict with the chosen version.
    ResolveConflict {
        /// Task in conflict.
        task_id: TaskId,
        /// Which side was kept.
        choice: ConflictChoice,
        /// The full version the client kept.
        task: Task,
    },
    /// Request a `workload_snapshot` for a workspace.
    FetchWorkload {
        /// Workspace to fetch.
        room: WorkspaceKey,
        /// Restrict tasks to this window, if given.
        range: Option<DateRange>,
    },
}

impl ClientCommand {
    /// Wire name of the command, for logging and `command_failed` reports.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::BroadcastActivity { .. } => "broadcast_activity",
            Self::SubmitMove { .. } => "submit_move",
            Self::SubmitEdit { .. } => "submit_edit",
            Self::SubmitBatch { .. } => "submit_batch",
            Self::ResolveConflict { .. } => "resolve_conflict",
            Self::FetchWorkload { .. } => "fetch_workload",
        }
    }
}
