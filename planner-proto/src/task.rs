//! Scheduling entities shared by the client engine and the hub.
//!
//! A [`Task`] is a unit of work that may be assigned to an [`Assignee`]
//! and placed on the timeline. Both dates must be present for a task to
//! count as scheduled; unscheduled tasks never contribute to utilization.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Maximum length of a task title in characters.
pub const MAX_TASK_TITLE_LENGTH: usize = 140;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Stable, unique task identifier assigned by the backend.
    TaskId
);

string_id!(
    /// Identifier of a person tasks can be assigned to.
    AssigneeId
);

string_id!(
    /// Key scoping a set of tasks/assignees to one cache entry and one room.
    ///
    /// Usually a department name, e.g. `engineering`.
    WorkspaceKey
);

string_id!(
    /// Identifier of a connected viewer (not necessarily an assignee).
    UserId
);

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Not started yet.
    Open,
    /// Someone is actively working on it.
    Working,
    /// Done, waiting for a review.
    PendingReview,
    /// Past its end date and not completed.
    Overdue,
    /// Finished.
    Completed,
    /// Abandoned.
    Cancelled,
}

impl TaskStatus {
    /// Whether the task still counts as outstanding work.
    #[must_use]
    pub const fn is_open(self) -> bool {
        !matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Working => write!(f, "Working"),
            Self::PendingReview => write!(f, "Pending Review"),
            Self::Overdue => write!(f, "Overdue"),
            Self::Completed => write!(f, "Completed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Task priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    /// Can wait.
    Low,
    /// Default priority.
    Medium,
    /// Should be scheduled soon.
    High,
    /// Needs attention now.
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "Low"),
            Self::Medium => write!(f, "Medium"),
            Self::High => write!(f, "High"),
            Self::Urgent => write!(f, "Urgent"),
        }
    }
}

/// A task on the shared schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,
    /// Short human-readable title.
    pub title: String,
    /// Who the task is assigned to; `None` means unassigned.
    pub assignee: Option<AssigneeId>,
    /// Planned start; `None` means unscheduled.
    pub start: Option<NaiveDateTime>,
    /// Planned end; `None` means unscheduled.
    pub end: Option<NaiveDateTime>,
    /// Estimated effort in hours (never negative).
    pub duration_hours: f64,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Priority.
    pub priority: Priority,
    /// Project the task belongs to, if any.
    pub project: Option<String>,
    /// Completion percentage, 0..=100.
    pub progress: u8,
}

impl Task {
    /// Creates an open, unassigned, unscheduled task with medium priority.
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>, duration_hours: f64) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            assignee: None,
            start: None,
            end: None,
            duration_hours,
            status: TaskStatus::Open,
            priority: Priority::Medium,
            project: None,
            progress: 0,
        }
    }

    /// A task is scheduled iff both its start and end dates are present.
    #[must_use]
    pub const fn is_scheduled(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }

    /// Whether the task is assigned to `assignee`.
    #[must_use]
    pub fn is_assigned_to(&self, assignee: &AssigneeId) -> bool {
        self.assignee.as_ref() == Some(assignee)
    }

    /// Whether the task ended before `now` without being completed.
    #[must_use]
    pub fn is_overdue(&self, now: NaiveDateTime) -> bool {
        self.status.is_open() && self.end.is_some_and(|end| end < now)
    }

    /// Hours this task contributes to its assignee's utilization.
    #[must_use]
    pub fn scheduled_hours(&self) -> f64 {
        if self.is_scheduled() {
            self.duration_hours.max(0.0)
        } else {
            0.0
        }
    }
}

/// A person with a capacity of hours in the current planning period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignee {
    /// Unique identifier.
    pub id: AssigneeId,
    /// Display name.
    pub name: String,
    /// Hours available in the current period (never negative).
    pub capacity_hours: f64,
    /// Department the assignee belongs to, if known.
    pub department: Option<String>,
}

impl Assignee {
    /// Creates an assignee without a department.
    pub fn new(id: impl Into<String>, name: impl Into<String>, capacity_hours: f64) -> Self {
        Self {
            id: AssigneeId::new(id),
            name: name.into(),
            capacity_hours,
            department: None,
        }
    }
}

/// A partial update to a task's descriptive fields.
///
/// Scheduling fields (assignee and dates) are changed by moves, not edits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    /// New title.
    pub title: Option<String>,
    /// New status.
    pub status: Option<TaskStatus>,
    /// New priority.
    pub priority: Option<Priority>,
    /// New estimated effort in hours.
    pub duration_hours: Option<f64>,
    /// New completion percentage.
    pub progress: Option<u8>,
}

impl TaskPatch {
    /// Returns `true` if the patch changes nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.duration_hours.is_none()
            && self.progress.is_none()
    }

    /// Writes every present field onto `task`.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title.clone_from(title);
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(duration) = self.duration_hours {
            task.duration_hours = duration;
        }
        if let Some(progress) = self.progress {
            task.progress = progress;
        }
    }

    /// Whether every field present in the patch already holds on `task`.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn is_reflected_in(&self, task: &Task) -> bool {
        self.title.as_ref().is_none_or(|t| *t == task.title)
            && self.status.is_none_or(|s| s == task.status)
            && self.priority.is_none_or(|p| p == task.priority)
            && self.duration_hours.is_none_or(|d| d == task.duration_hours)
            && self.progress.is_none_or(|p| p == task.progress)
    }
}
