//! Pure scheduling arithmetic.
//!
//! Nothing in here touches state: every function takes the tasks and
//! assignees it needs and returns a value. The entity store calls these for
//! validation and for its derived statistics.

use chrono::{Duration as ChronoDuration, NaiveDateTime};

use planner_proto::task::{
    Assignee, AssigneeId, MAX_TASK_TITLE_LENGTH, Task, TaskId, TaskPatch,
};

/// Utilization above which an assignee is listed as overallocated.
pub const OVERALLOCATION_THRESHOLD: f64 = 120.0;

/// Utilization below which a non-idle assignee is listed as underutilized.
pub const UNDERUTILIZATION_THRESHOLD: f64 = 70.0;

/// Highest valid completion percentage.
pub const MAX_PROGRESS: u8 = 100;

/// Why a proposed move or edit was rejected.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    /// An end date was given without a start date.
    #[error("an end date requires a start date")]
    EndWithoutStart,

    /// The end date precedes the start date.
    #[error("end {end} is before start {start}")]
    EndBeforeStart {
        /// Proposed start.
        start: NaiveDateTime,
        /// Proposed end.
        end: NaiveDateTime,
    },

    /// The target assignee is not part of the workspace.
    #[error("unknown assignee {0}")]
    UnknownAssignee(AssigneeId),

    /// Title is empty after trimming.
    #[error("task title cannot be empty")]
    TitleEmpty,

    /// Title exceeds the maximum allowed length.
    #[error("task title too long (max {MAX_TASK_TITLE_LENGTH} characters)")]
    TitleTooLong,

    /// Duration is negative, NaN or infinite.
    #[error("duration must be a finite, non-negative number of hours")]
    InvalidDuration,

    /// Progress is above 100.
    #[error("progress must be at most {MAX_PROGRESS}, got {0}")]
    ProgressOutOfRange(u8),

    /// The edit does not change any field.
    #[error("edit changes nothing")]
    EmptyEdit,

    /// A batch contains no changes.
    #[error("batch contains no changes")]
    EmptyBatch,

    /// A batch changes the same task more than once.
    #[error("task {0} appears more than once in the batch")]
    DuplicateInBatch(TaskId),
}

/// What a valid move would do to its target assignee.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveAssessment {
    /// End date after derivation from the duration, if one was needed.
    pub end: Option<NaiveDateTime>,
    /// Scheduled hours of the target assignee after the move.
    pub projected_hours: f64,
    /// Rounded utilization of the target assignee after the move.
    pub projected_utilization: u32,
    /// The move would push the target assignee past their capacity.
    pub overallocated: bool,
}

/// Utilization in percent, unrounded. Zero capacity means zero utilization.
#[must_use]
pub fn utilization_percent(scheduled_hours: f64, capacity_hours: f64) -> f64 {
    if capacity_hours > 0.0 {
        scheduled_hours / capacity_hours * 100.0
    } else {
        0.0
    }
}

/// Rounds a percentage to a whole number, clamping at zero.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn round_percent(percent: f64) -> u32 {
    if percent.is_finite() && percent > 0.0 {
        percent.round().min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}

/// Sum of scheduled hours assigned to `assignee`.
pub fn scheduled_hours_for<'a>(
    assignee: &AssigneeId,
    tasks: impl IntoIterator<Item = &'a Task>,
) -> f64 {
    tasks
        .into_iter()
        .filter(|task| task.is_assigned_to(assignee))
        .map(Task::scheduled_hours)
        .sum()
}

/// `round(scheduled hours / capacity × 100)`, or 0 when capacity is 0.
pub fn utilization<'a>(assignee: &Assignee, tasks: impl IntoIterator<Item = &'a Task>) -> u32 {
    let hours = scheduled_hours_for(&assignee.id, tasks);
    round_percent(utilization_percent(hours, assignee.capacity_hours))
}

/// `start + duration`, with the duration rounded to whole hours.
///
/// Negative or non-finite durations count as zero.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn derive_end_date(start: NaiveDateTime, duration_hours: f64) -> NaiveDateTime {
    let hours = if duration_hours.is_finite() && duration_hours > 0.0 {
        duration_hours.round().min(1_000_000.0) as i64
    } else {
        0
    };
    start
        .checked_add_signed(ChronoDuration::hours(hours))
        .unwrap_or(start)
}

/// Whether `[a_start, a_end]` and `[b_start, b_end]` share an instant.
///
/// Bounds are inclusive: ranges that touch at an endpoint overlap.
#[must_use]
pub fn ranges_overlap(
    a_start: NaiveDateTime,
    a_end: NaiveDateTime,
    b_start: NaiveDateTime,
    b_end: NaiveDateTime,
) -> bool {
    a_start <= b_end && b_start <= a_end
}

/// Check a proposed move of `task` to `assignee` over `[start, end]`.
///
/// `committed_hours` is what the target assignee already has scheduled,
/// excluding `task` itself. When only a start is given the end is derived
/// from the task's duration. Overallocation never rejects a move; it is
/// reported in the assessment.
///
/// # Errors
///
/// - [`ValidationError::EndWithoutStart`] if `end` is set but `start` is not.
/// - [`ValidationError::EndBeforeStart`] if `end < start`.
pub fn is_valid_move(
    task: &Task,
    assignee: Option<&Assignee>,
    start: Option<NaiveDateTime>,
    end: Option<NaiveDateTime>,
    committed_hours: f64,
) -> Result<MoveAssessment, ValidationError> {
    if start.is_none() && end.is_some() {
        return Err(ValidationError::EndWithoutStart);
    }
    let end = end.or_else(|| start.map(|s| derive_end_date(s, task.duration_hours)));
    if let (Some(start), Some(end)) = (start, end)
        && end < start
    {
        return Err(ValidationError::EndBeforeStart { start, end });
    }

    let added = if start.is_some() && end.is_some() {
        task.duration_hours.max(0.0)
    } else {
        0.0
    };
    let projected_hours = committed_hours + added;
    let percent = assignee.map_or(0.0, |a| utilization_percent(projected_hours, a.capacity_hours));

    Ok(MoveAssessment {
        end,
        projected_hours,
        projected_utilization: round_percent(percent),
        overallocated: assignee.is_some() && percent > 100.0,
    })
}

/// Check an edit before it is applied.
///
/// # Errors
///
/// Returns the first problem found: empty edit, title, duration, progress.
pub fn validate_patch(patch: &TaskPatch) -> Result<(), ValidationError> {
    if patch.is_empty() {
        return Err(ValidationError::EmptyEdit);
    }
    if let Some(title) = &patch.title {
        let trimmed = title.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::TitleEmpty);
        }
        if trimmed.chars().count() > MAX_TASK_TITLE_LENGTH {
            return Err(ValidationError::TitleTooLong);
        }
    }
    if let Some(duration) = patch.duration_hours
        && (!duration.is_finite() || duration < 0.0)
    {
        return Err(ValidationError::InvalidDuration);
    }
    if let Some(progress) = patch.progress
        && progress > MAX_PROGRESS
    {
        return Err(ValidationError::ProgressOutOfRange(progress));
    }
    Ok(())
}

/// A candidate assignee for an unscheduled or reassigned task.
#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    /// Who.
    pub assignee_id: AssigneeId,
    /// Display name.
    pub name: String,
    /// Capacity left after their current scheduled work.
    pub available_hours: f64,
    /// Their current rounded utilization.
    pub utilization: u32,
    /// `100 - utilization`; higher is a better fit.
    pub confidence: u32,
}

/// Assignees under 100 % whose remaining hours cover `task`.
///
/// Sorted by confidence, best first; ties keep assignee order. The task's
/// own hours are not counted against its current assignee.
pub fn suggest_assignees<'a>(
    task: &Task,
    assignees: impl IntoIterator<Item = &'a Assignee>,
    tasks: &[&Task],
) -> Vec<Suggestion> {
    if task.duration_hours.is_nan() || task.duration_hours <= 0.0 {
        return Vec::new();
    }
    let others = || tasks.iter().copied().filter(|t| t.id != task.id);

    let mut suggestions: Vec<Suggestion> = assignees
        .into_iter()
        .filter_map(|assignee| {
            let hours = scheduled_hours_for(&assignee.id, others());
            let utilization = round_percent(utilization_percent(hours, assignee.capacity_hours));
            let available_hours = assignee.capacity_hours - hours;
            (utilization < 100 && available_hours >= task.duration_hours).then(|| Suggestion {
                assignee_id: assignee.id.clone(),
                name: assignee.name.clone(),
                available_hours,
                utilization,
                confidence: 100 - utilization,
            })
        })
        .collect();
    suggestions.sort_by(|a, b| b.confidence.cmp(&a.confidence));
    suggestions
}
