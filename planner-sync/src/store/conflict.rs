//! Reconciliation of authoritative events against unconfirmed local changes.
//!
//! Every local mutation registers an [`Expectation`] under a fresh
//! [`MutationToken`]. When the hub echoes the task back, the expectation is
//! checked only on the fields the local change touched:
//!
//! - met: the change is confirmed and the token retired
//! - not met: a [`Conflict`] opens and the local version stays visible
//!
//! While a conflict is open, further events for the task are queued in
//! arrival order and replayed one at a time after resolution.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::NaiveDateTime;
use uuid::Uuid;

use planner_proto::task::{AssigneeId, Task, TaskId, TaskPatch};

/// Identifies one optimistic mutation until the hub confirms it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationToken(Uuid);

impl MutationToken {
    /// A new, time-ordered token.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MutationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an incoming task must look like to confirm a local change.
#[derive(Debug, Clone, PartialEq)]
pub enum Expectation {
    /// A move: assignee and both dates.
    Move {
        /// Target assignee.
        assignee: Option<AssigneeId>,
        /// Target start.
        start: Option<NaiveDateTime>,
        /// Target end.
        end: Option<NaiveDateTime>,
    },
    /// An edit: every field present in the patch.
    Edit(TaskPatch),
    /// A whole-task resolution: every field.
    Exact(Box<Task>),
}

impl Expectation {
    /// Whether `task` carries the values this change set.
    #[must_use]
    pub fn is_met_by(&self, task: &Task) -> bool {
        match self {
            Self::Move {
                assignee,
                start,
                end,
            } => task.assignee == *assignee && task.start == *start && task.end == *end,
            Self::Edit(patch) => patch.is_reflected_in(task),
            Self::Exact(expected) => **expected == *task,
        }
    }
}

/// The unconfirmed local changes to one task.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    /// The task as it was before the first unconfirmed change.
    pub before: Task,
    expectations: VecDeque<(MutationToken, Expectation)>,
}

impl PendingMutation {
    /// Starts tracking changes to a task that looked like `before`.
    #[must_use]
    pub const fn new(before: Task) -> Self {
        Self {
            before,
            expectations: VecDeque::new(),
        }
    }

    /// Record another change; returns its token.
    pub fn push(&mut self, expectation: Expectation) -> MutationToken {
        let token = MutationToken::new();
        self.expectations.push_back((token, expectation));
        token
    }

    /// Token of the most recent change.
    #[must_use]
    pub fn latest_token(&self) -> Option<MutationToken> {
        self.expectations.back().map(|(token, _)| *token)
    }

    /// Number of changes awaiting confirmation.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.expectations.len()
    }

    /// Check `incoming` against the outstanding changes.
    ///
    /// The newest change `incoming` satisfies is confirmed together with
    /// every older one, since the hub applies submissions in order.
    /// Returns the confirmed token, or `None` if nothing matched.
    pub fn confirm(&mut self, incoming: &Task) -> Option<MutationToken> {
        let index = self
            .expectations
            .iter()
            .rposition(|(_, expectation)| expectation.is_met_by(incoming))?;
        self.expectations
            .drain(..=index)
            .last()
            .map(|(token, _)| token)
    }

    /// Whether every change has been confirmed.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.expectations.is_empty()
    }
}

/// An authoritative event that contradicts an unconfirmed local change.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// The task in conflict.
    pub task_id: TaskId,
    /// The optimistic version currently shown.
    pub local: Task,
    /// The version the hub pushed.
    pub incoming: Task,
    /// Token of the local change that was contradicted.
    pub local_token: MutationToken,
}

/// Errors raised by conflict resolution.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConflictError {
    /// There is no open conflict for the task.
    #[error("no open conflict for task {0}")]
    NoConflict(TaskId),
}

#[derive(Debug)]
struct OpenConflict {
    conflict: Conflict,
    queued: VecDeque<Task>,
}

/// Open conflicts and the events queued behind them.
#[derive(Debug, Default)]
pub struct ConflictResolver {
    open: HashMap<TaskId, OpenConflict>,
}

impl ConflictResolver {
    /// Whether `task_id` has an open conflict.
    #[must_use]
    pub fn is_open(&self, task_id: &TaskId) -> bool {
        self.open.contains_key(task_id)
    }

    /// The open conflict for `task_id`.
    #[must_use]
    pub fn get(&self, task_id: &TaskId) -> Option<&Conflict> {
        self.open.get(task_id).map(|open| &open.conflict)
    }

    /// Every open conflict, ordered by task id.
    #[must_use]
    pub fn open_conflicts(&self) -> Vec<&Conflict> {
        let mut conflicts: Vec<_> = self.open.values().map(|open| &open.conflict).collect();
        conflicts.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        conflicts
    }

    /// Number of events waiting behind the conflict for `task_id`.
    #[must_use]
    pub fn queued_len(&self, task_id: &TaskId) -> usize {
        self.open.get(task_id).map_or(0, |open| open.queued.len())
    }

    /// Start tracking a conflict.
    pub fn open(&mut self, conflict: Conflict) {
        tracing::info!(
            task = %conflict.task_id,
            token = %conflict.local_token,
            "conflict opened"
        );
        self.open.insert(
            conflict.task_id.clone(),
            OpenConflict {
                conflict,
                queued: VecDeque::new(),
            },
        );
    }

    /// Queue an event behind the open conflict for its task.
    ///
    /// Returns `false` if the event repeats the conflicting version or the
    /// last queued one; duplicates are dropped.
    pub fn enqueue(&mut self, incoming: Task) -> bool {
        let Some(open) = self.open.get_mut(&incoming.id) else {
            return false;
        };
        let last = open.queued.back().unwrap_or(&open.conflict.incoming);
        if *last == incoming {
            tracing::debug!(task = %incoming.id, "duplicate event behind conflict dropped");
            return false;
        }
        tracing::debug!(task = %incoming.id, "event queued behind conflict");
        open.queued.push_back(incoming);
        true
    }

    /// Close the conflict for `task_id`, returning it with its queue.
    ///
    /// # Errors
    ///
    /// Returns [`ConflictError::NoConflict`] if nothing is open for the task.
    pub fn take(&mut self, task_id: &TaskId) -> Result<(Conflict, Vec<Task>), ConflictError> {
        self.open
            .remove(task_id)
            .map(|open| (open.conflict, open.queued.into()))
            .ok_or_else(|| ConflictError::NoConflict(task_id.clone()))
    }

    /// Forget the conflict for `task_id` and its queue.
    pub fn discard(&mut self, task_id: &TaskId) {
        if self.open.remove(task_id).is_some() {
            tracing::debug!(task = %task_id, "conflict discarded");
        }
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.open.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planner_proto::task::TaskStatus;

    fn task() -> Task {
        Task::new("t-1", "Deploy", 3.0)
    }

    fn moved(to: &str) -> Task {
        let mut t = task();
        t.assignee = Some(AssigneeId::new(to));
        t
    }

    fn move_to(to: &str) -> Expectation {
        Expectation::Move {
            assignee: Some(AssigneeId::new(to)),
            start: None,
            end: None,
        }
    }

    #[test]
    fn move_expectation_ignores_untouched_fields() {
        let mut incoming = moved("bob");
        incoming.status = TaskStatus::Working;
        incoming.title = "Deploy v2".into();
        assert!(move_to("bob").is_met_by(&incoming));
        assert!(!move_to("carol").is_met_by(&incoming));
    }

    #[test]
    fn edit_expectation_checks_patch_fields() {
        let patch = TaskPatch {
            progress: Some(50),
            ..TaskPatch::default()
        };
        let mut incoming = moved("dave");
        incoming.progress = 50;
        assert!(Expectation::Edit(patch.clone()).is_met_by(&incoming));
        incoming.progress = 40;
        assert!(!Expectation::Edit(patch).is_met_by(&incoming));
    }

    #[test]
    fn exact_expectation_needs_every_field() {
        let expected = moved("bob");
        let mut incoming = expected.clone();
        assert!(Expectation::Exact(Box::new(expected.clone())).is_met_by(&incoming));
        incoming.progress = 1;
        assert!(!Expectation::Exact(Box::new(expected)).is_met_by(&incoming));
    }

    #[test]
    fn echo_of_older_change_keeps_newer_outstanding() {
        let mut pending = PendingMutation::new(task());
        let first = pending.push(move_to("bob"));
        let second = pending.push(move_to("carol"));
        assert_eq!(pending.latest_token(), Some(second));

        assert_eq!(pending.confirm(&moved("bob")), Some(first));
        assert!(!pending.is_settled());
        assert_eq!(pending.outstanding(), 1);

        assert_eq!(pending.confirm(&moved("carol")), Some(second));
        assert!(pending.is_settled());
    }

    #[test]
    fn echo_of_newest_change_settles_everything() {
        let mut pending = PendingMutation::new(task());
        pending.push(move_to("bob"));
        let last = pending.push(move_to("carol"));
        assert_eq!(pending.confirm(&moved("carol")), Some(last));
        assert!(pending.is_settled());
    }

    #[test]
    fn unrelated_echo_confirms_nothing() {
        let mut pending = PendingMutation::new(task());
        pending.push(move_to("bob"));
        assert_eq!(pending.confirm(&moved("erin")), None);
        assert_eq!(pending.outstanding(), 1);
    }

    #[test]
    fn queue_drops_duplicates() {
        let mut resolver = ConflictResolver::default();
        resolver.open(Conflict {
            task_id: TaskId::new("t-1"),
            local: moved("bob"),
            incoming: moved("carol"),
            local_token: MutationToken::new(),
        });
        assert!(!resolver.enqueue(moved("carol")));
        assert!(resolver.enqueue(moved("dave")));
        assert!(!resolver.enqueue(moved("dave")));
        assert!(resolver.enqueue(moved("erin")));
        assert_eq!(resolver.queued_len(&TaskId::new("t-1")), 2);

        let (conflict, queued) = resolver.take(&TaskId::new("t-1")).unwrap();
        assert_eq!(conflict.incoming, moved("carol"));
        assert_eq!(queued, vec![moved("dave"), moved("erin")]);
        assert!(!resolver.is_open(&TaskId::new("t-1")));
    }

    #[test]
    fn take_without_conflict_errors() {
        let mut resolver = ConflictResolver::default();
        assert_eq!(
            resolver.take(&TaskId::new("nope")),
            Err(ConflictError::NoConflict(TaskId::new("nope")))
        );
        assert!(!resolver.enqueue(task()));
    }

    #[test]
    fn tokens_are_unique() {
        let a = MutationToken::new();
        let b = MutationToken::new();
        assert_ne!(a, b);
        assert_eq!(a.as_uuid().get_version_num(), 7);
        assert_eq!(a.to_string(), a.as_uuid().to_string());
    }
}
