//! Canonical client-side copy of a workspace's tasks and assignees.
//!
//! All mutation goes through [`EntityStore::apply`]. Local moves and edits
//! are validated, applied optimistically, and tracked in a per-task pending
//! table until the hub echoes them back. Remote events replace tasks
//! directly unless the task has a pending change, in which case they go
//! through the [`ConflictResolver`].
//!
//! Derived statistics (utilization, workload totals, filters) live in
//! [`stats`] and are recomputed from the maps on every read.

pub mod conflict;
pub mod stats;

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDateTime;

use planner_proto::command::{ConflictChoice, TaskChange};
use planner_proto::task::{Assignee, AssigneeId, Task, TaskId, TaskPatch};

use crate::scheduling::{self, MoveAssessment, ValidationError};

pub use conflict::{Conflict, ConflictError, ConflictResolver, Expectation, MutationToken};
use conflict::PendingMutation;

/// Errors that can occur during store operations.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    /// The change failed validation; nothing was mutated.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No task with the given id.
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    /// The task has an unresolved conflict; resolve it first.
    #[error("task {0} has an unresolved conflict")]
    ConflictPending(TaskId),

    /// The task has no unconfirmed change to revert.
    #[error("task {0} has no pending change")]
    NotDirty(TaskId),

    /// Conflict resolution failed.
    #[error(transparent)]
    Conflict(#[from] ConflictError),
}

impl StoreError {
    /// Whether the error is a local validation failure.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// A single mutation of the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Reassign and/or reschedule a task optimistically.
    LocalMove {
        /// Task to move.
        task_id: TaskId,
        /// New assignee, `None` to unassign.
        assignee: Option<AssigneeId>,
        /// New start, `None` to unschedule.
        start: Option<NaiveDateTime>,
        /// New end; derived from the duration when only a start is given.
        end: Option<NaiveDateTime>,
    },
    /// Change descriptive fields optimistically.
    LocalEdit {
        /// Task to edit.
        task_id: TaskId,
        /// Fields to change.
        patch: TaskPatch,
    },
    /// Authoritative state of one task.
    RemoteTaskUpdate(Task),
    /// A task the hub created.
    RemoteTaskCreated(Task),
    /// A task the hub deleted.
    RemoteTaskDeleted(TaskId),
    /// Authoritative state of several tasks, applied in order.
    RemoteBatchUpdate(Vec<Task>),
    /// New capacity for an assignee.
    RemoteCapacityChange {
        /// Whose capacity changed.
        assignee_id: AssigneeId,
        /// New available hours.
        capacity_hours: f64,
    },
}

/// What an [`EntityStore::apply`] call did.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// A local change was applied and awaits confirmation.
    Pending {
        /// The changed task.
        task_id: TaskId,
        /// Token of the change.
        token: MutationToken,
        /// Effect on the target assignee, for moves.
        assessment: Option<MoveAssessment>,
    },
    /// A remote event replaced the task.
    Replaced(TaskId),
    /// A remote event confirmed a local change.
    Confirmed {
        /// The confirmed task.
        task_id: TaskId,
        /// The confirmed change.
        token: MutationToken,
        /// `false` if newer local changes are still outstanding.
        settled: bool,
    },
    /// A remote event contradicted a local change.
    ConflictOpened(Conflict),
    /// A remote event was queued behind an open conflict.
    Queued(TaskId),
    /// A remote event added a task.
    Created(TaskId),
    /// A remote event removed a task.
    Deleted(TaskId),
    /// An assignee's capacity changed.
    CapacityUpdated(AssigneeId),
    /// One outcome per task of a batch, in order.
    Batch(Vec<ApplyOutcome>),
    /// Nothing changed.
    Ignored,
}

impl ApplyOutcome {
    /// Conflicts opened by this outcome, including inside batches.
    #[must_use]
    pub fn conflicts(&self) -> Vec<&Conflict> {
        match self {
            Self::ConflictOpened(conflict) => vec![conflict],
            Self::Batch(outcomes) => outcomes.iter().flat_map(Self::conflicts).collect(),
            _ => Vec::new(),
        }
    }

    /// Tokens confirmed by this outcome, including inside batches.
    #[must_use]
    pub fn confirmations(&self) -> Vec<(&TaskId, MutationToken)> {
        match self {
            Self::Confirmed { task_id, token, .. } => vec![(task_id, *token)],
            Self::Batch(outcomes) => outcomes.iter().flat_map(Self::confirmations).collect(),
            _ => Vec::new(),
        }
    }

    /// Whether the visible data changed.
    #[must_use]
    pub fn changed(&self) -> bool {
        match self {
            Self::Ignored | Self::Queued(_) => false,
            Self::Batch(outcomes) => outcomes.iter().any(Self::changed),
            _ => true,
        }
    }
}

/// Result of settling a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The version now shown.
    pub task: Task,
    /// Which side was kept.
    pub choice: ConflictChoice,
    /// Token registered for the resolution submission when the local
    /// version was kept.
    pub token: Option<MutationToken>,
    /// Outcomes of the events that were queued behind the conflict.
    pub replayed: Vec<ApplyOutcome>,
}

/// Tasks, assignees, pending changes, and open conflicts of one workspace.
#[derive(Debug, Default)]
pub struct EntityStore {
    tasks: BTreeMap<TaskId, Task>,
    assignees: BTreeMap<AssigneeId, Assignee>,
    pending: HashMap<TaskId, PendingMutation>,
    conflicts: ConflictResolver,
}

impl EntityStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one operation.
    ///
    /// # Errors
    ///
    /// Only local operations fail: see [`apply_local_move`](Self::apply_local_move)
    /// and [`apply_local_edit`](Self::apply_local_edit). Remote operations
    /// always succeed.
    pub fn apply(&mut self, op: StoreOp) -> Result<ApplyOutcome, StoreError> {
        match op {
            StoreOp::LocalMove {
                task_id,
                assignee,
                start,
                end,
            } => self.local_move(&task_id, assignee, start, end),
            StoreOp::LocalEdit { task_id, patch } => self.local_edit(&task_id, patch),
            StoreOp::RemoteTaskUpdate(task) => Ok(self.reconcile(task)),
            StoreOp::RemoteTaskCreated(task) => Ok(self.remote_create(task)),
            StoreOp::RemoteTaskDeleted(task_id) => Ok(self.remote_delete(&task_id)),
            StoreOp::RemoteBatchUpdate(tasks) => Ok(ApplyOutcome::Batch(
                tasks.into_iter().map(|task| self.reconcile(task)).collect(),
            )),
            StoreOp::RemoteCapacityChange {
                assignee_id,
                capacity_hours,
            } => Ok(self.capacity_change(assignee_id, capacity_hours)),
        }
    }

    /// Move a task optimistically and return the change's token.
    ///
    /// # Errors
    ///
    /// - [`StoreError::TaskNotFound`] if the task is unknown.
    /// - [`StoreError::ConflictPending`] if the task has an open conflict.
    /// - [`StoreError::Validation`] for an unknown assignee or bad dates.
    pub fn apply_local_move(
        &mut self,
        task_id: &TaskId,
        assignee: Option<AssigneeId>,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> Result<MutationToken, StoreError> {
        match self.local_move(task_id, assignee, start, end)? {
            ApplyOutcome::Pending { token, .. } => Ok(token),
            _ => Err(StoreError::TaskNotFound(task_id.clone())),
        }
    }

    /// Edit a task optimistically and return the change's token.
    ///
    /// # Errors
    ///
    /// - [`StoreError::TaskNotFound`] if the task is unknown.
    /// - [`StoreError::ConflictPending`] if the task has an open conflict.
    /// - [`StoreError::Validation`] if the patch is empty or invalid.
    pub fn apply_local_edit(
        &mut self,
        task_id: &TaskId,
        patch: TaskPatch,
    ) -> Result<MutationToken, StoreError> {
        match self.local_edit(task_id, patch)? {
            ApplyOutcome::Pending { token, .. } => Ok(token),
            _ => Err(StoreError::TaskNotFound(task_id.clone())),
        }
    }

    /// Apply an authoritative task state.
    pub fn apply_remote_update(&mut self, task: Task) -> ApplyOutcome {
        self.reconcile(task)
    }

    /// Apply a remote creation.
    pub fn apply_remote_create(&mut self, task: Task) -> ApplyOutcome {
        self.remote_create(task)
    }

    /// Apply a remote deletion.
    pub fn apply_remote_delete(&mut self, task_id: &TaskId) -> ApplyOutcome {
        self.remote_delete(task_id)
    }

    /// Restore a task to its state before its unconfirmed changes.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotDirty`] if the task has no pending change.
    /// - [`StoreError::ConflictPending`] if the task has an open conflict.
    pub fn revert(&mut self, task_id: &TaskId) -> Result<Task, StoreError> {
        if self.conflicts.is_open(task_id) {
            return Err(StoreError::ConflictPending(task_id.clone()));
        }
        let pending = self
            .pending
            .remove(task_id)
            .ok_or_else(|| StoreError::NotDirty(task_id.clone()))?;
        tracing::debug!(task = %task_id, "reverted unconfirmed change");
        self.tasks.insert(task_id.clone(), pending.before.clone());
        Ok(pending.before)
    }

    /// Settle the open conflict for `task_id` with the chosen version.
    ///
    /// Choosing [`ConflictChoice::Local`] registers a fresh token so the
    /// hub's echo of the resolution is reconciled like any other change.
    /// Events queued behind the conflict are then replayed in order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if there is no open conflict.
    pub fn resolve(
        &mut self,
        task_id: &TaskId,
        choice: ConflictChoice,
    ) -> Result<Resolution, StoreError> {
        let (conflict, queued) = self.conflicts.take(task_id)?;
        let previous = self.pending.remove(task_id);
        let chosen = match choice {
            ConflictChoice::Local => conflict.local,
            ConflictChoice::Server => conflict.incoming,
        };
        self.tasks.insert(task_id.clone(), chosen.clone());

        let token = match choice {
            ConflictChoice::Local => {
                let before = previous.map_or_else(|| chosen.clone(), |p| p.before);
                let mut pending = PendingMutation::new(before);
                let token = pending.push(Expectation::Exact(Box::new(chosen.clone())));
                self.pending.insert(task_id.clone(), pending);
                Some(token)
            }
            ConflictChoice::Server => None,
        };
        tracing::info!(task = %task_id, ?choice, replaying = queued.len(), "conflict resolved");

        let replayed = queued.into_iter().map(|task| self.reconcile(task)).collect();
        Ok(Resolution {
            task: chosen,
            choice,
            token,
            replayed,
        })
    }

    /// Replace the dataset with a full snapshot.
    ///
    /// Tasks with unconfirmed changes or open conflicts are not overwritten:
    /// their snapshot version goes through the normal reconcile path. Tasks
    /// the snapshot omits no longer exist on the hub and are dropped along
    /// with any pending change or conflict. Returns the outcomes for tasks
    /// that had pending changes or conflicts; omitted ones are reported as
    /// [`ApplyOutcome::Deleted`].
    pub fn load_snapshot(&mut self, tasks: Vec<Task>, assignees: Vec<Assignee>) -> Vec<ApplyOutcome> {
        let incoming: HashSet<TaskId> = tasks.iter().map(|task| task.id.clone()).collect();
        let gone: Vec<TaskId> = self
            .tasks
            .keys()
            .filter(|id| !incoming.contains(*id))
            .cloned()
            .collect();

        let mut outcomes = Vec::new();
        for task_id in gone {
            if self.is_tracked(&task_id) {
                tracing::warn!(task = %task_id, "task with unconfirmed changes no longer exists");
                outcomes.push(self.remote_delete(&task_id));
            } else {
                self.tasks.remove(&task_id);
            }
        }
        outcomes.extend(self.merge_snapshot(tasks, assignees));
        outcomes
    }

    /// Merge a partial snapshot, such as the answer to a date-ranged fetch.
    ///
    /// Every task in `tasks` is applied like [`load_snapshot`](Self::load_snapshot)
    /// would; tasks absent from it are left alone. Assignees are replaced.
    pub fn merge_snapshot(
        &mut self,
        tasks: Vec<Task>,
        assignees: Vec<Assignee>,
    ) -> Vec<ApplyOutcome> {
        self.assignees = assignees
            .into_iter()
            .map(|assignee| (assignee.id.clone(), assignee))
            .collect();

        let mut outcomes = Vec::new();
        for task in tasks {
            if self.is_tracked(&task.id) {
                outcomes.push(self.reconcile(task));
            } else {
                self.tasks.insert(task.id.clone(), task);
            }
        }
        tracing::debug!(
            tasks = self.tasks.len(),
            assignees = self.assignees.len(),
            reconciled = outcomes.len(),
            "snapshot applied"
        );
        outcomes
    }

    /// Drop everything, including pending changes and conflicts.
    pub fn clear(&mut self) {
        self.tasks.clear();
        self.assignees.clear();
        self.pending.clear();
        self.conflicts.clear();
    }

    /// The dataset with unconfirmed changes rolled back, for caching.
    #[must_use]
    pub fn confirmed_snapshot(&self) -> (Vec<Task>, Vec<Assignee>) {
        let tasks = self
            .tasks
            .values()
            .map(|task| {
                self.pending
                    .get(&task.id)
                    .map_or_else(|| task.clone(), |p| p.before.clone())
            })
            .collect();
        (tasks, self.assignees.values().cloned().collect())
    }

    /// Look up a task.
    #[must_use]
    pub fn task(&self, task_id: &TaskId) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    /// Every task, ordered by id.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Look up an assignee.
    #[must_use]
    pub fn assignee(&self, assignee_id: &AssigneeId) -> Option<&Assignee> {
        self.assignees.get(assignee_id)
    }

    /// Every assignee, ordered by id.
    pub fn assignees(&self) -> impl Iterator<Item = &Assignee> {
        self.assignees.values()
    }

    /// Whether the task has unconfirmed local changes.
    #[must_use]
    pub fn is_dirty(&self, task_id: &TaskId) -> bool {
        self.pending.contains_key(task_id)
    }

    /// Token of the task's most recent unconfirmed change.
    #[must_use]
    pub fn pending_token(&self, task_id: &TaskId) -> Option<MutationToken> {
        self.pending.get(task_id).and_then(PendingMutation::latest_token)
    }

    /// The open conflict for a task.
    #[must_use]
    pub fn conflict(&self, task_id: &TaskId) -> Option<&Conflict> {
        self.conflicts.get(task_id)
    }

    /// Every open conflict, ordered by task id.
    #[must_use]
    pub fn conflicts(&self) -> Vec<&Conflict> {
        self.conflicts.open_conflicts()
    }

    /// Apply several changes optimistically as one unit.
    ///
    /// Either every change is applied or none is. Moves see the effect of
    /// earlier changes in the same batch. Returns one token per change, in
    /// order.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::EmptyBatch`] or [`ValidationError::DuplicateInBatch`].
    /// - The first error any change returns; see
    ///   [`apply_local_move`](Self::apply_local_move) and
    ///   [`apply_local_edit`](Self::apply_local_edit).
    pub fn apply_local_batch(
        &mut self,
        changes: &[TaskChange],
    ) -> Result<Vec<MutationToken>, StoreError> {
        if changes.is_empty() {
            return Err(ValidationError::EmptyBatch.into());
        }
        let mut seen = HashSet::new();
        if let Some(dup) = changes.iter().map(TaskChange::task_id).find(|id| !seen.insert(*id)) {
            return Err(ValidationError::DuplicateInBatch(dup.clone()).into());
        }

        let mut undo = Vec::with_capacity(changes.len());
        let mut tokens = Vec::with_capacity(changes.len());
        for change in changes {
            let task_id = change.task_id();
            let prior = (self.tasks.get(task_id).cloned(), self.pending.get(task_id).cloned());
            let result = match change {
                TaskChange::Move {
                    task_id,
                    assignee,
                    start,
                    end,
                } => self.apply_local_move(task_id, assignee.clone(), *start, *end),
                TaskChange::Edit { task_id, patch } => self.apply_local_edit(task_id, patch.clone()),
            };
            match result {
                Ok(token) => {
                    undo.push((task_id.clone(), prior));
                    tokens.push(token);
                }
                Err(e) => {
                    for (task_id, (task, pending)) in undo {
                        self.restore(task_id, task, pending);
                    }
                    return Err(e);
                }
            }
        }
        Ok(tokens)
    }

    fn restore(&mut self, task_id: TaskId, task: Option<Task>, pending: Option<PendingMutation>) {
        match pending {
            Some(pending) => self.pending.insert(task_id.clone(), pending),
            None => self.pending.remove(&task_id),
        };
        match task {
            Some(task) => self.tasks.insert(task_id, task),
            None => self.tasks.remove(&task_id),
        };
    }

    fn is_tracked(&self, task_id: &TaskId) -> bool {
        self.is_dirty(task_id) || self.conflicts.is_open(task_id)
    }

    fn local_move(
        &mut self,
        task_id: &TaskId,
        assignee: Option<AssigneeId>,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> Result<ApplyOutcome, StoreError> {
        let task = self.editable(task_id)?;
        let target = match &assignee {
            Some(id) => Some(
                self.assignees
                    .get(id)
                    .ok_or_else(|| ValidationError::UnknownAssignee(id.clone()))?,
            ),
            None => None,
        };
        let committed = assignee.as_ref().map_or(0.0, |id| {
            scheduling::scheduled_hours_for(id, self.tasks.values().filter(|t| t.id != *task_id))
        });
        let assessment = scheduling::is_valid_move(task, target, start, end, committed)?;

        let before = task.clone();
        let mut moved = before.clone();
        moved.assignee.clone_from(&assignee);
        moved.start = start;
        moved.end = assessment.end;
        let expectation = Expectation::Move {
            assignee,
            start,
            end: assessment.end,
        };
        if assessment.overallocated {
            tracing::debug!(
                task = %task_id,
                utilization = assessment.projected_utilization,
                "move overallocates target assignee"
            );
        }

        self.tasks.insert(task_id.clone(), moved);
        let token = self.register(task_id, before, expectation);
        Ok(ApplyOutcome::Pending {
            task_id: task_id.clone(),
            token,
            assessment: Some(assessment),
        })
    }

    fn local_edit(&mut self, task_id: &TaskId, patch: TaskPatch) -> Result<ApplyOutcome, StoreError> {
        scheduling::validate_patch(&patch)?;
        let task = self.editable(task_id)?;
        let before = task.clone();
        let mut edited = before.clone();
        patch.apply_to(&mut edited);

        self.tasks.insert(task_id.clone(), edited);
        let token = self.register(task_id, before, Expectation::Edit(patch));
        Ok(ApplyOutcome::Pending {
            task_id: task_id.clone(),
            token,
            assessment: None,
        })
    }

    fn editable(&self, task_id: &TaskId) -> Result<&Task, StoreError> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.clone()))?;
        if self.conflicts.is_open(task_id) {
            return Err(StoreError::ConflictPending(task_id.clone()));
        }
        Ok(task)
    }

    /// Add a change to the task's pending entry, keeping the oldest `before`.
    fn register(&mut self, task_id: &TaskId, before: Task, expectation: Expectation) -> MutationToken {
        let pending = self
            .pending
            .entry(task_id.clone())
            .or_insert_with(|| PendingMutation::new(before));
        let token = pending.push(expectation);
        tracing::debug!(
            task = %task_id,
            token = %token,
            outstanding = pending.outstanding(),
            "optimistic change applied"
        );
        token
    }

    /// The single path for authoritative task state.
    fn reconcile(&mut self, incoming: Task) -> ApplyOutcome {
        let task_id = incoming.id.clone();
        if self.conflicts.is_open(&task_id) {
            return if self.conflicts.enqueue(incoming) {
                ApplyOutcome::Queued(task_id)
            } else {
                ApplyOutcome::Ignored
            };
        }

        let Some(pending) = self.pending.get_mut(&task_id) else {
            self.tasks.insert(task_id.clone(), incoming);
            return ApplyOutcome::Replaced(task_id);
        };

        if let Some(token) = pending.confirm(&incoming) {
            let settled = pending.is_settled();
            if settled {
                self.pending.remove(&task_id);
                self.tasks.insert(task_id.clone(), incoming);
            }
            tracing::debug!(task = %task_id, token = %token, settled, "change confirmed");
            return ApplyOutcome::Confirmed {
                task_id,
                token,
                settled,
            };
        }

        let Some(local_token) = pending.latest_token() else {
            self.pending.remove(&task_id);
            self.tasks.insert(task_id.clone(), incoming);
            return ApplyOutcome::Replaced(task_id);
        };
        let Some(local) = self.tasks.get(&task_id).cloned() else {
            self.pending.remove(&task_id);
            self.tasks.insert(task_id.clone(), incoming);
            return ApplyOutcome::Replaced(task_id);
        };
        let conflict = Conflict {
            task_id,
            local,
            incoming,
            local_token,
        };
        self.conflicts.open(conflict.clone());
        ApplyOutcome::ConflictOpened(conflict)
    }

    fn remote_create(&mut self, task: Task) -> ApplyOutcome {
        if self.tasks.contains_key(&task.id) {
            return self.reconcile(task);
        }
        let task_id = task.id.clone();
        self.tasks.insert(task_id.clone(), task);
        ApplyOutcome::Created(task_id)
    }

    fn remote_delete(&mut self, task_id: &TaskId) -> ApplyOutcome {
        if self.tasks.remove(task_id).is_none() {
            return ApplyOutcome::Ignored;
        }
        if self.pending.remove(task_id).is_some() {
            tracing::debug!(task = %task_id, "deleted task had unconfirmed changes");
        }
        self.conflicts.discard(task_id);
        ApplyOutcome::Deleted(task_id.clone())
    }

    fn capacity_change(&mut self, assignee_id: AssigneeId, capacity_hours: f64) -> ApplyOutcome {
        match self.assignees.get_mut(&assignee_id) {
            Some(assignee) => {
                assignee.capacity_hours = capacity_hours.max(0.0);
                ApplyOutcome::CapacityUpdated(assignee_id)
            }
            None => {
                tracing::debug!(assignee = %assignee_id, "capacity change for unknown assignee ignored");
                ApplyOutcome::Ignored
            }
        }
    }
}
