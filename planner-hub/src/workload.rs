//! In-memory workload data for the hub.
//!
//! One [`Workspace`] per [`WorkspaceKey`] holding the authoritative tasks
//! and assignees. Workspaces are created empty on first use and can be
//! seeded from a JSON file at startup. Data is lost on restart.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use chrono::NaiveDateTime;
use serde::Deserialize;
use tokio::sync::RwLock;

use planner_proto::command::{DateRange, TaskChange};
use planner_proto::event::FailureKind;
use planner_proto::task::{
    Assignee, AssigneeId, MAX_TASK_TITLE_LENGTH, Task, TaskId, TaskPatch, WorkspaceKey,
};

/// Errors returned when a command cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkloadError {
    /// The task does not exist in the workspace.
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    /// The change is not acceptable.
    #[error("{0}")]
    Invalid(String),
    /// One change of a batch failed; nothing in the batch was applied.
    #[error("batch change to {task_id} failed: {source}")]
    Batch {
        /// Task whose change failed.
        task_id: TaskId,
        /// Why it failed.
        source: Box<WorkloadError>,
    },
}

impl WorkloadError {
    /// The `command_failed` category for this error.
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::TaskNotFound(_) => FailureKind::NotFound,
            Self::Invalid(_) => FailureKind::Validation,
            Self::Batch { source, .. } => source.failure_kind(),
        }
    }

    /// The task the failure is about, when it names one.
    #[must_use]
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::TaskNotFound(task_id) | Self::Batch { task_id, .. } => Some(task_id),
            Self::Invalid(_) => None,
        }
    }
}

/// Errors raised while loading a seed file.
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    /// The file could not be read.
    #[error("failed to read seed file: {0}")]
    Read(#[from] std::io::Error),
    /// The file is not valid seed JSON.
    #[error("failed to parse seed file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tasks and assignees of one workspace.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Workspace {
    /// Every task, keyed by id.
    #[serde(deserialize_with = "tasks_by_id", default)]
    pub tasks: BTreeMap<TaskId, Task>,
    /// Every assignee, keyed by id.
    #[serde(deserialize_with = "assignees_by_id", default)]
    pub assignees: BTreeMap<AssigneeId, Assignee>,
}

fn tasks_by_id<'de, D>(deserializer: D) -> Result<BTreeMap<TaskId, Task>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let tasks = Vec::<Task>::deserialize(deserializer)?;
    Ok(tasks.into_iter().map(|t| (t.id.clone(), t)).collect())
}

fn assignees_by_id<'de, D>(deserializer: D) -> Result<BTreeMap<AssigneeId, Assignee>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let assignees = Vec::<Assignee>::deserialize(deserializer)?;
    Ok(assignees.into_iter().map(|a| (a.id.clone(), a)).collect())
}

impl Workspace {
    /// Builds a workspace from lists.
    #[must_use]
    pub fn new(tasks: Vec<Task>, assignees: Vec<Assignee>) -> Self {
        Self {
            tasks: tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
            assignees: assignees.into_iter().map(|a| (a.id.clone(), a)).collect(),
        }
    }
}

/// Seed file layout: `{"workspaces": {"engineering": {"tasks": [...], "assignees": [...]}}}`.
#[derive(Debug, Default, Deserialize)]
struct SeedFile {
    #[serde(default)]
    workspaces: HashMap<WorkspaceKey, Workspace>,
}

/// Authoritative task data for every workspace the hub serves.
///
/// Thread-safe via [`RwLock`].
pub struct WorkloadStore {
    workspaces: RwLock<HashMap<WorkspaceKey, Workspace>>,
}

impl Default for WorkloadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkloadStore {
    /// Creates a store with no workspaces.
    #[must_use]
    pub fn new() -> Self {
        Self {
            workspaces: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a store from a seed file.
    ///
    /// # Errors
    ///
    /// Returns [`SeedError`] if the file cannot be read or parsed.
    pub fn from_seed_file(path: &Path) -> Result<Self, SeedError> {
        let contents = std::fs::read_to_string(path)?;
        let seed: SeedFile = serde_json::from_str(&contents)?;
        tracing::info!(workspaces = seed.workspaces.len(), "seed data loaded");
        Ok(Self {
            workspaces: RwLock::new(seed.workspaces),
        })
    }

    /// Replaces the contents of a workspace.
    pub async fn seed(&self, key: WorkspaceKey, workspace: Workspace) {
        self.workspaces.write().await.insert(key, workspace);
    }

    /// Tasks and assignees of `key`.
    ///
    /// With a range, only tasks overlapping it are returned; unscheduled
    /// tasks are always included.
    pub async fn snapshot(
        &self,
        key: &WorkspaceKey,
        range: Option<DateRange>,
    ) -> (Vec<Task>, Vec<Assignee>) {
        let workspaces = self.workspaces.read().await;
        let Some(workspace) = workspaces.get(key) else {
            return (Vec::new(), Vec::new());
        };
        let tasks = workspace
            .tasks
            .values()
            .filter(|t| range.is_none_or(|r| overlaps(t, &r)))
            .cloned()
            .collect();
        let assignees = workspace.assignees.values().cloned().collect();
        (tasks, assignees)
    }

    /// Current state of one task.
    pub async fn task(&self, key: &WorkspaceKey, task_id: &TaskId) -> Option<Task> {
        let workspaces = self.workspaces.read().await;
        workspaces.get(key)?.tasks.get(task_id).cloned()
    }

    /// Reassign and/or reschedule a task.
    ///
    /// # Errors
    ///
    /// - [`WorkloadError::TaskNotFound`] if the task does not exist.
    /// - [`WorkloadError::Invalid`] if the assignee is unknown, only one
    ///   date is given, or the end precedes the start.
    pub async fn apply_move(
        &self,
        key: &WorkspaceKey,
        task_id: &TaskId,
        assignee: Option<AssigneeId>,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> Result<Task, WorkloadError> {
        let mut workspaces = self.workspaces.write().await;
        let workspace = workspaces.entry(key.clone()).or_default();
        move_in(workspace, task_id, assignee, start, end)
    }

    /// Change descriptive fields of a task.
    ///
    /// # Errors
    ///
    /// - [`WorkloadError::TaskNotFound`] if the task does not exist.
    /// - [`WorkloadError::Invalid`] if the patch is empty or out of range.
    pub async fn apply_edit(
        &self,
        key: &WorkspaceKey,
        task_id: &TaskId,
        patch: &TaskPatch,
    ) -> Result<Task, WorkloadError> {
        let mut workspaces = self.workspaces.write().await;
        let workspace = workspaces
            .get_mut(key)
            .ok_or_else(|| WorkloadError::TaskNotFound(task_id.clone()))?;
        edit_in(workspace, task_id, patch)
    }

    /// Apply every change of a batch, or none of them.
    ///
    /// Returns the changed tasks in batch order.
    ///
    /// # Errors
    ///
    /// - [`WorkloadError::Invalid`] if the batch is empty or names a task twice.
    /// - [`WorkloadError::Batch`] wrapping the first change that fails.
    pub async fn apply_batch(
        &self,
        key: &WorkspaceKey,
        changes: &[TaskChange],
    ) -> Result<Vec<Task>, WorkloadError> {
        if changes.is_empty() {
            return Err(WorkloadError::Invalid("batch is empty".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = changes.iter().map(TaskChange::task_id).find(|id| !seen.insert(*id)) {
            return Err(WorkloadError::Invalid(format!("task {dup} appears twice in batch")));
        }

        let mut workspaces = self.workspaces.write().await;
        let workspace = workspaces.entry(key.clone()).or_default();
        let mut draft = workspace.clone();
        let mut changed = Vec::with_capacity(changes.len());
        for change in changes {
            let result = match change {
                TaskChange::Move {
                    task_id,
                    assignee,
                    start,
                    end,
                } => move_in(&mut draft, task_id, assignee.clone(), *start, *end),
                TaskChange::Edit { task_id, patch } => edit_in(&mut draft, task_id, patch),
            };
            changed.push(result.map_err(|source| WorkloadError::Batch {
                task_id: change.task_id().clone(),
                source: Box::new(source),
            })?);
        }
        *workspace = draft;
        Ok(changed)
    }

    /// Overwrite a task with the version a client kept after a conflict.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadError::TaskNotFound`] if the task does not exist.
    pub async fn replace(&self, key: &WorkspaceKey, task: Task) -> Result<Task, WorkloadError> {
        let mut workspaces = self.workspaces.write().await;
        let slot = workspaces
            .get_mut(key)
            .and_then(|w| w.tasks.get_mut(&task.id))
            .ok_or_else(|| WorkloadError::TaskNotFound(task.id.clone()))?;
        *slot = task;
        Ok(slot.clone())
    }

    /// Add or replace a task, returning whether it was new.
    pub async fn upsert(&self, key: &WorkspaceKey, task: Task) -> bool {
        let mut workspaces = self.workspaces.write().await;
        workspaces
            .entry(key.clone())
            .or_default()
            .tasks
            .insert(task.id.clone(), task)
            .is_none()
    }

    /// Remove a task, returning whether it existed.
    pub async fn remove(&self, key: &WorkspaceKey, task_id: &TaskId) -> bool {
        let mut workspaces = self.workspaces.write().await;
        workspaces
            .get_mut(key)
            .is_some_and(|w| w.tasks.remove(task_id).is_some())
    }

    /// Set an assignee's capacity; returns the stored value.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadError::Invalid`] if the assignee is unknown.
    pub async fn set_capacity(
        &self,
        key: &WorkspaceKey,
        assignee_id: &AssigneeId,
        capacity_hours: f64,
    ) -> Result<f64, WorkloadError> {
        let mut workspaces = self.workspaces.write().await;
        let assignee = workspaces
            .get_mut(key)
            .and_then(|w| w.assignees.get_mut(assignee_id))
            .ok_or_else(|| WorkloadError::Invalid(format!("unknown assignee {assignee_id}")))?;
        assignee.capacity_hours = capacity_hours.max(0.0);
        Ok(assignee.capacity_hours)
    }
}

fn move_in(
    workspace: &mut Workspace,
    task_id: &TaskId,
    assignee: Option<AssigneeId>,
    start: Option<NaiveDateTime>,
    end: Option<NaiveDateTime>,
) -> Result<Task, WorkloadError> {
    if start.is_some() != end.is_some() {
        return Err(WorkloadError::Invalid(
            "start and end must be given together".into(),
        ));
    }
    if let (Some(start), Some(end)) = (start, end)
        && end < start
    {
        return Err(WorkloadError::Invalid("end precedes start".into()));
    }
    if let Some(id) = &assignee
        && !workspace.assignees.contains_key(id)
    {
        return Err(WorkloadError::Invalid(format!("unknown assignee {id}")));
    }
    let task = workspace
        .tasks
        .get_mut(task_id)
        .ok_or_else(|| WorkloadError::TaskNotFound(task_id.clone()))?;
    task.assignee = assignee;
    task.start = start;
    task.end = end;
    Ok(task.clone())
}

fn edit_in(workspace: &mut Workspace, task_id: &TaskId, patch: &TaskPatch) -> Result<Task, WorkloadError> {
    check_patch(patch)?;
    let task = workspace
        .tasks
        .get_mut(task_id)
        .ok_or_else(|| WorkloadError::TaskNotFound(task_id.clone()))?;
    patch.apply_to(task);
    Ok(task.clone())
}

fn overlaps(task: &Task, range: &DateRange) -> bool {
    match (task.start, task.end) {
        (Some(start), Some(end)) => start <= range.end && end >= range.start,
        _ => true,
    }
}

fn check_patch(patch: &TaskPatch) -> Result<(), WorkloadError> {
    if patch.is_empty() {
        return Err(WorkloadError::Invalid("edit changes nothing".into()));
    }
    if let Some(title) = &patch.title {
        let len = title.trim().chars().count();
        if len == 0 || len > MAX_TASK_TITLE_LENGTH {
            return Err(WorkloadError::Invalid(format!(
                "title must be 1..={MAX_TASK_TITLE_LENGTH} characters"
            )));
        }
    }
    if patch.progress.is_some_and(|p| p > 100) {
        return Err(WorkloadError::Invalid("progress must be 0..=100".into()));
    }
    if patch
        .duration_hours
        .is_some_and(|d| !d.is_finite() || d < 0.0)
    {
        return Err(WorkloadError::Invalid("duration must be non-negative".into()));
    }
    Ok(())
}
