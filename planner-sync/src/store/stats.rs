//! Statistics and queries derived from the store's current maps.
//!
//! Nothing here is cached; every call walks the tasks again, so the
//! numbers always reflect the latest optimistic state.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDateTime;

use planner_proto::task::{Assignee, AssigneeId, Priority, Task, TaskId, TaskStatus};

use super::EntityStore;
use crate::scheduling::{
    self, OVERALLOCATION_THRESHOLD, Suggestion, UNDERUTILIZATION_THRESHOLD,
};

/// Totals across the whole workspace.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WorkloadStats {
    /// Number of assignees.
    pub total_assignees: usize,
    /// Number of tasks.
    pub total_tasks: usize,
    /// Tasks with both dates.
    pub scheduled_tasks: usize,
    /// Tasks missing a date.
    pub unscheduled_tasks: usize,
    /// Open tasks whose end has passed.
    pub overdue_tasks: usize,
    /// Sum of all capacities.
    pub total_capacity_hours: f64,
    /// Sum of scheduled task durations.
    pub total_scheduled_hours: f64,
    /// Scheduled hours over capacity, rounded.
    pub overall_utilization: u32,
    /// Mean of the per-assignee rounded utilizations.
    pub average_utilization: f64,
}

/// Capacity totals and the number of assignees at either extreme.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CapacityMetrics {
    /// Sum of all capacities.
    pub total_capacity_hours: f64,
    /// Hours scheduled against assignees.
    pub allocated_hours: f64,
    /// Unallocated capacity, never negative.
    pub available_hours: f64,
    /// Allocated over capacity, rounded.
    pub overall_utilization: u32,
    /// Assignees above the overallocation threshold.
    pub overallocated_count: usize,
    /// Assignees below the underutilization threshold.
    pub underutilized_count: usize,
}

/// An assignee together with their current utilization.
#[derive(Debug, Clone, PartialEq)]
pub struct AssigneeLoad<'a> {
    /// The assignee.
    pub assignee: &'a Assignee,
    /// Rounded utilization in percent.
    pub utilization: u32,
}

/// Criteria for [`EntityStore::filter_tasks`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    /// Any of these statuses.
    pub status: Vec<TaskStatus>,
    /// Any of these priorities.
    pub priority: Vec<Priority>,
    /// Assigned to this assignee.
    pub assignee: Option<AssigneeId>,
    /// Project name contains this text, ignoring case.
    pub project: Option<String>,
    /// Only scheduled (`true`) or only unscheduled (`false`) tasks.
    pub scheduled: Option<bool>,
    /// Overlapping this inclusive range. Unscheduled tasks always pass.
    pub date_range: Option<(NaiveDateTime, NaiveDateTime)>,
}

impl TaskFilter {
    /// Whether `task` satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        if !self.status.is_empty() && !self.status.contains(&task.status) {
            return false;
        }
        if !self.priority.is_empty() && !self.priority.contains(&task.priority) {
            return false;
        }
        if let Some(assignee) = &self.assignee
            && !task.is_assigned_to(assignee)
        {
            return false;
        }
        if let Some(needle) = &self.project {
            let needle = needle.to_lowercase();
            let hit = task
                .project
                .as_ref()
                .is_some_and(|p| p.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
        if let Some(scheduled) = self.scheduled
            && task.is_scheduled() != scheduled
        {
            return false;
        }
        if let Some((from, to)) = self.date_range
            && let (Some(start), Some(end)) = (task.start, task.end)
        {
            return scheduling::ranges_overlap(start, end, from, to);
        }
        true
    }
}

impl EntityStore {
    /// Rounded utilization of one assignee; `None` if unknown.
    #[must_use]
    pub fn utilization(&self, assignee_id: &AssigneeId) -> Option<u32> {
        self.assignees
            .get(assignee_id)
            .map(|assignee| scheduling::utilization(assignee, self.tasks.values()))
    }

    /// Workspace totals as of `now`.
    #[must_use]
    pub fn workload_stats(&self, now: NaiveDateTime) -> WorkloadStats {
        let scheduled_tasks = self.tasks.values().filter(|t| t.is_scheduled()).count();
        let total_capacity_hours: f64 = self.assignees.values().map(|a| a.capacity_hours).sum();
        let total_scheduled_hours: f64 = self.tasks.values().map(Task::scheduled_hours).sum();
        let loads = self.assignee_loads();
        #[allow(clippy::cast_precision_loss)]
        let average_utilization = if loads.is_empty() {
            0.0
        } else {
            loads.iter().map(|l| f64::from(l.utilization)).sum::<f64>() / loads.len() as f64
        };

        WorkloadStats {
            total_assignees: self.assignees.len(),
            total_tasks: self.tasks.len(),
            scheduled_tasks,
            unscheduled_tasks: self.tasks.len() - scheduled_tasks,
            overdue_tasks: self.tasks.values().filter(|t| t.is_overdue(now)).count(),
            total_capacity_hours,
            total_scheduled_hours,
            overall_utilization: scheduling::round_percent(scheduling::utilization_percent(
                total_scheduled_hours,
                total_capacity_hours,
            )),
            average_utilization,
        }
    }

    /// Assignees above 120 %, most loaded first.
    ///
    /// The threshold is checked against the rounded percentage each load reports.
    #[must_use]
    pub fn overallocated_assignees(&self) -> Vec<AssigneeLoad<'_>> {
        let mut loads: Vec<_> = self
            .assignees
            .values()
            .map(|assignee| self.load_of(assignee))
            .filter(|load| f64::from(load.utilization) > OVERALLOCATION_THRESHOLD)
            .collect();
        loads.sort_by(|a, b| b.utilization.cmp(&a.utilization));
        loads
    }

    /// Assignees with some work but below 70 %, least loaded first.
    #[must_use]
    pub fn underutilized_assignees(&self) -> Vec<AssigneeLoad<'_>> {
        let mut loads: Vec<_> = self
            .assignees
            .values()
            .map(|assignee| self.load_of(assignee))
            .filter(|load| {
                load.utilization > 0 && f64::from(load.utilization) < UNDERUTILIZATION_THRESHOLD
            })
            .collect();
        loads.sort_by_key(|l| l.utilization);
        loads
    }

    /// Capacity totals.
    #[must_use]
    pub fn capacity_metrics(&self) -> CapacityMetrics {
        let total_capacity_hours: f64 = self.assignees.values().map(|a| a.capacity_hours).sum();
        let allocated_hours: f64 = self
            .assignees
            .keys()
            .map(|id| scheduling::scheduled_hours_for(id, self.tasks.values()))
            .sum();
        CapacityMetrics {
            total_capacity_hours,
            allocated_hours,
            available_hours: (total_capacity_hours - allocated_hours).max(0.0),
            overall_utilization: scheduling::round_percent(scheduling::utilization_percent(
                allocated_hours,
                total_capacity_hours,
            )),
            overallocated_count: self.overallocated_assignees().len(),
            underutilized_count: self.underutilized_assignees().len(),
        }
    }

    /// Task count per status; statuses with no tasks are absent.
    #[must_use]
    pub fn tasks_by_status(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    /// Task count per priority, lowest first.
    #[must_use]
    pub fn tasks_by_priority(&self) -> BTreeMap<Priority, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.priority).or_insert(0) += 1;
        }
        counts
    }

    /// Tasks matching `filter`, ordered by id.
    #[must_use]
    pub fn filter_tasks(&self, filter: &TaskFilter) -> Vec<&Task> {
        self.tasks.values().filter(|t| filter.matches(t)).collect()
    }

    /// Assignees in `department` (exact match) whose rounded utilization
    /// lies in the inclusive `utilization` range.
    #[must_use]
    pub fn filter_assignees(
        &self,
        department: Option<&str>,
        utilization: Option<(u32, u32)>,
    ) -> Vec<AssigneeLoad<'_>> {
        self.assignee_loads()
            .into_iter()
            .filter(|load| {
                department.is_none_or(|d| load.assignee.department.as_deref() == Some(d))
            })
            .filter(|load| {
                utilization.is_none_or(|(min, max)| (min..=max).contains(&load.utilization))
            })
            .collect()
    }

    /// Scheduled tasks overlapping the inclusive range.
    #[must_use]
    pub fn tasks_in_range(&self, from: NaiveDateTime, to: NaiveDateTime) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|task| match (task.start, task.end) {
                (Some(start), Some(end)) => scheduling::ranges_overlap(start, end, from, to),
                _ => false,
            })
            .collect()
    }

    /// Candidate assignees for a task; empty if the task is unknown.
    #[must_use]
    pub fn suggest_assignees(&self, task_id: &TaskId) -> Vec<Suggestion> {
        let Some(task) = self.tasks.get(task_id) else {
            return Vec::new();
        };
        let tasks: Vec<&Task> = self.tasks.values().collect();
        scheduling::suggest_assignees(task, self.assignees.values(), &tasks)
    }

    fn load_of<'a>(&'a self, assignee: &'a Assignee) -> AssigneeLoad<'a> {
        AssigneeLoad {
            assignee,
            utilization: scheduling::utilization(assignee, self.tasks.values()),
        }
    }

    fn assignee_loads(&self) -> Vec<AssigneeLoad<'_>> {
        self.assignees.values().map(|a| self.load_of(a)).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 2, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn task(id: &str, who: Option<&str>, hours: f64, day: Option<u32>) -> Task {
        let mut t = Task::new(id, id, hours);
        t.assignee = who.map(AssigneeId::new);
        if let Some(d) = day {
            t.start = Some(at(d, 9));
            t.end = Some(at(d, 17));
        }
        t
    }

    fn store() -> EntityStore {
        let mut ann = Assignee::new("ann", "Ann", 40.0);
        ann.department = Some("eng".into());
        let mut ben = Assignee::new("ben", "Ben", 10.0);
        ben.department = Some("eng".into());
        let cy = Assignee::new("cy", "Cy", 20.0);
        let idle = Assignee::new("idle", "Idle", 0.0);

        let mut overdue = task("t4", Some("cy"), 4.0, Some(1));
        overdue.priority = Priority::Urgent;
        overdue.project = Some("Apollo Launch".into());
        let mut done = task("t5", Some("cy"), 2.0, Some(2));
        done.status = TaskStatus::Completed;

        let mut store = EntityStore::new();
        store.load_snapshot(
            vec![
                task("t1", Some("ann"), 10.0, Some(5)),
                task("t2", Some("ben"), 13.0, Some(6)),
                task("t3", Some("ann"), 6.0, None),
                overdue,
                done,
                task("t6", None, 3.0, Some(7)),
            ],
            vec![ann, ben, cy, idle],
        );
        store
    }

    #[test]
    fn utilization_counts_only_scheduled_tasks() {
        let store = store();
        assert_eq!(store.utilization(&"ann".into()), Some(25));
        assert_eq!(store.utilization(&"ben".into()), Some(130));
        assert_eq!(store.utilization(&"idle".into()), Some(0));
        assert_eq!(store.utilization(&"ghost".into()), None);
    }

    #[test]
    fn workload_totals() {
        let stats = store().workload_stats(at(3, 0));
        assert_eq!(stats.total_assignees, 4);
        assert_eq!(stats.total_tasks, 6);
        assert_eq!(stats.scheduled_tasks, 5);
        assert_eq!(stats.unscheduled_tasks, 1);
        assert_eq!(stats.overdue_tasks, 1);
        assert!((stats.total_capacity_hours - 70.0).abs() < f64::EPSILON);
        assert!((stats.total_scheduled_hours - 32.0).abs() < f64::EPSILON);
        assert_eq!(stats.overall_utilization, 46);
        // (25 + 130 + 30 + 0) / 4
        assert!((stats.average_utilization - 46.25).abs() < 1e-9);
    }

    #[test]
    fn empty_store_has_zero_stats() {
        let stats = EntityStore::new().workload_stats(at(1, 0));
        assert_eq!(stats, WorkloadStats::default());
    }

    #[test]
    fn extremes_use_thresholds() {
        let store = store();
        let over: Vec<_> = store
            .overallocated_assignees()
            .iter()
            .map(|l| l.assignee.id.clone())
            .collect();
        assert_eq!(over, vec![AssigneeId::new("ben")]);

        let under: Vec<_> = store
            .underutilized_assignees()
            .iter()
            .map(|l| (l.assignee.id.clone(), l.utilization))
            .collect();
        assert_eq!(
            under,
            vec![(AssigneeId::new("ann"), 25), (AssigneeId::new("cy"), 30)]
        );
    }

    #[test]
    fn thresholds_apply_to_the_reported_percentage() {
        let mut store = EntityStore::new();
        store.load_snapshot(
            vec![
                task("x", Some("near-over"), 1204.0, Some(1)),
                task("y", Some("near-under"), 696.0, Some(1)),
            ],
            vec![
                Assignee::new("near-over", "Over", 1000.0),
                Assignee::new("near-under", "Under", 1000.0),
            ],
        );
        assert_eq!(store.utilization(&"near-over".into()), Some(120));
        assert_eq!(store.utilization(&"near-under".into()), Some(70));
        assert!(store.overallocated_assignees().is_empty());
        assert!(store.underutilized_assignees().is_empty());
    }

    #[test]
    fn capacity_metrics_clamp_available() {
        let metrics = store().capacity_metrics();
        assert!((metrics.allocated_hours - 29.0).abs() < f64::EPSILON);
        assert!((metrics.available_hours - 41.0).abs() < f64::EPSILON);
        assert_eq!(metrics.overallocated_count, 1);
        assert_eq!(metrics.underutilized_count, 2);

        let mut tight = EntityStore::new();
        tight.load_snapshot(
            vec![task("x", Some("a"), 30.0, Some(1))],
            vec![Assignee::new("a", "A", 10.0)],
        );
        assert!(tight.capacity_metrics().available_hours.abs() < f64::EPSILON);
        assert_eq!(tight.capacity_metrics().overall_utilization, 300);
    }

    #[test]
    fn group_counts() {
        let store = store();
        let by_status = store.tasks_by_status();
        assert_eq!(by_status.get(&TaskStatus::Open), Some(&5));
        assert_eq!(by_status.get(&TaskStatus::Completed), Some(&1));
        assert_eq!(by_status.get(&TaskStatus::Working), None);

        let by_priority = store.tasks_by_priority();
        assert_eq!(by_priority.get(&Priority::Urgent), Some(&1));
        assert_eq!(by_priority.get(&Priority::Medium), Some(&5));
    }

    #[test]
    fn filter_by_fields() {
        let store = store();
        let ids = |filter: &TaskFilter| -> Vec<String> {
            store
                .filter_tasks(filter)
                .iter()
                .map(|t| t.id.to_string())
                .collect()
        };

        assert_eq!(ids(&TaskFilter::default()).len(), 6);
        assert_eq!(
            ids(&TaskFilter {
                project: Some("apollo".into()),
                ..TaskFilter::default()
            }),
            vec!["t4"]
        );
        assert_eq!(
            ids(&TaskFilter {
                assignee: Some("ann".into()),
                scheduled: Some(false),
                ..TaskFilter::default()
            }),
            vec!["t3"]
        );
        assert_eq!(
            ids(&TaskFilter {
                status: vec![TaskStatus::Completed],
                priority: vec![Priority::Medium],
                ..TaskFilter::default()
            }),
            vec!["t5"]
        );
    }

    #[test]
    fn date_range_filter_keeps_unscheduled() {
        let store = store();
        let filter = TaskFilter {
            date_range: Some((at(5, 0), at(6, 0))),
            ..TaskFilter::default()
        };
        let ids: Vec<_> = store
            .filter_tasks(&filter)
            .iter()
            .map(|t| t.id.to_string())
            .collect();
        assert_eq!(ids, vec!["t1", "t3"]);

        let in_range: Vec<_> = store
            .tasks_in_range(at(5, 0), at(6, 12))
            .iter()
            .map(|t| t.id.to_string())
            .collect();
        assert_eq!(in_range, vec!["t1", "t2"]);
    }

    #[test]
    fn filter_assignees_by_department_and_load() {
        let store = store();
        let eng: Vec<_> = store
            .filter_assignees(Some("eng"), None)
            .iter()
            .map(|l| l.assignee.id.to_string())
            .collect();
        assert_eq!(eng, vec!["ann", "ben"]);

        let light: Vec<_> = store
            .filter_assignees(None, Some((0, 30)))
            .iter()
            .map(|l| l.assignee.id.to_string())
            .collect();
        assert_eq!(light, vec!["ann", "cy", "idle"]);
    }

    #[test]
    fn suggestions_skip_full_assignees() {
        let store = store();
        let names: Vec<_> = store
            .suggest_assignees(&TaskId::new("t6"))
            .into_iter()
            .map(|s| s.assignee_id.to_string())
            .collect();
        assert_eq!(names, vec!["ann", "cy"]);
        assert!(store.suggest_assignees(&TaskId::new("nope")).is_empty());
    }
}
