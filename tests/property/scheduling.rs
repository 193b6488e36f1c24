//! Property-based tests for scheduling rules and store reconciliation.
//!
//! Uses proptest to verify:
//! 1. A task is scheduled exactly when it has both a start and an end.
//! 2. Utilization is `round(hours / capacity × 100)` and zero for zero capacity.
//! 3. A derived end never precedes its start and is a whole number of hours later.
//! 4. Moves with an end before the start are always rejected.
//! 5. Applying the same remote update twice leaves the store unchanged.

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use planner_proto::task::{Assignee, AssigneeId, Task};
use planner_sync::scheduling::{self, ValidationError};
use planner_sync::store::EntityStore;
use proptest::prelude::*;

// --- Strategies ---

/// Timestamps within 2026, at minute resolution.
fn arb_datetime() -> impl Strategy<Value = NaiveDateTime> {
    (0i64..365 * 24 * 60).prop_map(|minutes| {
        NaiveDate::from_ymd_opt(2026, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            + TimeDelta::minutes(minutes)
    })
}

fn arb_duration() -> impl Strategy<Value = f64> {
    0.0f64..200.0
}

fn arb_task(id: &'static str) -> impl Strategy<Value = Task> {
    (
        "[a-zA-Z ]{1,40}",
        arb_duration(),
        prop::option::of(0u8..3),
        prop::option::of(arb_datetime()),
        0u8..=100,
    )
        .prop_map(move |(title, hours, assignee, start, progress)| {
            let mut task = Task::new(id, title, hours);
            task.assignee = assignee.map(|n| AssigneeId::new(format!("a{n}")));
            task.start = start;
            task.end = start.map(|s| scheduling::derive_end_date(s, hours));
            task.progress = progress;
            task
        })
}

proptest! {
    #[test]
    fn scheduled_iff_both_dates(
        start in prop::option::of(arb_datetime()),
        end in prop::option::of(arb_datetime()),
    ) {
        let mut task = Task::new("t1", "Task", 4.0);
        task.start = start;
        task.end = end;
        prop_assert_eq!(task.is_scheduled(), start.is_some() && end.is_some());
        if !task.is_scheduled() {
            prop_assert!(task.scheduled_hours().abs() < f64::EPSILON);
        }
    }

    #[test]
    fn utilization_matches_formula(
        durations in prop::collection::vec(arb_duration(), 0..10),
        capacity in 0.0f64..80.0,
        start in arb_datetime(),
    ) {
        let assignee = Assignee::new("a1", "Ada", capacity);
        let tasks: Vec<Task> = durations
            .iter()
            .enumerate()
            .map(|(i, hours)| {
                let mut task = Task::new(format!("t{i}"), "Task", *hours);
                task.assignee = Some(assignee.id.clone());
                task.start = Some(start);
                task.end = Some(scheduling::derive_end_date(start, *hours));
                task
            })
            .collect();

        let hours: f64 = durations.iter().sum();
        let expected = if capacity > 0.0 {
            scheduling::round_percent(hours / capacity * 100.0)
        } else {
            0
        };
        prop_assert_eq!(scheduling::utilization(&assignee, &tasks), expected);
    }

    #[test]
    fn unassigned_or_unscheduled_tasks_do_not_count(
        hours in arb_duration(),
        start in arb_datetime(),
    ) {
        let assignee = Assignee::new("a1", "Ada", 40.0);
        let mut elsewhere = Task::new("t1", "Task", hours);
        elsewhere.assignee = Some(AssigneeId::new("a2"));
        elsewhere.start = Some(start);
        elsewhere.end = Some(start);
        let mut unscheduled = Task::new("t2", "Task", hours);
        unscheduled.assignee = Some(assignee.id.clone());

        prop_assert_eq!(scheduling::utilization(&assignee, [&elsewhere, &unscheduled]), 0);
    }

    #[test]
    fn derived_end_is_whole_hours_after_start(
        start in arb_datetime(),
        hours in -10.0f64..500.0,
    ) {
        let end = scheduling::derive_end_date(start, hours);
        prop_assert!(end >= start);
        let delta = end - start;
        prop_assert_eq!(delta.num_seconds() % 3600, 0);
        let expected = if hours > 0.0 { hours.round() } else { 0.0 };
        #[allow(clippy::cast_precision_loss)]
        let actual = delta.num_hours() as f64;
        prop_assert!((actual - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn end_before_start_is_rejected(
        start in arb_datetime(),
        back in 1i64..10_000,
    ) {
        let task = Task::new("t1", "Task", 4.0);
        let end = start - TimeDelta::minutes(back);
        let result = scheduling::is_valid_move(&task, None, Some(start), Some(end), 0.0);
        prop_assert_eq!(result, Err(ValidationError::EndBeforeStart { start, end }));
    }

    #[test]
    fn move_assessment_flags_overallocation(
        committed in 0.0f64..100.0,
        hours in arb_duration(),
        start in arb_datetime(),
    ) {
        let assignee = Assignee::new("a1", "Ada", 40.0);
        let task = Task::new("t1", "Task", hours);
        let assessment =
            scheduling::is_valid_move(&task, Some(&assignee), Some(start), None, committed)
                .unwrap();
        prop_assert!((assessment.projected_hours - (committed + hours)).abs() < 1e-9);
        prop_assert_eq!(
            assessment.overallocated,
            (committed + hours) / 40.0 * 100.0 > 100.0
        );
        prop_assert_eq!(assessment.end, Some(scheduling::derive_end_date(start, hours)));
    }

    #[test]
    fn remote_update_is_idempotent(
        original in arb_task("t1"),
        update in arb_task("t1"),
    ) {
        let mut store = EntityStore::new();
        store.load_snapshot(vec![original], vec![Assignee::new("a0", "Ada", 40.0)]);

        store.apply_remote_update(update.clone());
        let once: Vec<Task> = store.tasks().cloned().collect();
        store.apply_remote_update(update.clone());
        let twice: Vec<Task> = store.tasks().cloned().collect();

        prop_assert_eq!(&once, &twice);
        prop_assert_eq!(once, vec![update]);
        prop_assert!(store.conflicts().is_empty());
    }
}
