// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! End-to-end sync against an in-process hub.
//!
//! Each test starts a seeded `planner-hub` on an ephemeral port and drives
//! one or more `SyncEngine`s over real WebSockets. Covers:
//! - joining a workspace loads its tasks and assignees
//! - a move is applied optimistically, confirmed, and reaches other viewers
//! - an edit propagates
//! - a hub rejection reaches the error feed and can be reverted
//! - a warm cache serves data before the fetch completes
//! - pushed alerts are recorded

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use planner_hub::hub::{self, HubState};
use planner_hub::workload::{Workspace, WorkloadStore};
use planner_proto::command::{DateRange, TaskChange};
use planner_proto::event::{Alert, PushEvent, Severity};
use planner_proto::task::{Assignee, AssigneeId, Task, TaskId, TaskPatch, UserId, WorkspaceKey};
use planner_sync::cache::{CacheLayer, DEFAULT_CACHE_TTL, MemoryCacheBackend};
use planner_sync::clock::{Clock, SystemClock};
use planner_sync::connection::{ConnectionState, ReconnectConfig};
use planner_sync::engine::{EngineConfig, EngineView, Notification, SyncEngine, SyncHandle};
use planner_sync::error::ErrorKind;
use planner_sync::transport::ws::WsConnector;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);
const ROOM: &str = "eng";

// =============================================================================
// Helpers
// =============================================================================

fn at(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, day)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

fn seed() -> Workspace {
    let mut design = Task::new("t1", "Design review", 8.0);
    design.assignee = Some(AssigneeId::new("a1"));
    design.start = Some(at(2, 9));
    design.end = Some(at(2, 17));
    let backlog = Task::new("t2", "Write migration", 8.0);

    Workspace::new(
        vec![design, backlog],
        vec![
            Assignee::new("a1", "Ada", 40.0),
            Assignee::new("a2", "Grace", 40.0),
        ],
    )
}

async fn start_hub() -> (String, Arc<HubState>) {
    let workload = WorkloadStore::new();
    workload.seed(WorkspaceKey::new(ROOM), seed()).await;
    let state = Arc::new(HubState::with_config(
        workload,
        hub::DEFAULT_CONCURRENT_EDIT_WINDOW,
    ));
    let (addr, _handle) = hub::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (format!("ws://{addr}/ws"), state)
}

/// An engine plus an unbounded copy of its notification stream, so the
/// engine never blocks on a full channel while the test is busy.
struct Client {
    handle: SyncHandle,
    events: mpsc::UnboundedReceiver<Notification>,
}

impl Client {
    async fn connect(url: &str, user: &str, cache: CacheLayer) -> Self {
        let mut config = EngineConfig::new(UserId::new(user));
        config.connection.reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_attempts: 5,
        };
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (handle, mut rx) = SyncEngine::spawn(WsConnector::new(url, 64), config, cache, clock);

        let (tx, events) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                if tx.send(notification).is_err() {
                    break;
                }
            }
        });

        handle.connect().await.unwrap();
        let mut state = handle.watch_connection();
        tokio::time::timeout(WAIT, state.wait_for(ConnectionState::is_connected))
            .await
            .expect("timed out connecting")
            .unwrap();
        Self { handle, events }
    }

    async fn joined(url: &str, user: &str) -> Self {
        let client = Self::connect(url, user, memory_cache()).await;
        let ack = client.handle.join(ROOM).await.unwrap();
        assert_eq!(ack.room, WorkspaceKey::new(ROOM));
        eventually(&client.handle, |view| view.store.tasks().count() == 2).await;
        client
    }

    async fn expect<T>(&mut self, mut pick: impl FnMut(&Notification) -> Option<T>) -> T {
        tokio::time::timeout(WAIT, async {
            loop {
                let notification = self.events.recv().await.expect("engine stopped");
                if let Some(found) = pick(&notification) {
                    return found;
                }
            }
        })
        .await
        .expect("timed out waiting for notification")
    }
}

fn memory_cache() -> CacheLayer {
    CacheLayer::in_memory(Arc::new(SystemClock), DEFAULT_CACHE_TTL)
}

/// Poll the engine until `check` holds.
async fn eventually<F>(handle: &SyncHandle, check: F)
where
    F: Fn(&EngineView<'_>) -> bool + Clone + Send + 'static,
{
    tokio::time::timeout(WAIT, async {
        loop {
            if handle.query(check.clone()).await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn join_loads_workspace() {
    let (url, _state) = start_hub().await;
    let alice = Client::joined(&url, "alice").await;

    let (tasks, assignees, workspace) = alice
        .handle
        .query(|view| {
            (
                view.store.tasks().count(),
                view.store.assignees().count(),
                view.workspace.cloned(),
            )
        })
        .await
        .unwrap();
    assert_eq!(tasks, 2);
    assert_eq!(assignees, 2);
    assert_eq!(workspace, Some(WorkspaceKey::new(ROOM)));

    let stats = alice
        .handle
        .query(|view| view.store.workload_stats(view.now()))
        .await
        .unwrap();
    assert_eq!(stats.scheduled_tasks, 1);
    assert_eq!(stats.unscheduled_tasks, 1);
}

#[tokio::test]
async fn move_is_confirmed_and_reaches_other_viewers() {
    let (url, _state) = start_hub().await;
    let mut alice = Client::joined(&url, "alice").await;
    let bob = Client::joined(&url, "bob").await;

    let token = alice
        .handle
        .move_task("t2", Some(AssigneeId::new("a2")), Some(at(3, 9)), None)
        .await
        .unwrap();

    let dirty = alice
        .handle
        .with_store(|store| store.is_dirty(&TaskId::new("t2")))
        .await
        .unwrap();
    assert!(dirty, "move should be applied before the hub answers");

    let confirmed = alice
        .expect(|n| match n {
            Notification::MutationConfirmed { token, .. } => Some(*token),
            _ => None,
        })
        .await;
    assert_eq!(confirmed, token);

    eventually(&bob.handle, |view| {
        view.store.task(&TaskId::new("t2")).is_some_and(|task| {
            task.assignee == Some(AssigneeId::new("a2"))
                && task.start == Some(at(3, 9))
                && task.end == Some(at(3, 17))
        })
    })
    .await;

    let dirty = alice
        .handle
        .with_store(|store| store.is_dirty(&TaskId::new("t2")))
        .await
        .unwrap();
    assert!(!dirty);
}

#[tokio::test]
async fn edit_propagates() {
    let (url, state) = start_hub().await;
    let alice = Client::joined(&url, "alice").await;
    let bob = Client::joined(&url, "bob").await;

    let patch = TaskPatch {
        title: Some("Design review (v2)".to_string()),
        progress: Some(50),
        ..TaskPatch::default()
    };
    alice.handle.edit_task("t1", patch).await.unwrap();

    eventually(&bob.handle, |view| {
        view.store
            .task(&TaskId::new("t1"))
            .is_some_and(|task| task.title == "Design review (v2)" && task.progress == 50)
    })
    .await;

    let stored = state
        .workload
        .task(&WorkspaceKey::new(ROOM), &TaskId::new("t1"))
        .await
        .unwrap();
    assert_eq!(stored.progress, 50);
}

#[tokio::test]
async fn local_validation_never_reaches_the_hub() {
    let (url, state) = start_hub().await;
    let alice = Client::joined(&url, "alice").await;

    let result = alice
        .handle
        .move_task("t1", Some(AssigneeId::new("a1")), Some(at(4, 9)), Some(at(3, 9)))
        .await;
    assert!(result.is_err());

    let stored = state
        .workload
        .task(&WorkspaceKey::new(ROOM), &TaskId::new("t1"))
        .await
        .unwrap();
    assert_eq!(stored.start, Some(at(2, 9)));
}

#[tokio::test]
async fn hub_rejection_reaches_error_feed_and_can_be_reverted() {
    let (url, state) = start_hub().await;
    let mut alice = Client::joined(&url, "alice").await;
    assert!(
        state
            .workload
            .remove(&WorkspaceKey::new(ROOM), &TaskId::new("t1"))
            .await
    );

    alice
        .handle
        .move_task("t1", Some(AssigneeId::new("a2")), Some(at(5, 9)), None)
        .await
        .unwrap();

    let error = alice
        .expect(|n| match n {
            Notification::Error(e) => Some(e.clone()),
            _ => None,
        })
        .await;
    assert_eq!(error.kind, ErrorKind::NotFound);

    let reverted = alice.handle.revert_task("t1").await.unwrap();
    assert_eq!(reverted.assignee, Some(AssigneeId::new("a1")));
    assert_eq!(reverted.start, Some(at(2, 9)));
}

#[tokio::test]
async fn warm_cache_serves_data_before_fetch() {
    let (url, _state) = start_hub().await;
    let backend = MemoryCacheBackend::default();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let first = Client::connect(
        &url,
        "alice",
        CacheLayer::new(backend.clone(), Arc::clone(&clock), DEFAULT_CACHE_TTL),
    )
    .await;
    first.handle.join(ROOM).await.unwrap();
    eventually(&first.handle, |view| view.store.tasks().count() == 2).await;
    first.handle.shutdown().await;
    assert_eq!(backend.len(), 1);

    let second = Client::connect(
        &url,
        "alice",
        CacheLayer::new(backend.clone(), clock, DEFAULT_CACHE_TTL),
    )
    .await;
    second.handle.join(ROOM).await.unwrap();
    let tasks = second
        .handle
        .with_store(|store| store.tasks().count())
        .await
        .unwrap();
    assert_eq!(tasks, 2, "cached snapshot should be loaded on join");
}

#[tokio::test]
async fn pushed_alert_is_recorded() {
    let (url, state) = start_hub().await;
    let mut alice = Client::joined(&url, "alice").await;

    let alert = Alert {
        alert_id: "al-1".to_string(),
        alert_type: "overallocation".to_string(),
        severity: Severity::High,
        message: "Ada is at 130%".to_string(),
        affected: vec![AssigneeId::new("a1")],
    };
    state
        .publish(&WorkspaceKey::new(ROOM), PushEvent::WorkloadAlert(alert.clone()))
        .await;

    let received = alice
        .expect(|n| match n {
            Notification::Alert(a) => Some(a.clone()),
            _ => None,
        })
        .await;
    assert_eq!(received, alert);

    let logged = alice
        .handle
        .query(|view| view.alerts.front().cloned())
        .await
        .unwrap();
    assert_eq!(logged, Some(alert));
}

#[tokio::test]
async fn ranged_fetch_merges_without_dropping_other_tasks() {
    let (url, state) = start_hub().await;
    let alice = Client::joined(&url, "alice").await;

    // Stored without a broadcast, so only a fetch can reveal it.
    let mut late = Task::new("t3", "Retrospective", 2.0);
    late.start = Some(at(20, 9));
    late.end = Some(at(20, 11));
    state.workload.upsert(&WorkspaceKey::new(ROOM), late).await;

    alice
        .handle
        .fetch_workload(Some(DateRange {
            start: at(15, 0),
            end: at(31, 0),
        }))
        .await
        .unwrap();

    eventually(&alice.handle, |view| {
        view.store.task(&TaskId::new("t3")).is_some()
    })
    .await;
    let kept = alice
        .handle
        .with_store(|store| {
            (
                store.task(&TaskId::new("t1")).is_some(),
                store.tasks().count(),
            )
        })
        .await
        .unwrap();
    assert_eq!(kept, (true, 3), "t1 lies outside the window and must stay");
}

#[tokio::test]
async fn batch_is_confirmed_per_task_and_reaches_other_viewers() {
    let (url, _state) = start_hub().await;
    let mut alice = Client::joined(&url, "alice").await;
    let bob = Client::joined(&url, "bob").await;

    let tokens = alice
        .handle
        .submit_batch(vec![
            TaskChange::Move {
                task_id: TaskId::new("t2"),
                assignee: Some(AssigneeId::new("a2")),
                start: Some(at(4, 9)),
                end: None,
            },
            TaskChange::Edit {
                task_id: TaskId::new("t1"),
                patch: TaskPatch {
                    progress: Some(75),
                    ..TaskPatch::default()
                },
            },
        ])
        .await
        .unwrap();

    let mut confirmed = Vec::new();
    while confirmed.len() < tokens.len() {
        let token = alice
            .expect(|n| match n {
                Notification::MutationConfirmed { token, .. } => Some(*token),
                _ => None,
            })
            .await;
        confirmed.push(token);
    }
    confirmed.sort();
    let mut expected = tokens.clone();
    expected.sort();
    assert_eq!(confirmed, expected);

    eventually(&bob.handle, |view| {
        let moved = view.store.task(&TaskId::new("t2")).is_some_and(|task| {
            task.assignee == Some(AssigneeId::new("a2")) && task.end == Some(at(4, 17))
        });
        let edited = view
            .store
            .task(&TaskId::new("t1"))
            .is_some_and(|task| task.progress == 75);
        moved && edited
    })
    .await;
}

#[tokio::test]
async fn capacity_change_updates_utilization() {
    let (url, state) = start_hub().await;
    let alice = Client::joined(&url, "alice").await;

    state
        .set_capacity(&WorkspaceKey::new(ROOM), &AssigneeId::new("a1"), 16.0)
        .await
        .unwrap();

    eventually(&alice.handle, |view| {
        view.store.utilization(&AssigneeId::new("a1")) == Some(50)
    })
    .await;
}

#[tokio::test]
async fn dismissed_alert_leaves_the_log() {
    let (url, state) = start_hub().await;
    let mut alice = Client::joined(&url, "alice").await;

    let alert = Alert {
        alert_id: "al-2".to_string(),
        alert_type: "underutilization".to_string(),
        severity: Severity::Low,
        message: "Grace has nothing scheduled".to_string(),
        affected: vec![AssigneeId::new("a2")],
    };
    state
        .publish(&WorkspaceKey::new(ROOM), PushEvent::WorkloadAlert(alert))
        .await;
    alice
        .expect(|n| matches!(n, Notification::Alert(_)).then_some(()))
        .await;

    assert!(alice.handle.dismiss_alert("al-2").await.unwrap());
    let logged = alice
        .handle
        .query(|view| view.alerts.len())
        .await
        .unwrap();
    assert_eq!(logged, 0);
}
