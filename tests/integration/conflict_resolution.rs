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

//! Conflict detection and resolution across two viewers.
//!
//! The conflict is produced deterministically: alice goes offline and moves
//! a task locally, bob moves the same task elsewhere, and alice reconnects.
//! The re-fetch after the rejoin contradicts alice's unconfirmed move and
//! opens a conflict, which is then settled either way.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use planner_hub::hub::{self, HubState};
use planner_hub::workload::{Workspace, WorkloadStore};
use planner_proto::command::ConflictChoice;
use planner_proto::task::{Assignee, AssigneeId, Task, TaskId, UserId, WorkspaceKey};
use planner_sync::cache::{CacheLayer, DEFAULT_CACHE_TTL};
use planner_sync::clock::{Clock, SystemClock};
use planner_sync::connection::ConnectionState;
use planner_sync::engine::{EngineConfig, EngineView, Notification, SyncEngine, SyncHandle};
use planner_sync::store::Conflict;
use planner_sync::transport::ws::WsConnector;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);
const ROOM: &str = "eng";

fn at(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, day)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

fn t1() -> TaskId {
    TaskId::new("t1")
}

async fn start_hub() -> (String, Arc<HubState>) {
    let workload = WorkloadStore::new();
    workload
        .seed(
            WorkspaceKey::new(ROOM),
            Workspace::new(
                vec![Task::new("t1", "Quarterly report", 4.0)],
                vec![
                    Assignee::new("a1", "Ada", 40.0),
                    Assignee::new("a2", "Grace", 32.0),
                ],
            ),
        )
        .await;
    let state = Arc::new(HubState::with_config(
        workload,
        hub::DEFAULT_CONCURRENT_EDIT_WINDOW,
    ));
    let (addr, _handle) = hub::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (format!("ws://{addr}/ws"), state)
}

struct Client {
    handle: SyncHandle,
    events: mpsc::UnboundedReceiver<Notification>,
}

impl Client {
    async fn joined(url: &str, user: &str) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = CacheLayer::in_memory(Arc::clone(&clock), DEFAULT_CACHE_TTL);
        let config = EngineConfig::new(UserId::new(user));
        let (handle, mut rx) = SyncEngine::spawn(WsConnector::new(url, 64), config, cache, clock);

        let (tx, events) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                if tx.send(notification).is_err() {
                    break;
                }
            }
        });

        let client = Self { handle, events };
        client.handle.connect().await.unwrap();
        client.wait_connection(true).await;
        client.handle.join(ROOM).await.unwrap();
        eventually(&client.handle, |view| view.store.task(&t1()).is_some()).await;
        client
    }

    async fn wait_connection(&self, connected: bool) {
        let mut state = self.handle.watch_connection();
        tokio::time::timeout(
            WAIT,
            state.wait_for(|s: &ConnectionState| s.is_connected() == connected),
        )
        .await
        .expect("timed out waiting for connection state")
        .unwrap();
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

/// Drive alice and bob into a conflict over `t1` and return it.
///
/// alice wants `t1` on Grace from the 6th; bob put it on Ada from the 9th.
async fn offline_conflict(state: &HubState, alice: &mut Client, bob: &Client) -> Conflict {
    alice.handle.disconnect().await.unwrap();
    alice.wait_connection(false).await;

    alice
        .handle
        .move_task(t1(), Some(AssigneeId::new("a2")), Some(at(6, 9)), None)
        .await
        .unwrap();

    bob.handle
        .move_task(t1(), Some(AssigneeId::new("a1")), Some(at(9, 9)), None)
        .await
        .unwrap();
    tokio::time::timeout(WAIT, async {
        loop {
            let stored = state.workload.task(&WorkspaceKey::new(ROOM), &t1()).await;
            if stored.is_some_and(|task| task.start == Some(at(9, 9))) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("hub never applied bob's move");

    alice.handle.connect().await.unwrap();
    alice
        .expect(|n| match n {
            Notification::RoomJoined { rejoined: true, .. } => Some(()),
            _ => None,
        })
        .await;

    alice
        .expect(|n| match n {
            Notification::ConflictDetected(conflict) => Some(conflict.clone()),
            _ => None,
        })
        .await
}

#[tokio::test]
async fn rejoin_fetch_opens_conflict() {
    let (url, state) = start_hub().await;
    let mut alice = Client::joined(&url, "alice").await;
    let bob = Client::joined(&url, "bob").await;

    let conflict = offline_conflict(&state, &mut alice, &bob).await;
    assert_eq!(conflict.task_id, t1());
    assert_eq!(conflict.local.assignee, Some(AssigneeId::new("a2")));
    assert_eq!(conflict.local.start, Some(at(6, 9)));
    assert_eq!(conflict.incoming.assignee, Some(AssigneeId::new("a1")));
    assert_eq!(conflict.incoming.start, Some(at(9, 9)));

    let (open, shown) = alice
        .handle
        .with_store(|store| {
            (
                store.conflicts().len(),
                store.task(&t1()).and_then(|task| task.start),
            )
        })
        .await
        .unwrap();
    assert_eq!(open, 1);
    assert_eq!(shown, Some(at(6, 9)), "local version stays visible until resolved");
}

#[tokio::test]
async fn resolve_with_server_version() {
    let (url, state) = start_hub().await;
    let mut alice = Client::joined(&url, "alice").await;
    let bob = Client::joined(&url, "bob").await;
    offline_conflict(&state, &mut alice, &bob).await;

    let kept = alice
        .handle
        .resolve_conflict(t1(), ConflictChoice::Server)
        .await
        .unwrap();
    assert_eq!(kept.start, Some(at(9, 9)));

    let choice = alice
        .expect(|n| match n {
            Notification::ConflictResolved { choice, .. } => Some(*choice),
            _ => None,
        })
        .await;
    assert_eq!(choice, ConflictChoice::Server);

    eventually(&alice.handle, |view| {
        view.store.conflicts().is_empty() && !view.store.is_dirty(&t1())
    })
    .await;

    let stored = state
        .workload
        .task(&WorkspaceKey::new(ROOM), &t1())
        .await
        .unwrap();
    assert_eq!(stored.assignee, Some(AssigneeId::new("a1")));
}

#[tokio::test]
async fn resolve_with_local_version_reaches_other_viewer() {
    let (url, state) = start_hub().await;
    let mut alice = Client::joined(&url, "alice").await;
    let bob = Client::joined(&url, "bob").await;
    offline_conflict(&state, &mut alice, &bob).await;

    let kept = alice
        .handle
        .resolve_conflict(t1(), ConflictChoice::Local)
        .await
        .unwrap();
    assert_eq!(kept.assignee, Some(AssigneeId::new("a2")));

    eventually(&bob.handle, |view| {
        view.store.task(&t1()).is_some_and(|task| {
            task.assignee == Some(AssigneeId::new("a2")) && task.start == Some(at(6, 9))
        })
    })
    .await;

    eventually(&alice.handle, |view| {
        view.store.conflicts().is_empty() && !view.store.is_dirty(&t1())
    })
    .await;

    let stored = state
        .workload
        .task(&WorkspaceKey::new(ROOM), &t1())
        .await
        .unwrap();
    assert_eq!(stored.start, Some(at(6, 9)));
}

#[tokio::test]
async fn resolving_without_conflict_fails() {
    let (url, _state) = start_hub().await;
    let alice = Client::joined(&url, "alice").await;

    let result = alice
        .handle
        .resolve_conflict(t1(), ConflictChoice::Local)
        .await;
    assert!(result.is_err());
}
