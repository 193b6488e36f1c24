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

//! Presence and activity between viewers of one workspace.
//!
//! Validates that:
//! - viewers see each other join and leave
//! - activity broadcasts are relayed to peers and expire after the TTL
//! - a peer's session ending announces its departure

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use planner_hub::hub::{self, HubState};
use planner_hub::workload::{Workspace, WorkloadStore};
use planner_proto::task::{Assignee, Task, UserId, WorkspaceKey};
use planner_sync::cache::{CacheLayer, DEFAULT_CACHE_TTL};
use planner_sync::clock::{Clock, SystemClock};
use planner_sync::connection::ConnectionState;
use planner_sync::engine::{EngineConfig, Notification, SyncEngine, SyncHandle};
use planner_sync::room::ActivityRecord;
use planner_sync::transport::ws::WsConnector;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);
const ROOM: &str = "eng";

async fn start_hub() -> String {
    let workload = WorkloadStore::new();
    workload
        .seed(
            WorkspaceKey::new(ROOM),
            Workspace::new(
                vec![Task::new("t1", "Sprint planning", 2.0)],
                vec![Assignee::new("a1", "Ada", 40.0)],
            ),
        )
        .await;
    let state = Arc::new(HubState::with_config(
        workload,
        hub::DEFAULT_CONCURRENT_EDIT_WINDOW,
    ));
    let (addr, _handle) = hub::start_server_with_state("127.0.0.1:0", state)
        .await
        .unwrap();
    format!("ws://{addr}/ws")
}

struct Client {
    handle: SyncHandle,
    events: mpsc::UnboundedReceiver<Notification>,
}

impl Client {
    async fn join(url: &str, config: EngineConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = CacheLayer::in_memory(Arc::clone(&clock), DEFAULT_CACHE_TTL);
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
        handle.join(ROOM).await.unwrap();
        Self { handle, events }
    }

    async fn viewer(url: &str, user: &str) -> Self {
        Self::join(url, EngineConfig::new(UserId::new(user))).await
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

    /// Wait for a presence update equal to `users`.
    async fn expect_presence(&mut self, users: &[&str]) {
        let want: Vec<UserId> = users.iter().map(|u| UserId::new(*u)).collect();
        self.expect(|n| match n {
            Notification::PresenceChanged { active_users } if *active_users == want => Some(()),
            _ => None,
        })
        .await;
    }

    async fn expect_activity(&mut self) -> ActivityRecord {
        self.expect(|n| match n {
            Notification::PeerActivity(record) => Some(record.clone()),
            _ => None,
        })
        .await
    }
}

fn editing(task: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("task_id".to_string(), task.to_string())])
}

#[tokio::test]
async fn viewers_see_each_other() {
    let url = start_hub().await;
    let mut alice = Client::viewer(&url, "alice").await;
    alice.expect_presence(&["alice"]).await;

    let mut bob = Client::viewer(&url, "bob").await;
    bob.expect_presence(&["alice", "bob"]).await;
    alice.expect_presence(&["alice", "bob"]).await;

    let users = alice
        .handle
        .query(|view| view.room.active_users().iter().cloned().collect::<Vec<_>>())
        .await
        .unwrap();
    assert_eq!(users, vec![UserId::new("alice"), UserId::new("bob")]);
}

#[tokio::test]
async fn activity_is_relayed_to_peers() {
    let url = start_hub().await;
    let mut alice = Client::viewer(&url, "alice").await;
    let bob = Client::viewer(&url, "bob").await;
    alice.expect_presence(&["alice", "bob"]).await;

    bob.handle
        .broadcast_activity("editing", editing("t1"))
        .await
        .unwrap();

    let record = alice.expect_activity().await;
    assert_eq!(record.user, UserId::new("bob"));
    assert_eq!(record.activity_type, "editing");
    assert_eq!(record.payload.get("task_id").map(String::as_str), Some("t1"));

    let visible = alice
        .handle
        .query(|view| {
            view.room
                .activity_of(&UserId::new("bob"), view.now_ms)
                .map(|r| r.activity_type.clone())
        })
        .await
        .unwrap();
    assert_eq!(visible.as_deref(), Some("editing"));
}

#[tokio::test]
async fn activity_expires_after_ttl() {
    let url = start_hub().await;
    let mut config = EngineConfig::new(UserId::new("alice"));
    config.activity_ttl = Duration::from_millis(200);
    config.sweep_interval = Duration::from_millis(50);
    let mut alice = Client::join(&url, config).await;
    let bob = Client::viewer(&url, "bob").await;
    alice.expect_presence(&["alice", "bob"]).await;

    bob.handle
        .broadcast_activity("viewing", BTreeMap::new())
        .await
        .unwrap();
    alice.expect_activity().await;

    let expired = alice
        .expect(|n| match n {
            Notification::ActivityExpired(users) => Some(users.clone()),
            _ => None,
        })
        .await;
    assert_eq!(expired, vec![UserId::new("bob")]);

    let remaining = alice
        .handle
        .query(|view| view.room.activities(view.now_ms).len())
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn leave_announces_departure() {
    let url = start_hub().await;
    let mut alice = Client::viewer(&url, "alice").await;
    let bob = Client::viewer(&url, "bob").await;
    alice.expect_presence(&["alice", "bob"]).await;

    bob.handle.leave(ROOM).await.unwrap();
    alice.expect_presence(&["alice"]).await;
}

#[tokio::test]
async fn shutdown_announces_departure() {
    let url = start_hub().await;
    let mut alice = Client::viewer(&url, "alice").await;
    let bob = Client::viewer(&url, "bob").await;
    alice.expect_presence(&["alice", "bob"]).await;

    bob.handle.shutdown().await;
    alice.expect_presence(&["alice"]).await;
}
