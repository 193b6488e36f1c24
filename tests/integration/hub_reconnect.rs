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

//! Reconnect behavior against a real hub.
//!
//! `HubState::close_all_connections` sends a Close frame to every session,
//! which the client sees as a lost session. Validates that:
//! - the engine reconnects with backoff and rejoins its room
//! - the rejoin re-fetches, picking up changes made while away
//! - an exhausted budget surfaces a network error and a terminal state

use std::sync::Arc;
use std::time::Duration;

use planner_hub::hub::{self, HubState};
use planner_hub::workload::{Workspace, WorkloadStore};
use planner_proto::task::{Assignee, Task, TaskId, UserId, WorkspaceKey};
use planner_sync::cache::{CacheLayer, DEFAULT_CACHE_TTL};
use planner_sync::clock::{Clock, SystemClock};
use planner_sync::connection::{ConnectionState, ReconnectConfig};
use planner_sync::engine::{EngineConfig, Notification, SyncEngine, SyncHandle};
use planner_sync::error::ErrorKind;
use planner_sync::transport::ws::WsConnector;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(10);
const ROOM: &str = "eng";

async fn start_hub() -> (String, Arc<HubState>) {
    let workload = WorkloadStore::new();
    workload
        .seed(
            WorkspaceKey::new(ROOM),
            Workspace::new(
                vec![Task::new("t1", "Release notes", 3.0)],
                vec![Assignee::new("a1", "Ada", 40.0)],
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

/// Reconnect quickly so tests do not wait on production delays.
fn fast_config(user: &str, max_attempts: u32) -> EngineConfig {
    let mut config = EngineConfig::new(UserId::new(user));
    config.connection.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        max_attempts,
    };
    config.connection.handshake_timeout = Duration::from_secs(2);
    config
}

fn spawn(url: &str, config: EngineConfig) -> (SyncHandle, mpsc::UnboundedReceiver<Notification>) {
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
    (handle, events)
}

async fn expect<T>(
    events: &mut mpsc::UnboundedReceiver<Notification>,
    mut pick: impl FnMut(&Notification) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let notification = events.recv().await.expect("engine stopped");
            if let Some(found) = pick(&notification) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for notification")
}

async fn wait_connected(handle: &SyncHandle) {
    let mut state = handle.watch_connection();
    tokio::time::timeout(WAIT, state.wait_for(ConnectionState::is_connected))
        .await
        .expect("timed out connecting")
        .unwrap();
}

#[tokio::test]
async fn rejoins_room_after_hub_closes_connection() {
    let (url, state) = start_hub().await;
    let (alice, mut events) = spawn(&url, fast_config("alice", 5));
    alice.connect().await.unwrap();
    wait_connected(&alice).await;
    let ack = alice.join(ROOM).await.unwrap();
    assert!(!ack.rejoined);

    state.close_all_connections().await;

    expect(&mut events, |n| match n {
        Notification::Reconnecting { .. } => Some(()),
        _ => None,
    })
    .await;

    let rejoined = expect(&mut events, |n| match n {
        Notification::RoomJoined { room, rejoined } => Some((room.clone(), *rejoined)),
        _ => None,
    })
    .await;
    assert_eq!(rejoined, (WorkspaceKey::new(ROOM), true));
    assert!(alice.connection_state().is_connected());
    assert_eq!(
        state.rooms.active_users(&WorkspaceKey::new(ROOM)).await,
        vec![UserId::new("alice")]
    );
}

#[tokio::test]
async fn rejoin_fetches_changes_made_while_away() {
    let (url, state) = start_hub().await;
    let (alice, mut events) = spawn(&url, fast_config("alice", 5));
    alice.connect().await.unwrap();
    wait_connected(&alice).await;
    alice.join(ROOM).await.unwrap();

    // Stored without a broadcast, so only a fetch can reveal it.
    state
        .workload
        .upsert(&WorkspaceKey::new(ROOM), Task::new("t9", "Hotfix", 1.0))
        .await;
    state.close_all_connections().await;

    expect(&mut events, |n| match n {
        Notification::RoomJoined { rejoined: true, .. } => Some(()),
        _ => None,
    })
    .await;

    tokio::time::timeout(WAIT, async {
        loop {
            let found = alice
                .with_store(|store| store.task(&TaskId::new("t9")).is_some())
                .await
                .unwrap();
            if found {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("re-fetch never delivered the new task");
}

#[tokio::test]
async fn exhausted_budget_reports_network_error() {
    // Reserve a port, then free it so nothing is listening there.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (handle, mut events) = spawn(&format!("ws://{addr}/ws"), fast_config("alice", 2));
    handle.connect().await.unwrap();

    let error = expect(&mut events, |n| match n {
        Notification::Error(e) if e.message == "Unable to reconnect to server" => Some(e.clone()),
        _ => None,
    })
    .await;
    assert_eq!(error.kind, ErrorKind::Network);

    let mut state = handle.watch_connection();
    let terminal = tokio::time::timeout(WAIT, state.wait_for(|s| s.terminal))
        .await
        .expect("connection never became terminal")
        .unwrap()
        .clone();
    assert!(!terminal.is_connected());
    assert!(!terminal.reconnecting);
}

#[tokio::test]
async fn join_while_disconnected_fails_fast() {
    let (url, _state) = start_hub().await;
    let (handle, _events) = spawn(&url, fast_config("alice", 5));

    let result = handle.join(ROOM).await;
    assert!(result.is_err());
}
