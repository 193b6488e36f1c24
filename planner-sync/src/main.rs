//! `planner-sync` -- headless sync client.
//!
//! Connects to a hub, joins a workspace and prints what the engine
//! reports until interrupted. Configuration via CLI flags, environment
//! variables, or config file (`~/.config/planner-sync/config.toml`).
//!
//! ```bash
//! cargo run --bin planner-sync -- --hub-url ws://127.0.0.1:9100/ws \
//!     --user-id alice --workspace engineering
//!
//! # Or via environment variables
//! PLANNER_HUB_URL=ws://127.0.0.1:9100/ws PLANNER_USER=alice \
//!     PLANNER_WORKSPACE=engineering cargo run --bin planner-sync
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use planner_sync::clock::{Clock, SystemClock};
use planner_sync::config::{CliArgs, SyncConfig};
use planner_sync::engine::{Notification, SyncEngine, SyncHandle};
use planner_sync::transport::ws::WsConnector;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match SyncConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            SyncConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let hub_url = match config.hub_url() {
        Ok(Some(url)) => url,
        Ok(None) => {
            eprintln!("No hub URL configured (use --hub-url or PLANNER_HUB_URL)");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let Some(engine_config) = config.to_engine_config() else {
        eprintln!("No user id configured (use --user-id or PLANNER_USER)");
        return ExitCode::FAILURE;
    };

    tracing::info!(hub = %hub_url, "planner-sync starting");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = config.build_cache(Arc::clone(&clock));
    let connector = WsConnector::new(hub_url.as_str(), config.channel_capacity);
    let (handle, notifications) = SyncEngine::spawn(connector, engine_config, cache, clock);

    if let Err(e) = handle.connect().await {
        eprintln!("Engine stopped before connecting: {e}");
        return ExitCode::FAILURE;
    }

    run(&handle, notifications, config.workspace.as_deref()).await;

    handle.shutdown().await;
    tracing::info!("planner-sync exiting");
    ExitCode::SUCCESS
}

/// Initialize file-based logging.
///
/// Logs go to a file so they don't interleave with the notification
/// output. Returns a [`WorkerGuard`] that must be held until shutdown to
/// ensure all buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("planner-sync.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Print notifications until ctrl-c or the engine stops.
///
/// The workspace is joined on every transition to connected that finds
/// no room active; the engine rejoins on its own after a reconnect.
async fn run(
    handle: &SyncHandle,
    mut notifications: mpsc::Receiver<Notification>,
    workspace: Option<&str>,
) {
    let mut joined = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("interrupted");
                return;
            }
            notification = notifications.recv() => {
                let Some(notification) = notification else {
                    return;
                };
                if let Notification::ConnectionChanged(state) = &notification
                    && state.is_connected()
                    && !joined
                    && let Some(key) = workspace
                {
                    match handle.join(key).await {
                        Ok(ack) => {
                            joined = true;
                            tracing::info!(room = %ack.room, "joined");
                        }
                        Err(e) => println!("join failed: {e}"),
                    }
                }
                print_notification(handle, &notification).await;
            }
        }
    }
}

async fn print_notification(handle: &SyncHandle, notification: &Notification) {
    match notification {
        Notification::ConnectionChanged(state) => {
            println!("connection: {:?}", state.status);
        }
        Notification::Reconnecting { attempt } => {
            println!("reconnecting (attempt {attempt})");
        }
        Notification::RoomJoined { room, rejoined } => {
            let verb = if *rejoined { "rejoined" } else { "joined" };
            println!("{verb} {room}");
        }
        Notification::RoomLeft { room } => println!("left {room}"),
        Notification::PresenceChanged { active_users } => {
            let names: Vec<String> = active_users.iter().map(ToString::to_string).collect();
            println!("viewing: {}", names.join(", "));
        }
        Notification::PeerActivity(record) => {
            println!("{} is {}", record.user, record.activity_type);
        }
        Notification::ActivityExpired(_) => {}
        Notification::StoreChanged => {
            let summary = handle
                .query(|view| (view.store.tasks().count(), view.store.workload_stats(view.now())))
                .await;
            if let Ok((count, stats)) = summary {
                println!(
                    "{count} tasks, {} scheduled, {} overdue, {}% utilized",
                    stats.scheduled_tasks, stats.overdue_tasks, stats.overall_utilization
                );
            }
        }
        Notification::MutationConfirmed { task_id, .. } => println!("confirmed {task_id}"),
        Notification::ConflictDetected(conflict) => {
            println!("conflict on {}", conflict.task_id);
        }
        Notification::ConcurrentEdit { task_id, users } => {
            println!("{} users editing {task_id}", users.len());
        }
        Notification::ConflictResolved { task_id, choice } => {
            println!("resolved {task_id} ({choice:?})");
        }
        Notification::Alert(alert) => {
            println!("[{:?}] {}", alert.severity, alert.message);
        }
        Notification::Recommendation(rec) => println!("suggestion: {}", rec.message),
        Notification::Error(err) => println!("error: {err}"),
    }
}
