//! `planner-sync` -- client-side realtime sync engine for a workload
//! planner.
//!
//! Keeps a local copy of a workspace's tasks and assignees consistent with
//! a hub over a push channel: optimistic moves and edits, conflict
//! detection, room presence, snapshot caching and reconnect with backoff.
//! [`engine::SyncEngine`] ties the parts together; [`scheduling`] holds the
//! pure capacity and conflict checks.

pub mod cache;
pub mod clock;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod room;
pub mod scheduling;
pub mod store;
pub mod transport;
