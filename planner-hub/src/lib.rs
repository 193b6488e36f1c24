//! `planner-hub` -- reference backend for the planner sync engine.
//!
//! Exposes the hub server for use in tests and embedding. The hub accepts
//! WebSocket sessions, tracks room membership and presence, applies moves
//! and edits to in-memory workload data, and broadcasts the results to
//! every viewer of the workspace.

pub mod config;
pub mod hub;
pub mod rooms;
pub mod workload;
