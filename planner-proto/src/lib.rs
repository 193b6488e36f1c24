//! Shared wire definitions for the planner push channel.
//!
//! Used by the client engine (`planner-sync`) and the reference hub
//! (`planner-hub`) so both ends agree on entity shapes and frame layout.

pub mod codec;
pub mod command;
pub mod event;
pub mod task;
