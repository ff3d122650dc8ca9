// src/core/state/mod.rs

//! Defines the central `ServerState` struct and all related state components.
//! This module is broken down into logical parts for better organization.

mod core;
mod replication;

pub use core::{ServerState, SnapshotJob};
pub use replication::*;
