//! conductor-core
//!
//! Persistent task/change orchestration for a snap management daemon.
//!
//! # Modules
//! - **domain**: tasks, changes, statuses, task sets
//! - **state**: the lock-guarded store, checkpointing, pruning
//! - **runner**: handler registry, dependency graph, scheduling passes
//! - **app**: managers, the overlord (settle and background loop)
//! - **hookstate**: `run-hook` tasks and per-hook handlers
//! - **configstate**: `configure` and the configuration manager
//! - **snapstate**: installed-snap bookkeeping and gadget defaults
//! - **config**: runtime settings

pub mod app;
pub mod config;
pub mod configstate;
pub mod domain;
pub mod error;
pub mod hookstate;
pub mod runner;
pub mod snapstate;
pub mod state;

pub use app::{Manager, Overlord, OverlordBuilder};
pub use config::OverlordConfig;
pub use domain::{ChangeError, ChangeId, Status, TaskId, TaskKind, TaskSet};
pub use error::{Error, Result};
pub use state::{State, StateGuard};
