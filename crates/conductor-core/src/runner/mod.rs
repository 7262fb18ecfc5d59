//! Scheduling: dependency analysis, handler dispatch, result commit.

pub mod dependency;
pub mod handler;
pub mod registry;
pub mod task_runner;

pub use dependency::DependencyGraph;
pub use handler::{FnHandler, Handler, TaskContext, handler_fn};
pub use registry::HandlerRegistry;
pub use task_runner::{TaskRunner, Tick};
