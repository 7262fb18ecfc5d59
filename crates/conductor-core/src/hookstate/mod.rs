//! Hook manager: runs snap-supplied hooks as `run-hook` tasks.
//!
//! Design:
//! - The `run-hook` task carries a [`HookSetup`] under `hook-setup`.
//! - Other managers register a [`HandlerGenerator`] per hook name; the
//!   generated [`HookHandler`] sees the hook before it runs and after it
//!   finishes or fails.
//! - Executing the hook is delegated to a [`HookRunner`]. Hooks of the same
//!   snap never run concurrently.

mod runner;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use runner::{HookRunner, ScriptHookRunner};

use crate::app::Manager;
use crate::domain::{TaskId, TaskKind};
use crate::error::{Error, Result};
use crate::runner::{Handler, TaskContext};
use crate::snapstate::Revision;
use crate::state::{State, StateGuard};

pub const RUN_HOOK: &str = "run-hook";
pub const HOOK_SETUP_KEY: &str = "hook-setup";

/// Which hook of which snap revision to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSetup {
    pub snap: String,
    pub revision: Revision,
    pub hook: String,
    /// A missing optional hook is not an error.
    #[serde(default)]
    pub optional: bool,
}

/// Create a `run-hook` task for `setup`, not yet attached to a change.
pub fn hook_task(guard: &mut StateGuard<'_>, summary: &str, setup: &HookSetup) -> Result<TaskId> {
    let id = guard.new_task(RUN_HOOK, summary);
    if let Some(task) = guard.task_mut(id) {
        task.set(HOOK_SETUP_KEY, setup)?;
    }
    Ok(id)
}

/// What a hook handler gets to see.
#[derive(Clone)]
pub struct HookContext {
    task: TaskContext,
    setup: HookSetup,
}

impl HookContext {
    pub fn setup(&self) -> &HookSetup {
        &self.setup
    }

    pub fn task(&self) -> &TaskContext {
        &self.task
    }

    pub fn state(&self) -> &State {
        self.task.state()
    }
}

/// Per-invocation hooks around a hook run.
pub trait HookHandler: Send + Sync {
    fn before(&self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }

    fn done(&self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }

    /// The hook failed with `err`; the task fails with it afterwards.
    fn error(&self, _ctx: &HookContext, _err: &Error) -> Result<()> {
        Ok(())
    }
}

/// Builds a fresh handler for each run of a hook.
pub type HandlerGenerator = Arc<dyn Fn(&HookContext) -> Box<dyn HookHandler> + Send + Sync>;

struct Inner {
    runner: Arc<dyn HookRunner>,
    generators: RwLock<HashMap<String, HandlerGenerator>>,
    snap_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Inner {
    fn generator(&self, hook: &str) -> Option<HandlerGenerator> {
        self.generators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(hook)
            .cloned()
    }

    fn snap_lock(&self, snap: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.snap_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(snap.to_string()).or_default())
    }
}

pub struct HookManager {
    inner: Arc<Inner>,
}

impl HookManager {
    pub fn new(runner: Arc<dyn HookRunner>) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                generators: RwLock::new(HashMap::new()),
                snap_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Handle every run of `hook` with handlers from `generator`.
    ///
    /// Registering the same hook again replaces the generator.
    pub fn register(&self, hook: &str, generator: HandlerGenerator) {
        debug!(hook, "hook handler registered");
        self.inner
            .generators
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(hook.to_string(), generator);
    }
}

#[async_trait]
impl Manager for HookManager {
    fn name(&self) -> &str {
        "hookmgr"
    }

    fn handlers(&self) -> Vec<(TaskKind, Arc<dyn Handler>)> {
        vec![(
            TaskKind::new(RUN_HOOK),
            Arc::new(RunHook {
                inner: Arc::clone(&self.inner),
            }),
        )]
    }
}

struct RunHook {
    inner: Arc<Inner>,
}

#[async_trait]
impl Handler for RunHook {
    async fn run(&self, ctx: TaskContext) -> Result<()> {
        let setup: HookSetup = ctx.get(HOOK_SETUP_KEY)?;
        let generator = self.inner.generator(&setup.hook).ok_or_else(|| {
            Error::Other(format!(
                "no handler registered for hook {:?} of snap {:?}",
                setup.hook, setup.snap
            ))
        })?;
        let hook_ctx = HookContext {
            task: ctx.clone(),
            setup: setup.clone(),
        };
        let handler = generator(&hook_ctx);

        let lock = self.inner.snap_lock(&setup.snap);
        let _serialized = lock.lock().await;

        handler.before(&hook_ctx)?;

        let outcome = match self.inner.runner.run_hook(&setup).await {
            Ok(Some(output)) => {
                if !output.trim().is_empty() {
                    ctx.logf(output.trim().to_string());
                }
                Ok(())
            }
            Ok(None) if setup.optional => {
                debug!(snap = %setup.snap, hook = %setup.hook, "optional hook not present");
                Ok(())
            }
            Ok(None) => Err(Error::Other(format!(
                "snap {:?} has no {:?} hook",
                setup.snap, setup.hook
            ))),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                handler.done(&hook_ctx)?;
                info!(snap = %setup.snap, hook = %setup.hook, "hook completed");
                Ok(())
            }
            Err(e) => {
                handler.error(&hook_ctx, &e)?;
                Err(e)
            }
        }
    }
}
