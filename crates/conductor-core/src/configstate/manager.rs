//! ConfigManager - configure-snapd と configure フックの Handler
//!
//! # 設計
//! - パッチは Transaction に積み、成功したときだけ commit する
//! - システム snap の設定は CoreConfig に委ね、spawn_blocking で実行する

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::transaction::Transaction;
use super::{CONFIGURE_HOOK, CONFIGURE_SNAPD, PATCH_KEY, Patch, USE_DEFAULTS_KEY};
use crate::app::Manager;
use crate::domain::TaskKind;
use crate::error::{Error, Result};
use crate::hookstate::{HookContext, HookHandler, HookManager};
use crate::runner::{Handler, TaskContext};
use crate::snapstate::SYSTEM_SNAP;
use crate::snapstate::gadget::DefaultsSource;
use crate::state::State;

/// Applies configuration of the system snap.
///
/// Runs on a blocking thread; it may validate values and touch the system.
pub trait CoreConfig: Send + Sync {
    fn run(&self, tx: &Transaction) -> Result<()>;
}

impl<F> CoreConfig for F
where
    F: Fn(&Transaction) -> Result<()> + Send + Sync,
{
    fn run(&self, tx: &Transaction) -> Result<()> {
        self(tx)
    }
}

/// Owns `configure-snapd` and the handlers of the `configure` hook.
pub struct ConfigManager {
    core: Arc<dyn CoreConfig>,
    snap_mount_dir: PathBuf,
}

impl ConfigManager {
    pub fn new(
        hookmgr: &HookManager,
        core: Arc<dyn CoreConfig>,
        snap_mount_dir: impl Into<PathBuf>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            core,
            snap_mount_dir: snap_mount_dir.into(),
        });
        let root = manager.snap_mount_dir.clone();
        hookmgr.register(
            CONFIGURE_HOOK,
            Arc::new(move |_ctx: &HookContext| -> Box<dyn HookHandler> {
                Box::new(ConfigureHook {
                    root: root.clone(),
                    tx: Mutex::new(None),
                })
            }),
        );
        manager
    }
}

#[async_trait]
impl Manager for ConfigManager {
    fn name(&self) -> &str {
        "configmgr"
    }

    fn handlers(&self) -> Vec<(TaskKind, Arc<dyn Handler>)> {
        vec![(
            TaskKind::new(CONFIGURE_SNAPD),
            Arc::new(ConfigureSnapd {
                core: Arc::clone(&self.core),
                root: self.snap_mount_dir.clone(),
            }),
        )]
    }
}

/// What a configure task asks for, read under the lock.
struct Request {
    tx: Transaction,
    patch: Patch,
    defaults: Option<DefaultsSource>,
}

impl Request {
    fn read(state: &State, task: &TaskContext, root: &Path, snap: &str) -> Result<Self> {
        let guard = state.lock();
        let entry = guard
            .task(task.id())
            .ok_or(Error::UnknownTask(task.id()))?;
        let patch = match entry.get::<Patch>(PATCH_KEY) {
            Ok(patch) => patch,
            Err(Error::NoState(_)) => Patch::new(),
            Err(e) => return Err(e),
        };
        let use_defaults = entry.has(USE_DEFAULTS_KEY) && entry.get::<bool>(USE_DEFAULTS_KEY)?;
        let defaults = if use_defaults {
            DefaultsSource::locate(&guard, root, snap)?
        } else {
            None
        };
        Ok(Self {
            tx: Transaction::new(&guard)?,
            patch,
            defaults,
        })
    }

    /// Defaults first, then the patch on top. Reads the gadget metadata.
    fn apply(mut self, snap: &str) -> Result<Transaction> {
        if let Some(source) = &self.defaults {
            let defaults = source.read()?;
            debug!(snap, count = defaults.len(), "applying gadget defaults");
            for (key, value) in defaults {
                self.tx.set(snap, &key, value)?;
            }
        }
        for (key, value) in self.patch {
            self.tx.set(snap, &key, value)?;
        }
        Ok(self.tx)
    }
}

struct ConfigureSnapd {
    core: Arc<dyn CoreConfig>,
    root: PathBuf,
}

#[async_trait]
impl Handler for ConfigureSnapd {
    async fn run(&self, ctx: TaskContext) -> Result<()> {
        let request = Request::read(ctx.state(), &ctx, &self.root, SYSTEM_SNAP)?;

        let core = Arc::clone(&self.core);
        let tx = tokio::task::spawn_blocking(move || -> Result<Transaction> {
            let tx = request.apply(SYSTEM_SNAP)?;
            core.run(&tx)?;
            Ok(tx)
        })
        .await
        .map_err(|e| Error::Other(format!("configuration backend panicked: {e}")))??;

        let changed = tx.changes(SYSTEM_SNAP).len();
        tx.commit(&mut ctx.state().lock())?;
        info!(snap = SYSTEM_SNAP, changed, "configuration applied");
        Ok(())
    }
}

/// Stages the patch before a snap's configure hook and commits it once the
/// hook succeeded.
struct ConfigureHook {
    root: PathBuf,
    tx: Mutex<Option<Transaction>>,
}

impl HookHandler for ConfigureHook {
    fn before(&self, ctx: &HookContext) -> Result<()> {
        let snap = &ctx.setup().snap;
        let request = Request::read(ctx.state(), ctx.task(), &self.root, snap)?;
        let tx = request.apply(snap)?;
        *self.tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        Ok(())
    }

    fn done(&self, ctx: &HookContext) -> Result<()> {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = tx {
            tx.commit(&mut ctx.state().lock())?;
        }
        Ok(())
    }

    fn error(&self, ctx: &HookContext, err: &Error) -> Result<()> {
        warn!(snap = %ctx.setup().snap, error = %err, "configure hook failed, discarding changes");
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }
}
