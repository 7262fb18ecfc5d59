use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::HookSetup;
use crate::error::{Error, Result};
use crate::snapstate::mount_dir;

/// Executes hooks on behalf of the hook manager.
#[async_trait]
pub trait HookRunner: Send + Sync {
    /// Run the hook and return its combined output.
    ///
    /// `Ok(None)` means the snap does not ship the hook.
    async fn run_hook(&self, setup: &HookSetup) -> Result<Option<String>>;
}

/// Runs `<mount>/<snap>/<revision>/meta/hooks/<hook>` as a child process.
#[derive(Debug, Clone)]
pub struct ScriptHookRunner {
    mount_dir: PathBuf,
}

impl ScriptHookRunner {
    pub fn new(mount_dir: impl Into<PathBuf>) -> Self {
        Self {
            mount_dir: mount_dir.into(),
        }
    }

    pub fn hook_path(&self, setup: &HookSetup) -> PathBuf {
        hook_path(&self.mount_dir, setup)
    }
}

fn hook_path(root: &Path, setup: &HookSetup) -> PathBuf {
    mount_dir(root, &setup.snap, setup.revision)
        .join("meta")
        .join("hooks")
        .join(&setup.hook)
}

#[async_trait]
impl HookRunner for ScriptHookRunner {
    async fn run_hook(&self, setup: &HookSetup) -> Result<Option<String>> {
        let path = self.hook_path(setup);
        if !path.exists() {
            debug!(path = %path.display(), "hook not shipped");
            return Ok(None);
        }

        info!(snap = %setup.snap, hook = %setup.hook, "running hook");
        let output = Command::new(&path)
            .env("SNAP_NAME", &setup.snap)
            .env("SNAP_REVISION", setup.revision.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::io(&path, e))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(Error::Other(format!(
                "{} hook of snap {:?} failed with exit status {}: {}",
                setup.hook,
                setup.snap,
                code,
                combined.trim()
            )));
        }
        Ok(Some(combined))
    }
}
