//! Runtime settings, read from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::state::PruneOptions;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct OverlordConfig {
    pub overlord: LoopSettings,
    pub prune: PruneSettings,
    pub dirs: DirSettings,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopSettings {
    /// Period of the background loop when nothing wakes it.
    pub ensure_interval_ms: u64,
    /// Budget for settling a change from the command line.
    pub settle_timeout_secs: u64,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            ensure_interval_ms: 5 * 60 * 1000,
            settle_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PruneSettings {
    pub interval_secs: u64,
    pub wait_hours: u64,
    pub abort_wait_hours: u64,
    pub max_ready_changes: usize,
}

impl Default for PruneSettings {
    fn default() -> Self {
        Self {
            interval_secs: 10 * 60,
            wait_hours: 24,
            abort_wait_hours: 7 * 24,
            max_ready_changes: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DirSettings {
    pub state_file: PathBuf,
    pub snap_mount_dir: PathBuf,
}

impl Default for DirSettings {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("/var/lib/conductor/state.json"),
            snap_mount_dir: PathBuf::from("/snap"),
        }
    }
}

fn hours(h: u64) -> Option<TimeDelta> {
    i64::try_from(h).ok().and_then(TimeDelta::try_hours)
}

impl OverlordConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        for (name, value) in [
            ("prune.wait_hours", config.prune.wait_hours),
            ("prune.abort_wait_hours", config.prune.abort_wait_hours),
        ] {
            if hours(value).is_none() {
                return Err(Error::Config(format!("{name} out of range: {value}")));
            }
        }
        Ok(config)
    }

    pub fn ensure_interval(&self) -> Duration {
        Duration::from_millis(self.overlord.ensure_interval_ms.max(1))
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.overlord.settle_timeout_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune.interval_secs.max(1))
    }

    pub fn prune_options(&self) -> PruneOptions {
        PruneOptions {
            wait: hours(self.prune.wait_hours).unwrap_or(TimeDelta::MAX),
            abort_wait: hours(self.prune.abort_wait_hours).unwrap_or(TimeDelta::MAX),
            max_ready_changes: self.prune.max_ready_changes,
        }
    }
}
