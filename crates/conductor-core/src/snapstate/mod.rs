//! Bookkeeping of installed snaps, kept in the state under `snaps`.

pub mod gadget;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::StateGuard;

const SNAPS_KEY: &str = "snaps";

/// Name of the snap whose configuration is applied by the daemon itself.
pub const SYSTEM_SNAP: &str = "core";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub i32);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            write!(f, "x{}", -self.0)
        } else {
            self.0.fmt(f)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapType {
    #[default]
    App,
    Gadget,
    Os,
    Kernel,
    Base,
    Snapd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SideInfo {
    #[serde(rename = "name")]
    pub real_name: String,
    pub revision: Revision,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snap_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapState {
    #[serde(rename = "type")]
    pub snap_type: SnapType,
    #[serde(default)]
    pub sequence: Vec<SideInfo>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub current: Revision,
}

impl SnapState {
    /// Side info of the current revision.
    pub fn current_side_info(&self) -> Option<&SideInfo> {
        self.sequence.iter().find(|si| si.revision == self.current)
    }

    pub fn snap_id(&self) -> Option<&str> {
        self.current_side_info()
            .map(|si| si.snap_id.as_str())
            .filter(|id| !id.is_empty())
    }
}

/// Where revision `revision` of `name` is mounted.
pub fn mount_dir(root: &Path, name: &str, revision: Revision) -> PathBuf {
    root.join(name).join(revision.to_string())
}

/// Every recorded snap, by name.
pub fn all(guard: &StateGuard<'_>) -> Result<BTreeMap<String, SnapState>> {
    match guard.get(SNAPS_KEY) {
        Ok(snaps) => Ok(snaps),
        Err(Error::NoState(_)) => Ok(BTreeMap::new()),
        Err(e) => Err(e),
    }
}

pub fn get(guard: &StateGuard<'_>, name: &str) -> Result<Option<SnapState>> {
    Ok(all(guard)?.remove(name))
}

/// Record `snapst` for `name`; `None` forgets the snap.
pub fn set(guard: &mut StateGuard<'_>, name: &str, snapst: Option<SnapState>) -> Result<()> {
    let mut snaps = all(guard)?;
    match snapst {
        Some(snapst) => {
            snaps.insert(name.to_string(), snapst);
        }
        None => {
            snaps.remove(name);
        }
    }
    guard.set(SNAPS_KEY, snaps)
}

/// The active gadget snap, if one is installed.
pub fn gadget(guard: &StateGuard<'_>) -> Result<Option<(String, SnapState)>> {
    Ok(all(guard)?
        .into_iter()
        .find(|(_, snapst)| snapst.active && snapst.snap_type == SnapType::Gadget))
}
