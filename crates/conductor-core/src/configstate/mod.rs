//! Configuration of snaps.
//!
//! [`configure`] builds the task applying a patch: `configure-snapd` for the
//! system snap, a `configure` hook run for anything else. Values live in the
//! state under `config` and are read and written through a [`Transaction`].

mod manager;
mod transaction;

use std::ops::BitOr;

use serde_json::{Map, Value};

pub use manager::{ConfigManager, CoreConfig};
pub use transaction::Transaction;

use crate::domain::TaskSet;
use crate::error::{Error, Result};
use crate::hookstate::{HookSetup, hook_task};
use crate::snapstate::{self, SYSTEM_SNAP};
use crate::state::StateGuard;

pub const CONFIGURE_SNAPD: &str = "configure-snapd";
pub const CONFIGURE_HOOK: &str = "configure";

pub(crate) const PATCH_KEY: &str = "patch";
pub(crate) const USE_DEFAULTS_KEY: &str = "use-defaults";

pub type Patch = Map<String, Value>;

/// Options for [`configure`]. They combine freely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConfigureFlags(u32);

impl ConfigureFlags {
    /// A failing configuration does not fail the change.
    pub const IGNORE_HOOK_ERROR: Self = Self(1);
    /// Apply the gadget's defaults for the snap underneath the patch.
    pub const USE_CONFIG_DEFAULTS: Self = Self(2);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ConfigureFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Build the single task that applies `patch` to `snap`.
///
/// An empty patch re-applies the current configuration.
pub fn configure(
    guard: &mut StateGuard<'_>,
    snap: &str,
    patch: Patch,
    flags: ConfigureFlags,
) -> Result<TaskSet> {
    let task = if snap == SYSTEM_SNAP {
        guard.new_task(CONFIGURE_SNAPD, &format!("Run configure of {snap:?} snap"))
    } else {
        let snapst = snapstate::get(guard, snap)?
            .ok_or_else(|| Error::Other(format!("snap {snap:?} is not installed")))?;
        let setup = HookSetup {
            snap: snap.to_string(),
            revision: snapst.current,
            hook: CONFIGURE_HOOK.to_string(),
            optional: true,
        };
        hook_task(
            guard,
            &format!("Run configure hook of {snap:?} snap"),
            &setup,
        )?
    };

    let use_defaults = flags.contains(ConfigureFlags::USE_CONFIG_DEFAULTS);
    let entry = guard.task_mut(task).ok_or(Error::UnknownTask(task))?;
    entry.set(PATCH_KEY, patch)?;
    if use_defaults {
        entry.set(USE_DEFAULTS_KEY, true)?;
    }
    entry.set_ignore_error(flags.contains(ConfigureFlags::IGNORE_HOOK_ERROR));

    Ok(TaskSet::from_tasks([task]))
}

/// Committed value of `key` for `snap`.
pub fn get<T: serde::de::DeserializeOwned>(guard: &StateGuard<'_>, snap: &str, key: &str) -> Result<T> {
    Transaction::new(guard)?.get(snap, key)
}
