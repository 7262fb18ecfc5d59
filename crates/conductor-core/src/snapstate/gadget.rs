//! Configuration defaults declared by the gadget snap.
//!
//! ```yaml
//! defaults:
//!   <snap-id>:
//!     key: value
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use super::{get, gadget, mount_dir};
use crate::error::{Error, Result};
use crate::state::StateGuard;

pub type Defaults = serde_json::Map<String, serde_json::Value>;

/// The parts of `meta/gadget.yaml` this crate reads.
#[derive(Debug, Default, Deserialize)]
pub struct GadgetInfo {
    #[serde(default)]
    pub defaults: BTreeMap<String, Defaults>,
}

impl GadgetInfo {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Gadget(e.to_string()))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::parse(&text)
    }
}

/// Where to find the defaults for one snap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultsSource {
    pub gadget_yaml: PathBuf,
    pub snap_id: String,
}

impl DefaultsSource {
    /// Locate the source under the lock; reading happens later without it.
    ///
    /// `None` when no gadget is installed or the snap has no snap-id.
    pub fn locate(guard: &StateGuard<'_>, root: &Path, snap: &str) -> Result<Option<Self>> {
        let Some(snapst) = get(guard, snap)? else {
            debug!(snap, "snap not installed, no gadget defaults");
            return Ok(None);
        };
        let Some(snap_id) = snapst.snap_id() else {
            debug!(snap, "snap has no snap-id, no gadget defaults");
            return Ok(None);
        };
        let Some((name, gadget_state)) = gadget(guard)? else {
            debug!(snap, "no gadget installed");
            return Ok(None);
        };
        Ok(Some(Self {
            gadget_yaml: mount_dir(root, &name, gadget_state.current)
                .join("meta")
                .join("gadget.yaml"),
            snap_id: snap_id.to_string(),
        }))
    }

    pub fn read(&self) -> Result<Defaults> {
        let mut info = GadgetInfo::read(&self.gadget_yaml)?;
        Ok(info.defaults.remove(&self.snap_id).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapstate::{Revision, SideInfo, SnapState, SnapType, set};
    use crate::state::State;

    const GADGET_YAML: &str = r#"
defaults:
  core-snap-id:
      key: default-value
      nested:
        inner: 3

volumes:
    volume-id:
        bootloader: grub
"#;

    #[test]
    fn parses_defaults_and_ignores_volumes() {
        let info = GadgetInfo::parse(GADGET_YAML).unwrap();
        let core = &info.defaults["core-snap-id"];
        assert_eq!(core["key"], "default-value");
        assert_eq!(core["nested"]["inner"], 3);
    }

    #[test]
    fn bad_yaml_is_gadget_error() {
        assert!(matches!(
            GadgetInfo::parse("defaults: [unclosed"),
            Err(Error::Gadget(_))
        ));
    }

    #[test]
    fn locate_needs_gadget_and_snap_id() {
        let st = State::new(None);
        let mut guard = st.lock();
        let root = Path::new("/snap");
        assert!(DefaultsSource::locate(&guard, root, "core").unwrap().is_none());

        set(
            &mut guard,
            "core",
            Some(SnapState {
                snap_type: SnapType::Os,
                sequence: vec![SideInfo {
                    real_name: "core".to_string(),
                    revision: Revision(11),
                    snap_id: "core-snap-id".to_string(),
                }],
                active: true,
                current: Revision(11),
            }),
        )
        .unwrap();
        assert!(DefaultsSource::locate(&guard, root, "core").unwrap().is_none());

        set(
            &mut guard,
            "canonical-pc",
            Some(SnapState {
                snap_type: SnapType::Gadget,
                sequence: vec![SideInfo {
                    real_name: "canonical-pc".to_string(),
                    revision: Revision(1),
                    snap_id: String::new(),
                }],
                active: true,
                current: Revision(1),
            }),
        )
        .unwrap();
        let source = DefaultsSource::locate(&guard, root, "core").unwrap().unwrap();
        assert_eq!(
            source.gadget_yaml,
            PathBuf::from("/snap/canonical-pc/1/meta/gadget.yaml")
        );
        assert_eq!(source.snap_id, "core-snap-id");
    }

    #[test]
    fn read_picks_the_snap_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gadget.yaml");
        std::fs::write(&path, GADGET_YAML).unwrap();

        let hit = DefaultsSource {
            gadget_yaml: path.clone(),
            snap_id: "core-snap-id".to_string(),
        };
        assert_eq!(hit.read().unwrap()["key"], "default-value");

        let miss = DefaultsSource {
            gadget_yaml: path,
            snap_id: "other".to_string(),
        };
        assert!(miss.read().unwrap().is_empty());
    }
}
