//! Configuring snaps end to end through the overlord.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use conductor_core::configstate::{
    CONFIGURE_SNAPD, ConfigManager, ConfigureFlags, CoreConfig, Transaction, configure,
};
use conductor_core::hookstate::{HookManager, HookRunner, HookSetup};
use conductor_core::snapstate::{self, Revision, SideInfo, SnapState, SnapType};
use conductor_core::{ChangeId, Error, Overlord, OverlordBuilder, Result, State};

struct NoHooks;

#[async_trait]
impl HookRunner for NoHooks {
    async fn run_hook(&self, _setup: &HookSetup) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Records every call and what it saw for `core.key`.
#[derive(Default)]
struct RecordingCore {
    calls: AtomicUsize,
    seen: Mutex<Vec<Option<String>>>,
    fail_with: Option<&'static str>,
}

impl CoreConfig for RecordingCore {
    fn run(&self, tx: &Transaction) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let value = tx.get::<String>("core", "key").ok();
        self.seen.lock().unwrap().push(value);
        match self.fail_with {
            Some(msg) => Err(Error::task(msg)),
            None => Ok(()),
        }
    }
}

struct Fixture {
    state: State,
    overlord: Overlord,
    core: Arc<RecordingCore>,
    _mount: tempfile::TempDir,
}

fn fixture(core: RecordingCore) -> Fixture {
    let mount = tempfile::tempdir().unwrap();
    let state = State::new(None);
    let core = Arc::new(core);
    let hookmgr = Arc::new(HookManager::new(Arc::new(NoHooks)));
    let configmgr = ConfigManager::new(&hookmgr, core.clone(), mount.path());
    let overlord = OverlordBuilder::new(state.clone())
        .add_manager(hookmgr)
        .add_manager(configmgr)
        .expect_kinds(&["run-hook", CONFIGURE_SNAPD])
        .build()
        .unwrap();
    Fixture {
        state,
        overlord,
        core,
        _mount: mount,
    }
}

fn patch(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn configure_core(st: &State, patch: Map<String, Value>, flags: ConfigureFlags) -> ChangeId {
    let mut guard = st.lock();
    let ts = configure(&mut guard, "core", patch, flags).unwrap();
    let chg = guard.new_change("configure-snap", "configure core");
    guard.add_all(chg, &ts).unwrap();
    chg
}

async fn settle(f: &Fixture) {
    f.overlord.settle(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn configure_applies_patch() {
    let f = fixture(RecordingCore::default());
    let chg = configure_core(&f.state, patch(json!({"key": "value"})), ConfigureFlags::empty());
    settle(&f).await;

    assert_eq!(f.core.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        f.core.seen.lock().unwrap().as_slice(),
        &[Some("value".to_string())]
    );
    let guard = f.state.lock();
    let view = guard.change(chg).unwrap();
    assert!(view.is_ready());
    assert!(view.err().is_none());
    assert_eq!(
        conductor_core::configstate::get::<String>(&guard, "core", "key").unwrap(),
        "value"
    );
}

#[tokio::test]
async fn configure_surfaces_backend_error() {
    let f = fixture(RecordingCore {
        fail_with: Some("runCoreCfg fail"),
        ..RecordingCore::default()
    });
    let chg = configure_core(&f.state, patch(json!({"key": "value"})), ConfigureFlags::empty());
    settle(&f).await;

    let guard = f.state.lock();
    let view = guard.change(chg).unwrap();
    assert!(view.is_ready());
    let err = view.err().unwrap().to_string();
    assert!(err.contains("runCoreCfg fail"), "{err}");
    assert!(err.starts_with("cannot perform the following tasks:"), "{err}");
    assert!(err.contains("[configure-snapd]"), "{err}");
    // a failed transaction is not committed
    assert!(conductor_core::configstate::get::<String>(&guard, "core", "key").is_err());
}

#[tokio::test]
async fn corrupt_config_fails_the_task() {
    let f = fixture(RecordingCore::default());
    f.state.lock().set("config", "broken").unwrap();
    let chg = configure_core(&f.state, patch(json!({"key": "value"})), ConfigureFlags::empty());
    settle(&f).await;

    assert_eq!(f.core.calls.load(Ordering::SeqCst), 0);
    let guard = f.state.lock();
    let view = guard.change(chg).unwrap();
    assert!(view.is_ready());
    let err = view.err().unwrap().to_string();
    assert!(err.contains("cannot decode \"config\""), "{err}");
    assert_eq!(guard.get::<String>("config").unwrap(), "broken");
}

#[tokio::test]
async fn configure_ignores_error_when_asked() {
    let f = fixture(RecordingCore {
        fail_with: Some("runCoreCfg fail"),
        ..RecordingCore::default()
    });
    let chg = configure_core(
        &f.state,
        patch(json!({"key": "value"})),
        ConfigureFlags::IGNORE_HOOK_ERROR,
    );
    settle(&f).await;

    assert_eq!(f.core.calls.load(Ordering::SeqCst), 1);
    let guard = f.state.lock();
    let view = guard.change(chg).unwrap();
    assert!(view.is_ready());
    assert!(view.err().is_none());
    let task = view.tasks()[0];
    assert!(
        task.log()
            .iter()
            .any(|entry| entry.message.contains("runCoreCfg fail"))
    );
}

const GADGET_YAML: &str = "\
defaults:
  core-snap-id:
    key: default-value
";

fn install_gadget_and_core(st: &State, mount: &Path) {
    let meta = mount.join("canonical-pc").join("1").join("meta");
    std::fs::create_dir_all(&meta).unwrap();
    std::fs::write(meta.join("gadget.yaml"), GADGET_YAML).unwrap();

    let mut guard = st.lock();
    snapstate::set(
        &mut guard,
        "canonical-pc",
        Some(SnapState {
            snap_type: SnapType::Gadget,
            sequence: vec![SideInfo {
                real_name: "canonical-pc".to_string(),
                revision: Revision(1),
                snap_id: "pc-snap-id".to_string(),
            }],
            active: true,
            current: Revision(1),
        }),
    )
    .unwrap();
    snapstate::set(
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
}

#[tokio::test]
async fn configure_uses_gadget_defaults() {
    let f = fixture(RecordingCore::default());
    install_gadget_and_core(&f.state, f._mount.path());

    let chg = configure_core(&f.state, Map::new(), ConfigureFlags::USE_CONFIG_DEFAULTS);
    settle(&f).await;

    assert_eq!(
        f.core.seen.lock().unwrap().as_slice(),
        &[Some("default-value".to_string())]
    );
    let guard = f.state.lock();
    assert!(guard.change(chg).unwrap().err().is_none());
}

#[tokio::test]
async fn explicit_patch_wins_over_defaults() {
    let f = fixture(RecordingCore::default());
    install_gadget_and_core(&f.state, f._mount.path());

    configure_core(
        &f.state,
        patch(json!({"key": "explicit"})),
        ConfigureFlags::USE_CONFIG_DEFAULTS | ConfigureFlags::IGNORE_HOOK_ERROR,
    );
    settle(&f).await;

    assert_eq!(
        f.core.seen.lock().unwrap().as_slice(),
        &[Some("explicit".to_string())]
    );
}

#[tokio::test]
async fn defaults_without_gadget_are_empty() {
    let f = fixture(RecordingCore::default());
    let chg = configure_core(&f.state, Map::new(), ConfigureFlags::USE_CONFIG_DEFAULTS);
    settle(&f).await;

    assert_eq!(f.core.seen.lock().unwrap().as_slice(), &[None]);
    let guard = f.state.lock();
    assert!(guard.change(chg).unwrap().err().is_none());
}

#[tokio::test]
async fn configure_builds_one_configure_snapd_task() {
    let f = fixture(RecordingCore::default());
    let mut guard = f.state.lock();
    let ts = configure(
        &mut guard,
        "core",
        patch(json!({"key": "value"})),
        ConfigureFlags::empty(),
    )
    .unwrap();
    assert_eq!(ts.len(), 1);
    let task = guard.task(ts.tasks()[0]).unwrap();
    assert_eq!(task.kind().as_str(), CONFIGURE_SNAPD);
    assert!(task.change().is_none());
}
