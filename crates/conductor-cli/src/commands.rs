use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use conductor_core::configstate::{self, ConfigManager, ConfigureFlags, CoreConfig, Transaction};
use conductor_core::hookstate::{HookManager, ScriptHookRunner};
use conductor_core::snapstate::{self, Revision, SYSTEM_SNAP, SideInfo, SnapType};
use conductor_core::state::FileBackend;
use conductor_core::{ChangeId, Overlord, OverlordBuilder, OverlordConfig, State};

use crate::cli::{CliArgs, Command, SnapTypeArg};

/// Core configuration backend of the command-line tool: records what changed.
struct LoggedCore;

impl CoreConfig for LoggedCore {
    fn run(&self, tx: &Transaction) -> conductor_core::Result<()> {
        for key in tx.changes(SYSTEM_SNAP) {
            let value: Value = tx.get(SYSTEM_SNAP, key)?;
            info!(key, %value, "core option set");
        }
        Ok(())
    }
}

pub async fn run(args: CliArgs) -> Result<()> {
    let config = OverlordConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let state_file = args
        .state_file
        .clone()
        .unwrap_or_else(|| config.dirs.state_file.clone());
    let state = open_state(&state_file)?;

    match args.command {
        Command::Configure {
            snap,
            options,
            ignore_hook_error,
            use_defaults,
            no_wait,
        } => {
            let mut flags = ConfigureFlags::empty();
            if ignore_hook_error {
                flags = flags | ConfigureFlags::IGNORE_HOOK_ERROR;
            }
            if use_defaults {
                flags = flags | ConfigureFlags::USE_CONFIG_DEFAULTS;
            }
            configure(state, config, &snap, &options, flags, no_wait).await
        }
        Command::Get { snap, key } => {
            let value: Value = configstate::get(&state.lock(), &snap, &key)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Command::Changes { json } => {
            list_changes(&state, json)?;
            Ok(())
        }
        Command::Tasks { change } => list_tasks(&state, &change),
        Command::SetSnap {
            name,
            revision,
            snap_id,
            snap_type,
        } => {
            let mut guard = state.lock();
            let mut snapst = snapstate::get(&guard, &name)?.unwrap_or_default();
            let revision = Revision(revision);
            snapst.sequence.retain(|si| si.revision != revision);
            snapst.sequence.push(SideInfo {
                real_name: name.clone(),
                revision,
                snap_id: snap_id.unwrap_or_default(),
            });
            snapst.snap_type = snap_type_of(snap_type);
            snapst.current = revision;
            snapst.active = true;
            snapstate::set(&mut guard, &name, Some(snapst))?;
            println!("{name} {revision} recorded");
            Ok(())
        }
        Command::Prune => {
            println!("{}", prune(state, config)?);
            Ok(())
        }
    }
}

fn open_state(path: &Path) -> Result<State> {
    let backend = Arc::new(FileBackend::new(path));
    if !path.exists() {
        debug!(path = %path.display(), "no state file yet, starting empty");
        return Ok(State::new(Some(backend)));
    }
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    State::load(file, Some(backend)).with_context(|| format!("loading {}", path.display()))
}

fn build_overlord(state: State, config: OverlordConfig) -> Result<Overlord> {
    let mount_dir = config.dirs.snap_mount_dir.clone();
    let hookmgr = Arc::new(HookManager::new(Arc::new(ScriptHookRunner::new(
        mount_dir.clone(),
    ))));
    let configmgr = ConfigManager::new(&hookmgr, Arc::new(LoggedCore), mount_dir);
    let overlord = OverlordBuilder::new(state)
        .add_manager(hookmgr)
        .add_manager(configmgr)
        .expect_kinds(&["run-hook", "configure-snapd"])
        .config(config)
        .build()?;
    Ok(overlord)
}

fn prune(state: State, config: OverlordConfig) -> Result<String> {
    let overlord = build_overlord(state, config)?;
    let report = overlord.prune();
    Ok(format!(
        "removed {} changes ({} tasks), aborted {}",
        report.removed_changes.len(),
        report.removed_tasks,
        report.aborted_changes.len()
    ))
}

async fn configure(
    state: State,
    config: OverlordConfig,
    snap: &str,
    options: &[String],
    flags: ConfigureFlags,
    no_wait: bool,
) -> Result<()> {
    let patch = parse_options(options)?;
    let timeout = config.settle_timeout();
    let overlord = build_overlord(state.clone(), config)?;

    let change = {
        let mut guard = state.lock();
        let ts = configstate::configure(&mut guard, snap, patch, flags)?;
        let change = guard.new_change("configure-snap", &format!("Change configuration of {snap:?} snap"));
        guard.add_all(change, &ts)?;
        change
    };
    println!("{change}");
    if no_wait {
        return Ok(());
    }

    overlord.settle(timeout).await?;

    let guard = state.lock();
    let Some(view) = guard.change(change) else {
        bail!("{change} disappeared");
    };
    if let Some(err) = view.err() {
        bail!("{err}");
    }
    println!("{} {}", view.id(), view.status());
    Ok(())
}

/// `key=value` pairs; values that are not JSON are taken as strings.
fn parse_options(options: &[String]) -> Result<Map<String, Value>> {
    let mut patch = Map::new();
    for option in options {
        let Some((key, raw)) = option.split_once('=') else {
            bail!("invalid option {option:?}, expected key=value");
        };
        if key.is_empty() {
            bail!("invalid option {option:?}, empty key");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        patch.insert(key.to_string(), value);
    }
    Ok(patch)
}

fn list_changes(state: &State, as_json: bool) -> Result<()> {
    let guard = state.lock();
    if as_json {
        let rows: Vec<Value> = guard
            .changes()
            .into_iter()
            .map(|view| {
                json!({
                    "id": view.id().to_string(),
                    "kind": view.kind(),
                    "summary": view.summary(),
                    "status": view.status().as_str(),
                    "ready": view.is_ready(),
                    "spawn-time": view.spawn_time(),
                    "ready-time": view.ready_time(),
                    "tasks": view.status_counts(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{:<12} {:<8} {:<26} SUMMARY", "ID", "STATUS", "SPAWN");
    for view in guard.changes() {
        println!(
            "{:<12} {:<8} {:<26} {}",
            view.id().to_string(),
            view.status().as_str(),
            view.spawn_time().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            view.summary()
        );
    }
    Ok(())
}

fn list_tasks(state: &State, change: &str) -> Result<()> {
    let id = parse_change_id(change)?;
    let guard = state.lock();
    let Some(view) = guard.change(id) else {
        bail!("no such change: {id}");
    };
    for task in view.tasks() {
        println!(
            "{:<10} {:<8} {:<16} {}",
            task.id().to_string(),
            task.status().as_str(),
            task.kind().as_str(),
            task.summary()
        );
        for entry in task.log() {
            println!("    {entry}");
        }
    }
    if let Some(err) = view.err() {
        println!();
        println!("{err}");
    }
    Ok(())
}

fn parse_change_id(raw: &str) -> Result<ChangeId> {
    let digits = raw.strip_prefix("change-").unwrap_or(raw);
    let n: u64 = digits
        .parse()
        .with_context(|| format!("invalid change id {raw:?}"))?;
    Ok(ChangeId::new(n))
}

fn snap_type_of(arg: SnapTypeArg) -> SnapType {
    match arg {
        SnapTypeArg::App => SnapType::App,
        SnapTypeArg::Gadget => SnapType::Gadget,
        SnapTypeArg::Os => SnapType::Os,
        SnapTypeArg::Kernel => SnapType::Kernel,
        SnapTypeArg::Base => SnapType::Base,
        SnapTypeArg::Snapd => SnapType::Snapd,
    }
}
