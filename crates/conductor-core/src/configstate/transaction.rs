use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::state::StateGuard;

const CONFIG_KEY: &str = "config";

type SnapConfig = Map<String, Value>;
type Config = BTreeMap<String, SnapConfig>;

fn load(guard: &StateGuard<'_>) -> Result<Config> {
    match guard.get(CONFIG_KEY) {
        Ok(config) => Ok(config),
        Err(Error::NoState(_)) => Ok(Config::new()),
        Err(e) => Err(e),
    }
}

/// Pending configuration changes on top of a snapshot of the committed
/// values.
///
/// Built under the state lock, then usable without it until
/// [`Transaction::commit`].
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pristine: Config,
    changes: Config,
}

impl Transaction {
    /// Fails if the committed configuration cannot be decoded.
    pub fn new(guard: &StateGuard<'_>) -> Result<Self> {
        Ok(Self {
            pristine: load(guard)?,
            changes: Config::new(),
        })
    }

    fn value(&self, snap: &str, key: &str) -> Option<&Value> {
        self.changes
            .get(snap)
            .and_then(|c| c.get(key))
            .or_else(|| self.pristine.get(snap).and_then(|c| c.get(key)))
    }

    /// Value of `key` for `snap`, pending changes first.
    pub fn get<T: DeserializeOwned>(&self, snap: &str, key: &str) -> Result<T> {
        let value = self.value(snap, key).ok_or_else(|| Error::NoOption {
            snap: snap.to_string(),
            key: key.to_string(),
        })?;
        serde_json::from_value(value.clone()).map_err(|source| Error::Decode {
            key: format!("{snap}.{key}"),
            source,
        })
    }

    pub fn set<T: Serialize>(&mut self, snap: &str, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.changes
            .entry(snap.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Keys of `snap` changed in this transaction, sorted.
    pub fn changes(&self, snap: &str) -> Vec<&str> {
        self.changes
            .get(snap)
            .map(|c| c.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.values().all(Map::is_empty)
    }

    /// Write the pending changes over the currently committed values.
    ///
    /// Values committed by others since the snapshot survive unless this
    /// transaction changed the same key.
    pub fn commit(self, guard: &mut StateGuard<'_>) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let mut config = load(guard)?;
        for (snap, changes) in self.changes {
            config.entry(snap).or_default().extend(changes);
        }
        guard.set(CONFIG_KEY, config)
    }
}
