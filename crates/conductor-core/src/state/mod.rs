//! The process-wide store of tasks, changes and manager settings.
//!
//! Design:
//! - One coarse mutex guards everything; callers hold it explicitly through a
//!   [`StateGuard`] and may group any number of reads and writes under it.
//! - The guard is released on drop. A scope that modified the state writes a
//!   single checkpoint to the backend at that point and wakes the runner.
//! - The guard is `!Send`, so it cannot be carried across an `.await` inside
//!   a spawned task; handlers re-lock for each bookkeeping step.

mod backend;
mod data;
mod prune;

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tracing::{debug, error};

pub use backend::{Backend, FileBackend, MemoryBackend};
pub(crate) use data::StateData;
pub use prune::{PruneOptions, PruneReport};

use crate::domain::{ChangeId, ChangeView, Status, Task, TaskId, TaskKind, TaskSet};
use crate::error::{Error, Result};

struct Inner {
    data: Mutex<StateData>,
    backend: Option<Arc<dyn Backend>>,
    changed: Notify,
}

/// Shared handle to the state. Cloning is cheap.
#[derive(Clone)]
pub struct State {
    inner: Arc<Inner>,
}

impl State {
    /// Empty state, optionally checkpointed into `backend`.
    pub fn new(backend: Option<Arc<dyn Backend>>) -> Self {
        Self::from_data(StateData::default(), backend)
    }

    /// Restore a state previously written by [`StateGuard::save`] or a backend.
    pub fn load(reader: impl Read, backend: Option<Arc<dyn Backend>>) -> Result<Self> {
        let mut data: StateData = serde_json::from_reader(reader)?;
        data.repair();
        debug!(
            tasks = data.tasks.len(),
            changes = data.changes.len(),
            "state restored"
        );
        Ok(Self::from_data(data, backend))
    }

    fn from_data(data: StateData, backend: Option<Arc<dyn Backend>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(data),
                backend,
                changed: Notify::new(),
            }),
        }
    }

    /// Acquire the state lock.
    pub fn lock(&self) -> StateGuard<'_> {
        let data = self
            .inner
            .data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        StateGuard {
            data: Some(data),
            inner: &self.inner,
        }
    }

    /// Wait until some lock scope modifies the state.
    pub(crate) async fn changed(&self) {
        self.inner.changed.notified().await;
    }

    /// Wake whoever waits in [`State::changed`].
    pub(crate) fn wake(&self) {
        self.inner.changed.notify_one();
    }
}

/// Exclusive access to the state; released on drop.
pub struct StateGuard<'a> {
    data: Option<MutexGuard<'a, StateData>>,
    inner: &'a Inner,
}

impl<'a> StateGuard<'a> {
    pub(crate) fn data(&self) -> &StateData {
        // Only `None` inside `drop`.
        self.data.as_deref().unwrap_or_else(|| unreachable!())
    }

    pub(crate) fn data_mut(&mut self) -> &mut StateData {
        let data = self.data.as_deref_mut().unwrap_or_else(|| unreachable!());
        data.modified = true;
        data
    }

    pub fn new_change(&mut self, kind: &str, summary: &str) -> ChangeId {
        self.data_mut().insert_change(kind, summary)
    }

    /// Allocate a task not yet attached to any change.
    pub fn new_task(&mut self, kind: impl Into<TaskKind>, summary: &str) -> TaskId {
        self.data_mut().insert_task(kind.into(), summary)
    }

    pub fn change(&self, id: ChangeId) -> Option<ChangeView<'_>> {
        let data = self.data();
        data.changes
            .get(&id)
            .map(|change| ChangeView::new(change, &data.tasks))
    }

    /// Every change, by ascending id.
    pub fn changes(&self) -> Vec<ChangeView<'_>> {
        let data = self.data();
        data.changes
            .values()
            .map(|change| ChangeView::new(change, &data.tasks))
            .collect()
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.data().tasks.get(&id)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.data_mut().tasks.get_mut(&id)
    }

    /// Every task, by ascending id.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.data().tasks.values()
    }

    /// Move a task to `status`, keeping its change's ready stamp current.
    pub fn set_status(&mut self, id: TaskId, status: Status) -> Result<()> {
        let data = self.data_mut();
        data.tasks
            .get_mut(&id)
            .ok_or(Error::UnknownTask(id))?
            .set_status(status);
        data.refresh_change_of(id);
        Ok(())
    }

    /// Attach every task of `set` to `change` and wire its edges.
    ///
    /// Validates everything before touching the state, so a failure leaves
    /// it unchanged. Re-adding a task or an edge already present is a no-op.
    pub fn add_all(&mut self, change: ChangeId, set: &TaskSet) -> Result<()> {
        {
            let data = self.data();
            if !data.changes.contains_key(&change) {
                return Err(Error::UnknownChange(change));
            }
            for id in set.tasks() {
                let task = data.tasks.get(id).ok_or(Error::UnknownTask(*id))?;
                if let Some(owner) = task.change()
                    && owner != change
                {
                    return Err(Error::TaskInOtherChange {
                        task: *id,
                        change: owner,
                    });
                }
            }
            for (task, predecessor) in set.edges() {
                for id in [task, predecessor] {
                    if !data.tasks.contains_key(id) {
                        return Err(Error::UnknownTask(*id));
                    }
                }
            }
        }

        let data = self.data_mut();
        for id in set.tasks() {
            if let Some(task) = data.tasks.get_mut(id) {
                task.set_change(change);
            }
            if let Some(chg) = data.changes.get_mut(&change) {
                chg.add_task(*id);
            }
        }
        for (task, predecessor) in set.edges() {
            data.link(*task, *predecessor);
        }
        if let Some(chg) = data.changes.get_mut(&change) {
            chg.refresh_ready(&data.tasks);
        }
        Ok(())
    }

    pub fn add_task(&mut self, change: ChangeId, task: TaskId) -> Result<()> {
        self.add_all(change, &TaskSet::from_tasks([task]))
    }

    /// Stop every not-yet-started task of the change.
    ///
    /// Running handlers are left to finish.
    pub fn abort_change(&mut self, id: ChangeId) -> Result<()> {
        let members: Vec<TaskId> = self
            .data()
            .changes
            .get(&id)
            .ok_or(Error::UnknownChange(id))?
            .task_ids()
            .to_vec();
        let data = self.data_mut();
        for task_id in members {
            if let Some(task) = data.tasks.get_mut(&task_id)
                && matches!(task.status(), Status::Do | Status::Wait)
            {
                task.set_status(Status::Abort);
                task.logf("aborted before it started");
            }
        }
        if let Some(change) = data.changes.get_mut(&id) {
            change.refresh_ready(&data.tasks);
        }
        debug!(change = %id, "change aborted");
        Ok(())
    }

    /// Decode the global entry `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .data()
            .data
            .get(key)
            .ok_or_else(|| Error::NoState(key.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|source| Error::Decode {
            key: key.to_string(),
            source,
        })
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.data_mut().data.insert(key.to_string(), value);
        Ok(())
    }

    pub fn has(&self, key: &str) -> bool {
        self.data().data.contains_key(key)
    }

    /// Encode the whole state.
    pub fn save(&self, writer: impl Write) -> Result<()> {
        serde_json::to_writer(writer, self.data())?;
        Ok(())
    }

    fn checkpoint(&mut self) {
        let Some(data) = self.data.as_deref_mut() else {
            return;
        };
        if !data.modified {
            return;
        }
        data.modified = false;
        let Some(backend) = self.inner.backend.as_ref() else {
            return;
        };
        match serde_json::to_vec(&*data) {
            Ok(bytes) => {
                if let Err(e) = backend.checkpoint(&bytes) {
                    error!(error = %e, "cannot checkpoint state");
                }
            }
            Err(e) => error!(error = %e, "cannot encode state"),
        }
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        let modified = self.data.as_ref().is_some_and(|d| d.modified);
        self.checkpoint();
        drop(self.data.take());
        if modified {
            self.inner.changed.notify_one();
        }
    }
}
