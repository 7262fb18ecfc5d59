//! Serializable contents of the state.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{Change, ChangeId, Task, TaskId, TaskKind};

/// Everything the state lock guards.
///
/// Tasks and changes are keyed by id in ordered maps so the encoded form and
/// every iteration over them are stable.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct StateData {
    /// Manager-private settings, e.g. `config` or `snaps`.
    #[serde(default)]
    pub(crate) data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub(crate) changes: BTreeMap<ChangeId, Change>,
    #[serde(default)]
    pub(crate) tasks: BTreeMap<TaskId, Task>,
    #[serde(default, rename = "last-change-id")]
    pub(crate) last_change_id: u64,
    #[serde(default, rename = "last-task-id")]
    pub(crate) last_task_id: u64,
    #[serde(skip)]
    pub(crate) modified: bool,
}

impl StateData {
    pub(crate) fn allocate_change_id(&mut self) -> ChangeId {
        self.last_change_id += 1;
        ChangeId::new(self.last_change_id)
    }

    pub(crate) fn allocate_task_id(&mut self) -> TaskId {
        self.last_task_id += 1;
        TaskId::new(self.last_task_id)
    }

    pub(crate) fn insert_change(&mut self, kind: &str, summary: &str) -> ChangeId {
        let id = self.allocate_change_id();
        self.changes.insert(id, Change::new(id, kind, summary));
        self.modified = true;
        id
    }

    pub(crate) fn insert_task(&mut self, kind: TaskKind, summary: &str) -> TaskId {
        let id = self.allocate_task_id();
        self.tasks.insert(id, Task::new(id, kind, summary));
        self.modified = true;
        id
    }

    /// Record `task` waiting for `predecessor` on both ends.
    pub(crate) fn link(&mut self, task: TaskId, predecessor: TaskId) {
        let added = self
            .tasks
            .get_mut(&task)
            .map(|t| t.add_wait(predecessor))
            .unwrap_or(false);
        if added && let Some(pre) = self.tasks.get_mut(&predecessor) {
            pre.add_halt(task);
        }
    }

    /// Stamp or clear the ready time of the change owning `task`.
    pub(crate) fn refresh_change_of(&mut self, task: TaskId) {
        let Some(change_id) = self.tasks.get(&task).and_then(Task::change) else {
            return;
        };
        if let Some(change) = self.changes.get_mut(&change_id) {
            change.refresh_ready(&self.tasks);
        }
    }

    /// Restore the invariants a freshly decoded state may violate.
    ///
    /// Edges to missing tasks are dropped, successor edges are rebuilt from
    /// predecessor edges and the id counters are moved past every restored id.
    pub(crate) fn repair(&mut self) {
        let known: BTreeSet<TaskId> = self.tasks.keys().copied().collect();

        for task in self.tasks.values_mut() {
            let dropped = task.retain_edges(|id| known.contains(&id));
            if dropped > 0 {
                warn!(task = %task.id(), dropped, "dropping edges to missing tasks");
            }
            task.clear_halts();
        }

        let edges: Vec<(TaskId, TaskId)> = self
            .tasks
            .values()
            .flat_map(|t| t.wait_tasks().iter().map(move |pre| (t.id(), *pre)))
            .collect();
        for (task, predecessor) in edges {
            if let Some(pre) = self.tasks.get_mut(&predecessor) {
                pre.add_halt(task);
            }
        }

        for change in self.changes.values_mut() {
            change.retain_tasks(|id| known.contains(&id));
        }

        if let Some(max) = self.tasks.keys().next_back() {
            self.last_task_id = self.last_task_id.max(max.as_u64());
        }
        if let Some(max) = self.changes.keys().next_back() {
            self.last_change_id = self.last_change_id.max(max.as_u64());
        }
    }

    /// Drop the given tasks and every edge pointing at them.
    pub(crate) fn remove_tasks(&mut self, doomed: &BTreeSet<TaskId>) {
        if doomed.is_empty() {
            return;
        }
        self.tasks.retain(|id, _| !doomed.contains(id));
        for task in self.tasks.values_mut() {
            task.retain_edges(|id| !doomed.contains(&id));
        }
        for change in self.changes.values_mut() {
            change.retain_tasks(|id| !doomed.contains(&id));
        }
        self.modified = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let mut data = StateData::default();
        let a = data.insert_task(TaskKind::new("k"), "a");
        let b = data.insert_task(TaskKind::new("k"), "b");
        let c = data.insert_change("k", "c");
        assert!(a < b);
        assert_eq!(c, ChangeId::new(1));
        assert!(data.modified);
    }

    #[test]
    fn link_maintains_both_directions() {
        let mut data = StateData::default();
        let a = data.insert_task(TaskKind::new("k"), "a");
        let b = data.insert_task(TaskKind::new("k"), "b");
        data.link(b, a);
        data.link(b, a);
        assert_eq!(data.tasks[&b].wait_tasks(), &[a]);
        assert_eq!(data.tasks[&a].halt_tasks(), &[b]);
    }

    #[test]
    fn repair_drops_dangling_edges_and_advances_counters() {
        let mut data = StateData::default();
        let a = data.insert_task(TaskKind::new("k"), "a");
        let b = data.insert_task(TaskKind::new("k"), "b");
        data.link(b, a);
        data.tasks.remove(&a);
        data.last_task_id = 0;

        data.repair();

        assert!(data.tasks[&b].wait_tasks().is_empty());
        assert_eq!(data.last_task_id, b.as_u64());
    }

    #[test]
    fn remove_tasks_cleans_edges() {
        let mut data = StateData::default();
        let a = data.insert_task(TaskKind::new("k"), "a");
        let b = data.insert_task(TaskKind::new("k"), "b");
        data.link(b, a);
        data.remove_tasks(&BTreeSet::from([a]));
        assert!(!data.tasks.contains_key(&a));
        assert!(data.tasks[&b].wait_tasks().is_empty());
    }
}
