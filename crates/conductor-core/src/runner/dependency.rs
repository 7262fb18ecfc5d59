//! Dependency graph over the tasks that still have work ahead.
//!
//! Design:
//! - Forward edges: task -> tasks it waits for
//! - Reverse edges: task -> tasks waiting for it
//! - Invariant: edges and reverse_edges are kept in sync

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::domain::TaskId;

#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: BTreeSet<TaskId>,

    /// Forward edges: task -> tasks it waits for.
    edges: HashMap<TaskId, HashSet<TaskId>>,

    /// Reverse edges: task -> tasks waiting for it.
    reverse_edges: HashMap<TaskId, HashSet<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, task: TaskId) {
        self.nodes.insert(task);
    }

    /// `task` waits for `depends_on`. Both become nodes.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.nodes.insert(task);
        self.nodes.insert(depends_on);
        self.edges.entry(task).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(task);
    }

    /// Tasks that lie on a dependency cycle, by ascending id.
    ///
    /// Kahn's algorithm peels off every node with no remaining dependency;
    /// a second pass in the reverse direction peels off nodes that merely
    /// hang below a cycle. Whatever survives both is cyclic. `None` for a DAG.
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let forward = Self::peel(&self.nodes, &self.edges, &self.reverse_edges);
        if forward.is_empty() {
            return None;
        }
        let cyclic = Self::peel(&forward, &self.reverse_edges, &self.edges);
        Some(cyclic.into_iter().collect())
    }

    /// Repeatedly remove nodes of `nodes` with no outgoing edge (per `out`)
    /// into the remaining set; returns what could not be removed.
    fn peel(
        nodes: &BTreeSet<TaskId>,
        out: &HashMap<TaskId, HashSet<TaskId>>,
        inc: &HashMap<TaskId, HashSet<TaskId>>,
    ) -> BTreeSet<TaskId> {
        let mut remaining_out: HashMap<TaskId, usize> = nodes
            .iter()
            .map(|n| {
                let count = out
                    .get(n)
                    .map(|deps| deps.iter().filter(|d| nodes.contains(d)).count())
                    .unwrap_or(0);
                (*n, count)
            })
            .collect();

        let mut queue: VecDeque<TaskId> = remaining_out
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut left = nodes.clone();

        while let Some(node) = queue.pop_front() {
            left.remove(&node);
            for waiter in inc.get(&node).into_iter().flatten() {
                if let Some(count) = remaining_out.get_mut(waiter) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(*waiter);
                    }
                }
            }
        }
        left
    }
}
