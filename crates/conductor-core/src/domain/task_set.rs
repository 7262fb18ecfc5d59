use super::ids::TaskId;

/// Transient builder grouping freshly created tasks and their ordering.
///
/// Holds only ids and edge pairs; nothing touches the state until the set is
/// merged into a change with [`StateGuard::add_all`].
///
/// [`StateGuard::add_all`]: crate::state::StateGuard::add_all
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSet {
    tasks: Vec<TaskId>,
    /// `(task, predecessor)` pairs.
    edges: Vec<(TaskId, TaskId)>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tasks(tasks: impl IntoIterator<Item = TaskId>) -> Self {
        let mut set = Self::new();
        for task in tasks {
            set.add_task(task);
        }
        set
    }

    pub fn add_task(&mut self, task: TaskId) {
        if !self.tasks.contains(&task) {
            self.tasks.push(task);
        }
    }

    /// Append every task and edge of `other`.
    pub fn add_all(&mut self, other: &TaskSet) {
        for task in &other.tasks {
            self.add_task(*task);
        }
        for edge in &other.edges {
            self.push_edge(*edge);
        }
    }

    /// Make every task currently in the set wait for `predecessor`.
    ///
    /// Tasks added afterwards are unaffected.
    pub fn wait_for(&mut self, predecessor: TaskId) {
        let tasks = self.tasks.clone();
        for task in tasks {
            self.push_edge((task, predecessor));
        }
    }

    /// Make every task currently in the set wait for every task of `other`.
    pub fn wait_all(&mut self, other: &TaskSet) {
        for predecessor in &other.tasks {
            self.wait_for(*predecessor);
        }
    }

    /// Order `task` after `predecessor`; both are added to the set.
    pub fn chain(&mut self, predecessor: TaskId, task: TaskId) {
        self.add_task(predecessor);
        self.add_task(task);
        self.push_edge((task, predecessor));
    }

    pub fn tasks(&self) -> &[TaskId] {
        &self.tasks
    }

    pub fn edges(&self) -> &[(TaskId, TaskId)] {
        &self.edges
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    fn push_edge(&mut self, edge: (TaskId, TaskId)) {
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }
}
