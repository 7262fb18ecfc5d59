//! Change record and its derived status.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ChangeId, TaskId};
use super::status::{self, Status, StatusCounts};
use super::task::{Task, TaskKind};

/// A user-facing group of tasks representing one logical operation.
///
/// Membership only grows; status is always derived from the member tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    id: ChangeId,
    kind: String,
    summary: String,
    /// Member tasks in insertion order.
    #[serde(default)]
    task_ids: Vec<TaskId>,
    spawn_time: DateTime<Utc>,
    #[serde(default)]
    ready_time: Option<DateTime<Utc>>,
}

impl Change {
    pub(crate) fn new(id: ChangeId, kind: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.into(),
            summary: summary.into(),
            task_ids: Vec::new(),
            spawn_time: Utc::now(),
            ready_time: None,
        }
    }

    pub fn id(&self) -> ChangeId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn task_ids(&self) -> &[TaskId] {
        &self.task_ids
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.ready_time
    }

    /// Returns false when the task was already a member.
    pub(crate) fn add_task(&mut self, task: TaskId) -> bool {
        if self.task_ids.contains(&task) {
            return false;
        }
        self.task_ids.push(task);
        true
    }

    pub(crate) fn retain_tasks(&mut self, keep: impl Fn(TaskId) -> bool) {
        self.task_ids.retain(|id| keep(*id));
    }

    /// Recompute the ready stamp after a member task changed status.
    pub(crate) fn refresh_ready(&mut self, tasks: &BTreeMap<TaskId, Task>) {
        let ready = is_ready_status(self.status_in(tasks));
        match (ready, self.ready_time) {
            (true, None) => self.ready_time = Some(Utc::now()),
            (false, Some(_)) => self.ready_time = None,
            _ => {}
        }
    }

    pub(crate) fn status_in(&self, tasks: &BTreeMap<TaskId, Task>) -> Status {
        status::aggregate(self.member_tasks(tasks).map(Task::status))
    }

    fn member_tasks<'a>(
        &'a self,
        tasks: &'a BTreeMap<TaskId, Task>,
    ) -> impl Iterator<Item = &'a Task> + 'a {
        self.task_ids.iter().filter_map(|id| tasks.get(id))
    }
}

/// No further progress is possible for a change in this status.
pub fn is_ready_status(status: Status) -> bool {
    matches!(
        status,
        Status::Done | Status::Error | Status::Abort | Status::Hold | Status::Undone
    )
}

/// Read-only view of a change together with its member tasks.
///
/// Borrowed from a locked state, so it cannot outlive the lock.
#[derive(Clone, Copy)]
pub struct ChangeView<'a> {
    change: &'a Change,
    tasks: &'a BTreeMap<TaskId, Task>,
}

impl<'a> ChangeView<'a> {
    pub(crate) fn new(change: &'a Change, tasks: &'a BTreeMap<TaskId, Task>) -> Self {
        Self { change, tasks }
    }

    pub fn id(&self) -> ChangeId {
        self.change.id
    }

    pub fn kind(&self) -> &'a str {
        &self.change.kind
    }

    pub fn summary(&self) -> &'a str {
        &self.change.summary
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.change.spawn_time
    }

    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.change.ready_time
    }

    pub fn task_ids(&self) -> &'a [TaskId] {
        &self.change.task_ids
    }

    /// Member tasks in insertion order.
    pub fn tasks(&self) -> Vec<&'a Task> {
        self.change.member_tasks(self.tasks).collect()
    }

    pub fn status(&self) -> Status {
        self.change.status_in(self.tasks)
    }

    pub fn is_ready(&self) -> bool {
        is_ready_status(self.status())
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in self.change.member_tasks(self.tasks) {
            counts.add(task.status());
        }
        counts
    }

    /// Aggregated failure of the change.
    ///
    /// `None` until the change is ready, and for ready changes where no task
    /// ended in Error. Failures are listed by ascending task id.
    pub fn err(&self) -> Option<ChangeError> {
        if self.status() != Status::Error {
            return None;
        }
        let mut failures: Vec<TaskFailure> = self
            .change
            .member_tasks(self.tasks)
            .filter(|task| task.status() == Status::Error)
            .map(|task| TaskFailure {
                task: task.id(),
                kind: task.kind().clone(),
                summary: task.summary().to_string(),
                message: task
                    .last_error()
                    .unwrap_or("unknown failure")
                    .to_string(),
            })
            .collect();
        failures.sort_by_key(|failure| failure.task);
        Some(ChangeError {
            change: self.change.id,
            failures,
        })
    }
}

impl fmt::Debug for ChangeView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeView")
            .field("id", &self.change.id)
            .field("kind", &self.change.kind)
            .field("status", &self.status())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: TaskId,
    pub kind: TaskKind,
    pub summary: String,
    pub message: String,
}

/// Every failed task of a change, in a reproducible order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeError {
    pub change: ChangeId,
    pub failures: Vec<TaskFailure>,
}

impl fmt::Display for ChangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cannot perform the following tasks:")?;
        for failure in &self.failures {
            write!(
                f,
                "\n- {} [{}] ({})",
                failure.summary, failure.kind, failure.message
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for ChangeError {}
