//! Task record: kind, status, payload, edges and log.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{ChangeId, TaskId};
use super::status::Status;
use crate::error::{Error, Result};

/// Tag selecting the handler that executes a task, e.g. `run-hook`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(String);

impl TaskKind {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskKind {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskKind {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Error,
}

/// One timestamped line of a task's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            LogLevel::Info => "INFO",
            LogLevel::Error => "ERROR",
        };
        write!(
            f,
            "{} {} {}",
            self.time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            level,
            self.message
        )
    }
}

/// Task-specific parameters and results.
///
/// Values are stored as JSON so the payload stays homogeneous; reads decode
/// into the caller's type and fail loudly on a mismatch.
pub type TaskData = serde_json::Map<String, serde_json::Value>;

/// The smallest schedulable unit of work.
///
/// Mutated only while the state lock is held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    kind: TaskKind,
    summary: String,
    status: Status,
    #[serde(default)]
    data: TaskData,
    /// Predecessors, in the order they were declared.
    #[serde(default)]
    wait_tasks: Vec<TaskId>,
    /// Successors; derived from the predecessors of other tasks.
    #[serde(default, skip_serializing)]
    halt_tasks: Vec<TaskId>,
    #[serde(default)]
    log: Vec<LogEntry>,
    #[serde(default)]
    change: Option<ChangeId>,
    /// Failures are logged but do not fail the task.
    #[serde(default)]
    ignore_error: bool,
    spawn_time: DateTime<Utc>,
    #[serde(default)]
    ready_time: Option<DateTime<Utc>>,
    /// Not to be started before this instant.
    #[serde(default)]
    at_time: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn new(id: TaskId, kind: TaskKind, summary: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            summary: summary.into(),
            status: Status::Do,
            data: TaskData::new(),
            wait_tasks: Vec::new(),
            halt_tasks: Vec::new(),
            log: Vec::new(),
            change: None,
            ignore_error: false,
            spawn_time: Utc::now(),
            ready_time: None,
            at_time: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn change(&self) -> Option<ChangeId> {
        self.change
    }

    pub fn wait_tasks(&self) -> &[TaskId] {
        &self.wait_tasks
    }

    pub fn halt_tasks(&self) -> &[TaskId] {
        &self.halt_tasks
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn ignore_error(&self) -> bool {
        self.ignore_error
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.ready_time
    }

    pub fn at_time(&self) -> Option<DateTime<Utc>> {
        self.at_time
    }

    pub fn data(&self) -> &TaskData {
        &self.data
    }

    /// Decode the payload entry `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .data
            .get(key)
            .ok_or_else(|| Error::NoState(key.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|source| Error::Decode {
            key: key.to_string(),
            source,
        })
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> Result<()> {
        self.data
            .insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn set_ignore_error(&mut self, ignore: bool) {
        self.ignore_error = ignore;
    }

    pub(crate) fn set_status(&mut self, status: Status) {
        self.status = status;
        if status.is_terminal() {
            self.ready_time.get_or_insert_with(Utc::now);
        } else {
            self.ready_time = None;
        }
    }

    pub fn set_at_time(&mut self, at: Option<DateTime<Utc>>) {
        self.at_time = at;
    }

    pub fn logf(&mut self, message: impl Into<String>) {
        self.push_log(LogLevel::Info, message.into());
    }

    pub fn errorf(&mut self, message: impl Into<String>) {
        self.push_log(LogLevel::Error, message.into());
    }

    /// Most recent error line, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.log
            .iter()
            .rev()
            .find(|entry| entry.level == LogLevel::Error)
            .map(|entry| entry.message.as_str())
    }

    fn push_log(&mut self, level: LogLevel, message: String) {
        self.log.push(LogEntry {
            time: Utc::now(),
            level,
            message,
        });
    }

    pub(crate) fn set_change(&mut self, change: ChangeId) {
        self.change = Some(change);
    }

    /// Returns false when the edge already existed.
    pub(crate) fn add_wait(&mut self, predecessor: TaskId) -> bool {
        if self.wait_tasks.contains(&predecessor) {
            return false;
        }
        self.wait_tasks.push(predecessor);
        true
    }

    pub(crate) fn add_halt(&mut self, successor: TaskId) {
        if !self.halt_tasks.contains(&successor) {
            self.halt_tasks.push(successor);
        }
    }

    pub(crate) fn retain_edges(&mut self, keep: impl Fn(TaskId) -> bool) -> usize {
        let before = self.wait_tasks.len();
        self.wait_tasks.retain(|id| keep(*id));
        self.halt_tasks.retain(|id| keep(*id));
        before - self.wait_tasks.len()
    }

    pub(crate) fn clear_halts(&mut self) {
        self.halt_tasks.clear();
    }
}
