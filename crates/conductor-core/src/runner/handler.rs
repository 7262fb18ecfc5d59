//! Handlers execute one task each.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{ChangeId, Task, TaskId, TaskKind};
use crate::error::{Error, Result};
use crate::state::State;

/// Runs the task behind `ctx`.
///
/// Called without the state lock held; bookkeeping goes through the
/// context, which locks only for the duration of each call. Returning an
/// error fails the task and its log records the error text, unless the
/// error is [`Error::Retry`].
#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> Result<()>;
}

/// Task-scoped access handed to a running handler.
#[derive(Clone)]
pub struct TaskContext {
    state: State,
    task: TaskId,
    kind: TaskKind,
    change: Option<ChangeId>,
}

impl TaskContext {
    pub(crate) fn new(state: State, task: &Task) -> Self {
        Self {
            state,
            task: task.id(),
            kind: task.kind().clone(),
            change: task.change(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.task
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn change(&self) -> Option<ChangeId> {
        self.change
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Read something off the task under the lock.
    pub fn with_task<R>(&self, f: impl FnOnce(&Task) -> R) -> Result<R> {
        let guard = self.state.lock();
        let task = guard.task(self.task).ok_or(Error::UnknownTask(self.task))?;
        Ok(f(task))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.with_task(|task| task.get(key))?
    }

    pub fn has(&self, key: &str) -> bool {
        self.with_task(|task| task.has(key)).unwrap_or(false)
    }

    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<()> {
        let mut guard = self.state.lock();
        guard
            .task_mut(self.task)
            .ok_or(Error::UnknownTask(self.task))?
            .set(key, value)
    }

    /// Append a progress line to the task log.
    pub fn logf(&self, message: impl Into<String>) {
        let mut guard = self.state.lock();
        if let Some(task) = guard.task_mut(self.task) {
            task.logf(message);
        }
    }
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> Result<()> {
        (self.f)(ctx).await
    }
}

/// Shorthand for `Arc::new(FnHandler::new(f))`.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler::new(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Status;

    #[tokio::test]
    async fn context_reads_and_writes_task_data() {
        let st = State::new(None);
        let ctx = {
            let mut guard = st.lock();
            let id = guard.new_task("k", "t");
            guard.task_mut(id).unwrap().set("input", 2).unwrap();
            TaskContext::new(st.clone(), guard.task(id).unwrap())
        };

        let handler = handler_fn(|ctx: TaskContext| async move {
            let input: i64 = ctx.get("input")?;
            ctx.set("output", input * 21)?;
            ctx.logf("doubled");
            Ok(())
        });
        handler.run(ctx.clone()).await.unwrap();

        let guard = st.lock();
        let task = guard.task(ctx.id()).unwrap();
        assert_eq!(task.get::<i64>("output").unwrap(), 42);
        assert_eq!(task.log().len(), 1);
        assert_eq!(task.status(), Status::Do);
    }

    #[tokio::test]
    async fn context_reports_vanished_task() {
        let st = State::new(None);
        let ctx = {
            let mut guard = st.lock();
            let id = guard.new_task("k", "t");
            TaskContext::new(st.clone(), guard.task(id).unwrap())
        };
        st.lock().data_mut().tasks.clear();
        assert!(matches!(ctx.get::<i64>("x"), Err(Error::UnknownTask(_))));
    }
}
