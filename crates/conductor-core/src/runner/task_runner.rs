//! Drives tasks from Do towards a terminal status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dependency::DependencyGraph;
use super::handler::TaskContext;
use super::registry::HandlerRegistry;
use crate::domain::{Status, TaskId};
use crate::error::Error;
use crate::state::{State, StateData, StateGuard};

type Running = Arc<Mutex<HashMap<TaskId, JoinHandle<()>>>>;

/// What one [`TaskRunner::ensure`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tick {
    /// Tasks whose status this pass changed without running them.
    pub settled: usize,
    /// Handlers started.
    pub started: usize,
    /// Handlers still running when the pass ended.
    pub in_flight: usize,
    /// Earliest instant a postponed task becomes runnable.
    pub next_retry: Option<DateTime<Utc>>,
}

impl Tick {
    /// Nothing happened and nothing will without outside help.
    pub fn is_quiet(&self) -> bool {
        self.settled == 0 && self.started == 0 && self.in_flight == 0 && self.next_retry.is_none()
    }
}

/// Dispatches runnable tasks to their handlers.
///
/// Design:
/// - Lock order is always state, then `running`.
/// - A handler is spawned and tracked while the state lock is held, and its
///   result is committed under the same lock, so a pass never observes a
///   finished handler that is still listed as running.
/// - The state lock is never held across a handler invocation.
pub struct TaskRunner {
    state: State,
    registry: Arc<HandlerRegistry>,
    running: Running,
    /// Signalled each time a handler's result is committed.
    finished: Arc<Notify>,
}

impl TaskRunner {
    pub fn new(state: State, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            state,
            registry,
            running: Arc::new(Mutex::new(HashMap::new())),
            finished: Arc::new(Notify::new()),
        }
    }

    /// Handlers currently executing.
    pub fn in_flight(&self) -> usize {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// One scheduling pass. Must be called within a tokio runtime.
    pub fn ensure(&self) -> Tick {
        let mut guard = self.state.lock();
        let now = Utc::now();
        let mut tick = Tick::default();

        tick.settled += fail_cycles(&mut guard);
        tick.settled += propagate_blocked(&mut guard);

        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        for id in runnable(guard.data(), &running) {
            let Some(task) = guard.task(id) else { continue };
            if let Some(at) = task.at_time()
                && at > now
            {
                tick.next_retry = Some(tick.next_retry.map_or(at, |next| next.min(at)));
                continue;
            }

            let kind = task.kind().clone();
            let Some(handler) = self.registry.get(&kind).cloned() else {
                warn!(task = %id, %kind, "no handler registered for task kind");
                if let Some(task) = guard.task_mut(id) {
                    task.errorf(Error::HandlerNotFound(kind).to_string());
                }
                set_status(&mut guard, id, Status::Error);
                tick.settled += 1;
                continue;
            };

            let ctx = TaskContext::new(self.state.clone(), task);
            set_status(&mut guard, id, Status::Doing);
            debug!(task = %id, %kind, "starting task");

            let state = self.state.clone();
            let tracked = Arc::clone(&self.running);
            let finished = Arc::clone(&self.finished);
            let join = tokio::spawn(async move {
                // Inner spawn turns a handler panic into a task failure.
                let result = match tokio::spawn(async move { handler.run(ctx).await }).await {
                    Ok(result) => result,
                    Err(e) => Err(Error::task(format!("handler panicked: {e}"))),
                };
                finish(&state, &tracked, id, result);
                finished.notify_waiters();
            });
            running.insert(id, join);
            tick.started += 1;
        }
        tick.in_flight = running.len();
        tick
    }

    /// Wait for every in-flight handler to finish.
    ///
    /// Handlers stay tracked until their result is committed, so a pass
    /// running concurrently never starts a task a second time.
    pub async fn wait(&self) {
        loop {
            let finished = self.finished.notified();
            tokio::pin!(finished);
            // Register before checking so a commit in between is not missed.
            finished.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            finished.await;
        }
    }
}

/// Fail every not-yet-finished task that lies on a dependency cycle.
fn fail_cycles(guard: &mut StateGuard<'_>) -> usize {
    let mut graph = DependencyGraph::new();
    for task in guard.tasks().filter(|t| is_schedulable(guard.data(), t.id())) {
        graph.add_node(task.id());
        for pre in task.wait_tasks() {
            if is_schedulable(guard.data(), *pre) {
                graph.add_dependency(task.id(), *pre);
            }
        }
    }
    let Some(cycle) = graph.detect_cycle() else {
        return 0;
    };

    let members: Vec<String> = cycle.iter().map(ToString::to_string).collect();
    let message = Error::Cycle(cycle.clone()).to_string();
    warn!(tasks = %members.join(", "), "dependency cycle detected");
    for id in &cycle {
        if let Some(task) = guard.task_mut(*id) {
            task.errorf(message.clone());
        }
        set_status(guard, *id, Status::Error);
    }
    cycle.len()
}

/// A task the runner may still act on: Do or Doing, owned by a change.
fn is_schedulable(data: &StateData, id: TaskId) -> bool {
    data.tasks
        .get(&id)
        .is_some_and(|t| t.change().is_some() && matches!(t.status(), Status::Do | Status::Doing))
}

/// Settle tasks that can never run because of a predecessor.
///
/// A predecessor in Error or Abort fails the task; a held predecessor holds
/// it. Repeated until nothing changes so whole chains settle in one pass.
fn propagate_blocked(guard: &mut StateGuard<'_>) -> usize {
    let mut settled = 0;
    loop {
        let mut updates: Vec<(TaskId, Status, String)> = Vec::new();
        for task in guard.tasks() {
            if task.status() != Status::Do || task.change().is_none() {
                continue;
            }
            let mut held = None;
            let mut failed = None;
            for pre in task.wait_tasks() {
                match guard.task(*pre).map(|p| p.status()) {
                    Some(status) if status.blocks_successors() => {
                        failed = Some((*pre, status));
                        break;
                    }
                    Some(Status::Hold) => held = held.or(Some(*pre)),
                    _ => {}
                }
            }
            if let Some((pre, status)) = failed {
                let verb = if status == Status::Abort { "was aborted" } else { "failed" };
                updates.push((task.id(), Status::Error, format!("{pre} {verb}")));
            } else if let Some(pre) = held {
                updates.push((task.id(), Status::Hold, format!("{pre} is on hold")));
            }
        }
        if updates.is_empty() {
            return settled;
        }
        for (id, status, reason) in updates {
            debug!(task = %id, %status, %reason, "not running task");
            if let Some(task) = guard.task_mut(id) {
                match status {
                    Status::Error => task.errorf(format!("cannot run: {reason}")),
                    _ => task.logf(format!("held: {reason}")),
                }
            }
            set_status(guard, id, status);
            settled += 1;
        }
    }
}

/// Tasks whose predecessors are all Done, by ascending id.
///
/// Includes tasks left in Doing without an in-flight handler, which happens
/// after a restart.
fn runnable(data: &StateData, running: &HashMap<TaskId, JoinHandle<()>>) -> Vec<TaskId> {
    data.tasks
        .values()
        .filter(|t| t.change().is_some())
        .filter(|t| match t.status() {
            Status::Do => true,
            Status::Doing => !running.contains_key(&t.id()),
            _ => false,
        })
        .filter(|t| {
            t.wait_tasks().iter().all(|pre| {
                data.tasks
                    .get(pre)
                    .is_some_and(|p| p.status() == Status::Done)
            })
        })
        .map(|t| t.id())
        .collect()
}

fn set_status(guard: &mut StateGuard<'_>, id: TaskId, status: Status) {
    let change = guard.task(id).and_then(|t| t.change());
    let was_ready = change
        .and_then(|c| guard.change(c))
        .is_some_and(|c| c.is_ready());

    if guard.set_status(id, status).is_err() {
        return;
    }

    if let Some(view) = change.and_then(|c| guard.change(c))
        && !was_ready
        && view.is_ready()
    {
        info!(change = %view.id(), status = %view.status(), summary = view.summary(), "change ready");
    }
}

/// Commit a handler's result.
fn finish(state: &State, running: &Running, id: TaskId, result: crate::error::Result<()>) {
    let mut guard = state.lock();
    let still_doing = guard
        .task(id)
        .is_some_and(|t| t.status() == Status::Doing);

    if still_doing {
        let ignore = guard.task(id).is_some_and(|t| t.ignore_error());
        match result {
            Ok(()) => {
                debug!(task = %id, "task done");
                set_status(&mut guard, id, Status::Done);
            }
            Err(Error::Retry(after)) => {
                let at = TimeDelta::from_std(after)
                    .ok()
                    .and_then(|delay| Utc::now().checked_add_signed(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                debug!(task = %id, ?after, "task asked to be retried");
                if let Some(task) = guard.task_mut(id) {
                    task.logf(format!("will retry in {after:?}"));
                    task.set_at_time(Some(at));
                }
                set_status(&mut guard, id, Status::Do);
            }
            Err(e) if ignore => {
                warn!(task = %id, error = %e, "ignoring task failure");
                if let Some(task) = guard.task_mut(id) {
                    task.logf(format!("ignoring failure: {e}"));
                }
                set_status(&mut guard, id, Status::Done);
            }
            Err(e) => {
                debug!(task = %id, error = %e, "task failed");
                if let Some(task) = guard.task_mut(id) {
                    task.errorf(e.to_string());
                }
                set_status(&mut guard, id, Status::Error);
            }
        }
    } else if let Err(e) = result {
        debug!(task = %id, error = %e, "discarding result of task that moved on");
    }

    running
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&id);
    drop(guard);
    state.wake();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskKind, TaskSet};
    use crate::error::Result;
    use crate::runner::handler::{Handler, handler_fn};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn registry_with(kind: &str, handler: Arc<dyn Handler>) -> Arc<HandlerRegistry> {
        let mut reg = HandlerRegistry::new();
        reg.register("test", TaskKind::new(kind), handler).unwrap();
        Arc::new(reg)
    }

    async fn drive(runner: &TaskRunner) {
        for _ in 0..100 {
            let tick = runner.ensure();
            if tick.is_quiet() {
                return;
            }
            runner.wait().await;
        }
        panic!("runner did not settle");
    }

    #[tokio::test]
    async fn runs_chain_in_order() {
        let st = State::new(None);
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let runner = TaskRunner::new(
            st.clone(),
            registry_with(
                "step",
                handler_fn(move |ctx: TaskContext| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().unwrap().push(ctx.id());
                        Ok(())
                    }
                }),
            ),
        );

        let (chg, a, b) = {
            let mut guard = st.lock();
            let chg = guard.new_change("k", "s");
            let a = guard.new_task("step", "a");
            let b = guard.new_task("step", "b");
            let mut set = TaskSet::new();
            set.chain(a, b);
            guard.add_all(chg, &set).unwrap();
            (chg, a, b)
        };

        drive(&runner).await;

        assert_eq!(*order.lock().unwrap(), vec![a, b]);
        let guard = st.lock();
        assert_eq!(guard.change(chg).unwrap().status(), Status::Done);
    }

    #[tokio::test]
    async fn unknown_kind_fails_task() {
        let st = State::new(None);
        let runner = TaskRunner::new(st.clone(), Arc::new(HandlerRegistry::new()));
        let (chg, t) = {
            let mut guard = st.lock();
            let chg = guard.new_change("k", "s");
            let t = guard.new_task("mystery", "t");
            guard.add_task(chg, t).unwrap();
            (chg, t)
        };

        let tick = runner.ensure();
        assert_eq!(tick.settled, 1);
        assert_eq!(tick.started, 0);

        let guard = st.lock();
        assert_eq!(guard.task(t).unwrap().status(), Status::Error);
        let err = guard.change(chg).unwrap().err().unwrap();
        assert!(err.to_string().contains("mystery"));
    }

    #[tokio::test]
    async fn cycle_fails_without_running() {
        let st = State::new(None);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let runner = TaskRunner::new(
            st.clone(),
            registry_with(
                "step",
                handler_fn(move |_ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                }),
            ),
        );
        let chg = {
            let mut guard = st.lock();
            let chg = guard.new_change("k", "s");
            let a = guard.new_task("step", "a");
            let b = guard.new_task("step", "b");
            let mut set = TaskSet::new();
            set.chain(a, b);
            set.chain(b, a);
            guard.add_all(chg, &set).unwrap();
            chg
        };

        drive(&runner).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let guard = st.lock();
        let view = guard.change(chg).unwrap();
        assert_eq!(view.status(), Status::Error);
        assert!(view.err().unwrap().to_string().contains("cycle"));
    }

    #[tokio::test]
    async fn retry_postpones_task() {
        let st = State::new(None);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let runner = TaskRunner::new(
            st.clone(),
            registry_with(
                "flaky",
                handler_fn(move |_ctx| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(Error::Retry(Duration::from_millis(20)))
                        } else {
                            Ok(())
                        }
                    }
                }),
            ),
        );
        let t = {
            let mut guard = st.lock();
            let chg = guard.new_change("k", "s");
            let t = guard.new_task("flaky", "t");
            guard.add_task(chg, t).unwrap();
            t
        };

        runner.ensure();
        runner.wait().await;

        let tick = runner.ensure();
        assert_eq!(tick.started, 0);
        assert!(tick.next_retry.is_some());
        assert_eq!(st.lock().task(t).unwrap().status(), Status::Do);

        tokio::time::sleep(Duration::from_millis(40)).await;
        drive(&runner).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(st.lock().task(t).unwrap().status(), Status::Done);
    }

    struct Panics;

    #[async_trait]
    impl Handler for Panics {
        async fn run(&self, _ctx: TaskContext) -> Result<()> {
            panic!("kaboom");
        }
    }

    #[tokio::test]
    async fn panicking_handler_fails_task() {
        let st = State::new(None);
        let runner = TaskRunner::new(st.clone(), registry_with("boom", Arc::new(Panics)));
        let t = {
            let mut guard = st.lock();
            let chg = guard.new_change("k", "s");
            let t = guard.new_task("boom", "t");
            guard.add_task(chg, t).unwrap();
            t
        };

        drive(&runner).await;

        let guard = st.lock();
        let task = guard.task(t).unwrap();
        assert_eq!(task.status(), Status::Error);
        assert!(task.last_error().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn held_predecessor_holds_successor() {
        let st = State::new(None);
        let runner = TaskRunner::new(st.clone(), registry_with("step", handler_fn(|_ctx| async { Ok(()) })));
        let (chg, b) = {
            let mut guard = st.lock();
            let chg = guard.new_change("k", "s");
            let a = guard.new_task("step", "a");
            let b = guard.new_task("step", "b");
            let mut set = TaskSet::new();
            set.chain(a, b);
            guard.add_all(chg, &set).unwrap();
            guard.set_status(a, Status::Hold).unwrap();
            (chg, b)
        };

        drive(&runner).await;

        let guard = st.lock();
        assert_eq!(guard.task(b).unwrap().status(), Status::Hold);
        let view = guard.change(chg).unwrap();
        assert_eq!(view.status(), Status::Hold);
        assert!(view.is_ready());
        assert!(view.err().is_none());
    }

    #[tokio::test]
    async fn far_future_retry_postpones_without_overflow() {
        let st = State::new(None);
        let runner = TaskRunner::new(
            st.clone(),
            registry_with(
                "later",
                handler_fn(|_ctx| async { Err(Error::Retry(Duration::MAX)) }),
            ),
        );
        let t = {
            let mut guard = st.lock();
            let chg = guard.new_change("k", "s");
            let t = guard.new_task("later", "t");
            guard.add_task(chg, t).unwrap();
            t
        };

        runner.ensure();
        runner.wait().await;

        let tick = runner.ensure();
        assert_eq!(tick.started, 0);
        assert_eq!(tick.next_retry, Some(DateTime::<Utc>::MAX_UTC));
        assert_eq!(st.lock().task(t).unwrap().status(), Status::Do);
    }

    #[tokio::test]
    async fn running_task_is_not_restarted_while_waited_on() {
        let st = State::new(None);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let runner = Arc::new(TaskRunner::new(
            st.clone(),
            registry_with(
                "slow",
                handler_fn(move |_ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    }
                }),
            ),
        ));
        let t = {
            let mut guard = st.lock();
            let chg = guard.new_change("k", "s");
            let t = guard.new_task("slow", "t");
            guard.add_task(chg, t).unwrap();
            t
        };

        assert_eq!(runner.ensure().started, 1);
        let waiter = tokio::spawn({
            let runner = Arc::clone(&runner);
            async move { runner.wait().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let tick = runner.ensure();
        assert_eq!(tick.started, 0);
        assert_eq!(tick.in_flight, 1);

        waiter.await.unwrap();
        assert_eq!(runner.in_flight(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(st.lock().task(t).unwrap().status(), Status::Done);
    }

    #[tokio::test]
    async fn resumes_task_left_doing() {
        let st = State::new(None);
        let runner = TaskRunner::new(st.clone(), registry_with("step", handler_fn(|_ctx| async { Ok(()) })));
        let t = {
            let mut guard = st.lock();
            let chg = guard.new_change("k", "s");
            let t = guard.new_task("step", "t");
            guard.add_task(chg, t).unwrap();
            guard.set_status(t, Status::Doing).unwrap();
            t
        };

        drive(&runner).await;

        assert_eq!(st.lock().task(t).unwrap().status(), Status::Done);
    }
}
