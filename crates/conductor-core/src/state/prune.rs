//! Garbage collection of settled changes.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info};

use super::StateGuard;
use crate::domain::{ChangeId, TaskId};

/// Retention policy applied by [`StateGuard::prune`].
#[derive(Debug, Clone)]
pub struct PruneOptions {
    /// Ready changes are kept at least this long after becoming ready.
    pub wait: TimeDelta,
    /// Changes still not ready after this long are aborted.
    pub abort_wait: TimeDelta,
    /// Oldest ready changes beyond this count are removed early.
    pub max_ready_changes: usize,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            wait: TimeDelta::hours(24),
            abort_wait: TimeDelta::days(7),
            max_ready_changes: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed_changes: Vec<ChangeId>,
    pub aborted_changes: Vec<ChangeId>,
    pub removed_tasks: usize,
}

/// Whether `wait` has elapsed since `since`. A wait past the end of time never
/// elapses.
fn passed(since: DateTime<Utc>, wait: TimeDelta, now: DateTime<Utc>) -> bool {
    since.checked_add_signed(wait).is_some_and(|t| t <= now)
}

impl StateGuard<'_> {
    /// Remove long-settled changes with their tasks and abort stale ones.
    pub fn prune(&mut self, now: DateTime<Utc>, opts: &PruneOptions) -> PruneReport {
        let mut report = PruneReport::default();
        let mut ready: Vec<(DateTime<Utc>, ChangeId)> = Vec::new();

        for view in self.changes() {
            if view.is_ready() {
                let since = view.ready_time().unwrap_or_else(|| view.spawn_time());
                if passed(since, opts.wait, now) {
                    report.removed_changes.push(view.id());
                } else {
                    ready.push((since, view.id()));
                }
            } else if passed(view.spawn_time(), opts.abort_wait, now) {
                report.aborted_changes.push(view.id());
            }
        }

        if ready.len() > opts.max_ready_changes {
            ready.sort();
            let excess = ready.len() - opts.max_ready_changes;
            report
                .removed_changes
                .extend(ready.iter().take(excess).map(|(_, id)| *id));
        }

        for id in &report.aborted_changes {
            if let Err(e) = self.abort_change(*id) {
                debug!(change = %id, error = %e, "cannot abort stale change");
            }
        }

        let mut doomed: BTreeSet<TaskId> = BTreeSet::new();
        {
            let data = self.data();
            for id in &report.removed_changes {
                if let Some(change) = data.changes.get(id) {
                    doomed.extend(change.task_ids().iter().copied());
                }
            }
            doomed.extend(
                data.tasks
                    .values()
                    .filter(|t| t.change().is_none() && passed(t.spawn_time(), opts.wait, now))
                    .map(|t| t.id()),
            );
        }

        if !report.removed_changes.is_empty() || !doomed.is_empty() {
            let data = self.data_mut();
            for id in &report.removed_changes {
                data.changes.remove(id);
            }
            data.remove_tasks(&doomed);
        }
        report.removed_tasks = doomed.len();

        if report.removed_changes.is_empty() && report.aborted_changes.is_empty() {
            debug!(removed_tasks = report.removed_tasks, "prune found nothing to do");
        } else {
            info!(
                removed = report.removed_changes.len(),
                aborted = report.aborted_changes.len(),
                removed_tasks = report.removed_tasks,
                "pruned changes"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Status, TaskSet};
    use crate::state::State;

    fn ready_change(st: &State) -> (ChangeId, TaskId) {
        let mut guard = st.lock();
        let chg = guard.new_change("k", "s");
        let t = guard.new_task("k", "t");
        guard.add_all(chg, &TaskSet::from_tasks([t])).unwrap();
        guard.set_status(t, Status::Done).unwrap();
        (chg, t)
    }

    #[test]
    fn keeps_recent_ready_changes() {
        let st = State::new(None);
        let (chg, _) = ready_change(&st);
        let mut guard = st.lock();
        let report = guard.prune(Utc::now(), &PruneOptions::default());
        assert!(report.removed_changes.is_empty());
        assert!(guard.change(chg).is_some());
    }

    #[test]
    fn removes_old_ready_changes_with_tasks() {
        let st = State::new(None);
        let (chg, t) = ready_change(&st);
        let mut guard = st.lock();
        let later = Utc::now() + TimeDelta::hours(25);
        let report = guard.prune(later, &PruneOptions::default());
        assert_eq!(report.removed_changes, vec![chg]);
        assert_eq!(report.removed_tasks, 1);
        assert!(guard.change(chg).is_none());
        assert!(guard.task(t).is_none());
    }

    #[test]
    fn aborts_stale_pending_changes() {
        let st = State::new(None);
        let (chg, t) = {
            let mut guard = st.lock();
            let chg = guard.new_change("k", "s");
            let t = guard.new_task("k", "t");
            guard.add_task(chg, t).unwrap();
            (chg, t)
        };
        let mut guard = st.lock();
        let report = guard.prune(Utc::now() + TimeDelta::days(8), &PruneOptions::default());
        assert_eq!(report.aborted_changes, vec![chg]);
        assert_eq!(guard.task(t).unwrap().status(), Status::Abort);
    }

    #[test]
    fn caps_number_of_ready_changes() {
        let st = State::new(None);
        let (first, _) = ready_change(&st);
        let (second, _) = ready_change(&st);
        let opts = PruneOptions {
            max_ready_changes: 1,
            ..PruneOptions::default()
        };
        let mut guard = st.lock();
        let report = guard.prune(Utc::now(), &opts);
        assert_eq!(report.removed_changes, vec![first]);
        assert!(guard.change(second).is_some());
    }

    #[test]
    fn removes_old_detached_tasks() {
        let st = State::new(None);
        let t = st.lock().new_task("k", "orphan");
        let mut guard = st.lock();
        guard.prune(Utc::now() + TimeDelta::hours(25), &PruneOptions::default());
        assert!(guard.task(t).is_none());
    }

    #[test]
    fn unbounded_waits_keep_everything() {
        let st = State::new(None);
        let (done, _) = ready_change(&st);
        let (pending, t) = {
            let mut guard = st.lock();
            let chg = guard.new_change("k", "s");
            let t = guard.new_task("k", "t");
            guard.add_task(chg, t).unwrap();
            (chg, t)
        };
        let opts = PruneOptions {
            wait: TimeDelta::MAX,
            abort_wait: TimeDelta::MAX,
            ..PruneOptions::default()
        };
        let mut guard = st.lock();
        let report = guard.prune(Utc::now() + TimeDelta::days(365), &opts);
        assert!(report.removed_changes.is_empty());
        assert!(report.aborted_changes.is_empty());
        assert!(guard.change(done).is_some());
        assert!(guard.change(pending).is_some());
        assert_eq!(guard.task(t).unwrap().status(), Status::Do);
    }
}
