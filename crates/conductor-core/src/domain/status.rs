//! Task and change status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a task; a change's status is derived from its tasks.
///
/// Do-path transitions driven by the runner:
/// - Do -> Doing -> Done
/// - Do -> Doing -> Error
/// - Do -> Doing -> Do (handler asked for a retry)
/// - Do -> Error (a predecessor failed, or the graph is invalid)
/// - Do -> Abort (the change was aborted before the task started)
/// - Do -> Hold (a predecessor is held)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Do,
    Doing,
    Done,
    Error,
    Wait,
    Hold,
    Undo,
    Undoing,
    Undone,
    Abort,
}

impl Status {
    /// Nothing further will happen to a task in this status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Done | Status::Error | Status::Hold | Status::Undone | Status::Abort
        )
    }

    /// A successor of a task in this status can never become runnable.
    pub fn blocks_successors(self) -> bool {
        matches!(self, Status::Error | Status::Abort)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Do => "Do",
            Status::Doing => "Doing",
            Status::Done => "Done",
            Status::Error => "Error",
            Status::Wait => "Wait",
            Status::Hold => "Hold",
            Status::Undo => "Undo",
            Status::Undoing => "Undoing",
            Status::Undone => "Undone",
            Status::Abort => "Abort",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate the statuses of a change's tasks.
///
/// Anything still pending keeps the change in progress. Once nothing is
/// pending, failures take precedence: Error > Abort > Hold > Undone > Done.
pub fn aggregate<I: IntoIterator<Item = Status>>(statuses: I) -> Status {
    let mut seen = StatusCounts::default();
    for status in statuses {
        seen.add(status);
    }

    if seen.total() == 0 {
        return Status::Done;
    }
    if seen.doing + seen.undo + seen.undoing > 0 {
        return Status::Doing;
    }
    if seen.do_ > 0 {
        return if seen.do_ == seen.total() {
            Status::Do
        } else {
            Status::Doing
        };
    }
    if seen.wait > 0 {
        return Status::Wait;
    }
    if seen.error > 0 {
        return Status::Error;
    }
    if seen.abort > 0 {
        return Status::Abort;
    }
    if seen.hold > 0 {
        return Status::Hold;
    }
    if seen.undone > 0 {
        return Status::Undone;
    }
    Status::Done
}

/// Number of tasks in each status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    #[serde(rename = "do")]
    pub do_: usize,
    pub doing: usize,
    pub done: usize,
    pub error: usize,
    pub wait: usize,
    pub hold: usize,
    pub undo: usize,
    pub undoing: usize,
    pub undone: usize,
    pub abort: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: Status) {
        let slot = match status {
            Status::Do => &mut self.do_,
            Status::Doing => &mut self.doing,
            Status::Done => &mut self.done,
            Status::Error => &mut self.error,
            Status::Wait => &mut self.wait,
            Status::Hold => &mut self.hold,
            Status::Undo => &mut self.undo,
            Status::Undoing => &mut self.undoing,
            Status::Undone => &mut self.undone,
            Status::Abort => &mut self.abort,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.do_
            + self.doing
            + self.done
            + self.error
            + self.wait
            + self.hold
            + self.undo
            + self.undoing
            + self.undone
            + self.abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_change_is_done() {
        assert_eq!(aggregate([]), Status::Done);
    }

    #[test]
    fn all_do_stays_do() {
        assert_eq!(aggregate([Status::Do, Status::Do]), Status::Do);
    }

    #[rstest]
    #[case::doing(&[Status::Done, Status::Doing], Status::Doing)]
    #[case::partly_started(&[Status::Done, Status::Do], Status::Doing)]
    #[case::error_with_pending(&[Status::Error, Status::Do], Status::Doing)]
    #[case::all_done(&[Status::Done, Status::Done], Status::Done)]
    #[case::error(&[Status::Done, Status::Error], Status::Error)]
    #[case::error_beats_abort(&[Status::Abort, Status::Error], Status::Error)]
    #[case::abort(&[Status::Done, Status::Abort], Status::Abort)]
    #[case::hold(&[Status::Done, Status::Hold], Status::Hold)]
    #[case::wait(&[Status::Wait, Status::Error], Status::Wait)]
    #[case::undone(&[Status::Undone, Status::Done], Status::Undone)]
    fn aggregate_statuses(#[case] statuses: &[Status], #[case] expected: Status) {
        assert_eq!(aggregate(statuses.iter().copied()), expected);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Status::Doing).unwrap(), "\"doing\"");
    }

    #[test]
    fn counts_add_up() {
        let mut counts = StatusCounts::default();
        counts.add(Status::Do);
        counts.add(Status::Error);
        counts.add(Status::Error);
        assert_eq!(counts.error, 2);
        assert_eq!(counts.total(), 3);
    }
}
