//! Domain model: ids, statuses, tasks, changes, task sets.

pub mod change;
pub mod ids;
pub mod status;
pub mod task;
pub mod task_set;

pub use change::{Change, ChangeError, ChangeView, TaskFailure, is_ready_status};
pub use ids::{ChangeId, TaskId};
pub use status::{Status, StatusCounts};
pub use task::{LogEntry, LogLevel, Task, TaskData, TaskKind};
pub use task_set::TaskSet;
