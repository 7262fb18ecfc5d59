use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::TaskKind;
use crate::error::Result;
use crate::runner::Handler;

/// A component owning the handlers for a set of task kinds.
///
/// Managers are handed to the [`OverlordBuilder`] once at startup; there is
/// no registration after the overlord is built.
///
/// [`OverlordBuilder`]: super::OverlordBuilder
#[async_trait]
pub trait Manager: Send + Sync {
    /// Short name used in logs and duplicate-registration errors.
    fn name(&self) -> &str;

    /// The task kinds this manager executes, with their handlers.
    fn handlers(&self) -> Vec<(TaskKind, Arc<dyn Handler>)>;

    /// Periodic work unrelated to any single task, run once per pass.
    async fn ensure(&self) -> Result<()> {
        Ok(())
    }
}
