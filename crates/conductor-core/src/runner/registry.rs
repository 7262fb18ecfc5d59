//! HandlerRegistry - task kind と Handler の対応表
//!
//! # 学習ポイント
//! - HashMap で trait object（Arc<dyn Handler>）を管理
//! - 登録は起動時のみ、以降は読み取り専用で共有

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::handler::Handler;
use crate::domain::TaskKind;
use crate::error::{Error, Result};

struct Registered {
    manager: String,
    handler: Arc<dyn Handler>,
}

/// Registry of handlers (task kind -> owning manager and handler).
///
/// Design:
/// - Built during startup (mutable).
/// - Shared read-only by the runner afterwards, so no lock is needed.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Registered>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind` on behalf of `manager`.
    ///
    /// A kind can be owned by one manager only.
    pub fn register(
        &mut self,
        manager: &str,
        kind: TaskKind,
        handler: Arc<dyn Handler>,
    ) -> Result<()> {
        if let Some(existing) = self.handlers.get(&kind) {
            return Err(Error::DuplicateHandler {
                kind,
                existing: existing.manager.clone(),
            });
        }
        debug!(%kind, manager, "handler registered");
        self.handlers.insert(
            kind,
            Registered {
                manager: manager.to_string(),
                handler,
            },
        );
        Ok(())
    }

    pub fn get(&self, kind: &TaskKind) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(kind).map(|r| &r.handler)
    }

    /// Which of `expected` have no handler, sorted.
    pub fn missing<'a>(&self, expected: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut missing: Vec<String> = expected
            .into_iter()
            .filter(|kind| !self.handlers.contains_key(&TaskKind::new(*kind)))
            .map(str::to_string)
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }
}
