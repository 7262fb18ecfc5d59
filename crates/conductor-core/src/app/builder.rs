//! OverlordBuilder - Manager の登録と Overlord の構築
//!
//! # 学習ポイント
//! - Builder パターン（add_manager / expect_kinds / config）
//! - 起動時検証: 同じ task kind を二つの Manager が持てない
//! - 期待する kind が揃っていなければ build() が失敗する

use std::sync::Arc;

use tracing::info;

use super::manager::Manager;
use super::overlord::Overlord;
use crate::config::OverlordConfig;
use crate::error::{Error, Result};
use crate::runner::HandlerRegistry;
use crate::state::State;

/// Collects managers and validates their handler tables.
///
/// # Example
/// ```ignore
/// let overlord = OverlordBuilder::new(state)
///     .add_manager(hook_manager)
///     .add_manager(config_manager)
///     .expect_kinds(&["run-hook", "configure-snapd"])
///     .build()?;
/// ```
///
/// `build()` fails if two managers claim the same kind, or if any expected
/// kind ends up without a handler.
pub struct OverlordBuilder {
    state: State,
    managers: Vec<Arc<dyn Manager>>,
    expected_kinds: Option<Vec<String>>,
    config: OverlordConfig,
}

impl OverlordBuilder {
    pub fn new(state: State) -> Self {
        Self {
            state,
            managers: Vec::new(),
            expected_kinds: None,
            config: OverlordConfig::default(),
        }
    }

    pub fn add_manager(mut self, manager: Arc<dyn Manager>) -> Self {
        self.managers.push(manager);
        self
    }

    pub fn expect_kinds(mut self, kinds: &[&str]) -> Self {
        self.expected_kinds = Some(kinds.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn config(mut self, config: OverlordConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Overlord> {
        let mut registry = HandlerRegistry::new();
        for manager in &self.managers {
            for (kind, handler) in manager.handlers() {
                registry.register(manager.name(), kind, handler)?;
            }
        }

        if let Some(expected) = &self.expected_kinds {
            let missing = registry.missing(expected.iter().map(String::as_str));
            if !missing.is_empty() {
                return Err(Error::MissingKinds(missing));
            }
        }

        info!(
            managers = self.managers.len(),
            kinds = registry.len(),
            "overlord ready"
        );
        Ok(Overlord::new(
            self.state,
            self.managers,
            registry,
            self.config,
        ))
    }
}
