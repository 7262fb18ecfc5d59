//! Overlord - State, Manager, TaskRunner を束ねる
//!
//! # 設計
//! - settle(): 進捗がなくなるまでパスを繰り返す。パスの合間は State の変更通知で待つ
//! - run(): バックグラウンドループを起動し、stop() で止める
//! - prune(): 設定に従って古い Change を片付ける
//!
//! # 学習ポイント
//! - tokio::select! による「通知 or タイムアウト」待ち
//! - Instant::checked_add で表現できない期限を扱う

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::manager::Manager;
use super::run_loop::RunLoop;
use crate::config::OverlordConfig;
use crate::error::{Error, Result};
use crate::runner::{HandlerRegistry, TaskRunner, Tick};
use crate::state::{PruneReport, State};

/// Everything one pass needs; shared with the background loop.
pub(crate) struct Engine {
    pub(crate) state: State,
    pub(crate) managers: Vec<Arc<dyn Manager>>,
    pub(crate) runner: TaskRunner,
    pub(crate) config: OverlordConfig,
}

impl Engine {
    /// Run every manager's ensure, then one scheduling pass.
    pub(crate) async fn ensure_once(&self) -> Tick {
        for manager in &self.managers {
            if let Err(e) = manager.ensure().await {
                warn!(manager = manager.name(), error = %e, "ensure failed");
            }
        }
        self.runner.ensure()
    }

    /// How long to sleep after `tick` when nothing signals a change.
    pub(crate) fn idle_wait(&self, tick: &Tick, cap: Duration) -> Duration {
        let mut wait = cap.min(self.config.ensure_interval());
        if let Some(at) = tick.next_retry {
            let until = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            wait = wait.min(until);
        }
        wait
    }

    pub(crate) fn prune(&self) -> PruneReport {
        let mut guard = self.state.lock();
        guard.prune(Utc::now(), &self.config.prune_options())
    }
}

/// Drives managers to completion over a shared [`State`].
///
/// Use [`Overlord::settle`] to run work to quiescence synchronously, or
/// [`Overlord::run`] / [`Overlord::stop`] for a long-lived background loop.
/// The two are mutually exclusive.
pub struct Overlord {
    engine: Arc<Engine>,
    run_loop: Mutex<Option<RunLoop>>,
}

impl Overlord {
    pub(crate) fn new(
        state: State,
        managers: Vec<Arc<dyn Manager>>,
        registry: HandlerRegistry,
        config: OverlordConfig,
    ) -> Self {
        let runner = TaskRunner::new(state.clone(), Arc::new(registry));
        Self {
            engine: Arc::new(Engine {
                state,
                managers,
                runner,
                config,
            }),
            run_loop: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &State {
        &self.engine.state
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.engine.runner
    }

    pub fn config(&self) -> &OverlordConfig {
        &self.engine.config
    }

    /// A single pass: managers' ensure plus one runner pass.
    pub async fn ensure(&self) -> Tick {
        self.engine.ensure_once().await
    }

    /// Run passes until one makes no progress, or `timeout` elapses.
    ///
    /// Waits between passes on the state's change signal rather than
    /// polling. A timeout says nothing about the outcome of any change;
    /// callers still inspect the changes they care about.
    pub async fn settle(&self, timeout: Duration) -> Result<()> {
        if self.is_running() {
            return Err(Error::Other(
                "cannot settle while the background loop is running".to_string(),
            ));
        }

        // None when the timeout reaches past what the clock can represent.
        let deadline = Instant::now().checked_add(timeout);
        let mut passes = 0usize;
        loop {
            let tick = self.engine.ensure_once().await;
            passes += 1;
            if tick.is_quiet() {
                debug!(passes, "settled");
                return Ok(());
            }

            let now = Instant::now();
            let remaining = match deadline {
                Some(deadline) if now >= deadline => return Err(Error::SettleTimeout(timeout)),
                Some(deadline) => deadline - now,
                None => Duration::MAX,
            };
            let wait = self.engine.idle_wait(&tick, remaining);
            tokio::select! {
                _ = self.engine.state.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Start the background loop. Calling it twice is a no-op.
    pub fn run(&self) {
        let mut slot = self.run_loop.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(RunLoop::spawn(Arc::clone(&self.engine)));
        }
    }

    pub fn is_running(&self) -> bool {
        self.run_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Stop the background loop and wait for in-flight handlers.
    pub async fn stop(&self) {
        let run_loop = self
            .run_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(run_loop) = run_loop {
            run_loop.shutdown_and_join().await;
        }
        self.engine.runner.wait().await;
    }

    /// Remove settled changes past their retention window.
    pub fn prune(&self) -> PruneReport {
        self.engine.prune()
    }
}
