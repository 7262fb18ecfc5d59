//! RunLoop - ensure と prune を周期的に回すバックグラウンドループ
//!
//! # 学習ポイント
//! - watch チャネルによる shutdown 通知
//! - JoinHandle を保持して停止時に join する

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::overlord::Engine;

/// Background loop handle.
/// - `request_shutdown()` makes the loop exit at its next wake-up
/// - `shutdown_and_join()` also waits for it
pub(crate) struct RunLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl RunLoop {
    pub(crate) fn spawn(engine: Arc<Engine>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_loop(engine, shutdown_rx));
        info!("background loop started");
        Self { shutdown_tx, join }
    }

    /// Does not cancel running handlers; it only stops new passes.
    pub(crate) fn request_shutdown(&self) {
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub(crate) async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
        info!("background loop stopped");
    }
}

async fn run_loop(engine: Arc<Engine>, mut shutdown_rx: watch::Receiver<bool>) {
    let prune_every = engine.config.prune_interval();
    let mut last_prune: Option<Instant> = None;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let tick = engine.ensure_once().await;

        if last_prune.is_none_or(|at| at.elapsed() >= prune_every) {
            engine.prune();
            last_prune = Some(Instant::now());
        }

        let wait = engine.idle_wait(&tick, prune_every);
        debug!(?tick, ?wait, "pass done");
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender dropped along with the overlord
                if changed.is_err() {
                    break;
                }
            }
            _ = engine.state.changed() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
