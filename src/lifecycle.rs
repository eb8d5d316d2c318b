use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

/// Process-wide shutdown flag. Set once; every loop re-checks it after each
/// suspension point, so shutdown latency is bounded by the longest sleep in
/// use.
#[derive(Default)]
pub struct Lifecycle {
    stop: AtomicBool,
    notify: Notify,
}

pub type SharedLifecycle = Arc<Lifecycle>;

impl Lifecycle {
    pub fn new() -> SharedLifecycle {
        Arc::new(Self::default())
    }

    /// Idempotent: later calls are no-ops.
    pub fn shutdown(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            info!("shutdown requested");
            self.notify.notify_waiters();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait_shutdown(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_shutdown() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep that wakes early on shutdown. Returns true when shutdown was
    /// requested, so call sites read as `if life.sleep_unless_shutdown(..)`.
    pub async fn sleep_unless_shutdown(&self, dur: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => {}
            _ = self.wait_shutdown() => {}
        }
        self.is_shutdown()
    }
}

/// Wire SIGINT/SIGTERM to the shutdown flag. Spawned once per process.
pub fn spawn_signal_handler(life: SharedLifecycle) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    life.shutdown();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("SIGINT received"),
                _ = term.recv() => info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("SIGINT received");
        }
        life.shutdown();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_is_idempotent() {
        let life = Lifecycle::new();
        assert!(!life.is_shutdown());
        life.shutdown();
        life.shutdown();
        assert!(life.is_shutdown());
    }

    #[tokio::test]
    async fn wait_returns_after_shutdown() {
        let life = Lifecycle::new();
        let waiter = {
            let life = life.clone();
            tokio::spawn(async move { life.wait_shutdown().await })
        };
        life.shutdown();
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_cut_short_by_shutdown() {
        let life = Lifecycle::new();
        let handle = {
            let life = life.clone();
            tokio::spawn(async move {
                life.sleep_unless_shutdown(Duration::from_secs(3600)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        life.shutdown();
        assert!(handle.await.unwrap());
    }
}
