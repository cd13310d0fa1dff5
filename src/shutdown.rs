//! Graceful shutdown for flexblock processes.
//!
//! Every long-running loop (servers, heartbeat, health sweep, rebuild worker,
//! metrics aggregation) takes a broadcast receiver from the coordinator and
//! exits when it fires. The coordinator then waits a bounded time for the
//! spawned tasks to finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Maximum time to wait for tasks to finish after shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Fans a single shutdown signal out to every task.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    shutdown_watch: watch::Receiver<bool>,
    shutdown_watch_tx: Arc<watch::Sender<bool>>,
    is_shutting_down: Arc<AtomicBool>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (shutdown_watch_tx, shutdown_watch) = watch::channel(false);

        Self {
            shutdown_tx,
            shutdown_watch,
            shutdown_watch_tx: Arc::new(shutdown_watch_tx),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    /// Receiver for a task's select loop.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// The underlying sender, for components that subscribe several tasks.
    pub fn sender(&self) -> &broadcast::Sender<()> {
        &self.shutdown_tx
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate shutdown. Later calls are no-ops.
    pub fn shutdown(&self) {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Initiating graceful shutdown");
            let _ = self.shutdown_watch_tx.send(true);
            let _ = self.shutdown_tx.send(());
        }
    }

    /// Resolve once shutdown has been initiated.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_watch.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for `tasks` to finish, giving up after the shutdown timeout.
    pub async fn drain(&self, tasks: Vec<JoinHandle<()>>) {
        let count = tasks.len();
        let all = futures::future::join_all(tasks);
        match tokio::time::timeout(self.timeout, all).await {
            Ok(results) => {
                let panicked = results.iter().filter(|r| r.is_err()).count();
                if panicked > 0 {
                    warn!(panicked, "Tasks ended abnormally during shutdown");
                }
                info!(tasks = count, "All tasks stopped");
            }
            Err(_) => error!(timeout = ?self.timeout, "Shutdown timed out"),
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns OS signals into a coordinator shutdown.
pub struct SignalHandler {
    coordinator: ShutdownCoordinator,
}

impl SignalHandler {
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        Self { coordinator }
    }

    /// Wait for SIGTERM or SIGINT, then shut down.
    #[cfg(unix)]
    pub async fn run(self) {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = self.coordinator.wait_for_shutdown() => return,
        }

        self.coordinator.shutdown();
    }

    #[cfg(not(unix))]
    pub async fn run(self) {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for Ctrl+C");
                    return;
                }
                info!("Received Ctrl+C");
            }
            _ = self.coordinator.wait_for_shutdown() => return,
        }
        self.coordinator.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutting_down());
        coordinator.shutdown();
        coordinator.shutdown();
        assert!(coordinator.is_shutting_down());
    }

    #[tokio::test]
    async fn test_subscribers_receive_signal() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();

        coordinator.shutdown();

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_after_signal() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.shutdown();
        tokio::time::timeout(Duration::from_millis(100), coordinator.wait_for_shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_waits_for_tasks() {
        let coordinator = ShutdownCoordinator::with_timeout(Duration::from_secs(1));
        let mut rx = coordinator.subscribe();
        let task = tokio::spawn(async move {
            let _ = rx.recv().await;
        });

        coordinator.shutdown();
        coordinator.drain(vec![task]).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_timeout() {
        let coordinator = ShutdownCoordinator::with_timeout(Duration::from_secs(1));
        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        coordinator.shutdown();
        coordinator.drain(vec![stuck]).await;
    }
}
