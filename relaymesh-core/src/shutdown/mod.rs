//! Graceful shutdown coordinator
//!
//! Background loops are spawned through [`ShutdownCoordinator::spawn`], which
//! races the loop against the shutdown broadcast and keeps the join handle so
//! that [`ShutdownCoordinator::shutdown`] can wait for them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shutdown signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
}

/// Shutdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

/// Owns the shutdown broadcast and the handles of registered tasks
pub struct ShutdownCoordinator {
    state: Arc<RwLock<ShutdownState>>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator that waits at most `timeout` for tasks to finish
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            state: Arc::new(RwLock::new(ShutdownState::Running)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            timeout,
        }
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a task that is cancelled when shutdown is signalled
    pub async fn spawn<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let mut shutdown_rx = self.subscribe();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            debug!(task = %task_name, "Background task started");
            tokio::select! {
                _ = task => {
                    debug!(task = %task_name, "Background task completed");
                }
                signal = shutdown_rx.recv() => {
                    match signal {
                        Ok(signal) => debug!(task = %task_name, ?signal, "Background task stopping"),
                        Err(e) => error!(task = %task_name, error = %e, "Shutdown channel error"),
                    }
                }
            }
        });

        self.register(name, handle).await;
    }

    /// Track an already spawned task
    pub async fn register(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.tasks.lock().await.push((name.into(), handle));
    }

    /// Number of tasks still tracked
    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Broadcast a graceful shutdown and wait for registered tasks
    ///
    /// Tasks still running when the timeout elapses are aborted.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write().await;
            if *state != ShutdownState::Running {
                warn!("Shutdown already in progress");
                return;
            }
            *state = ShutdownState::ShuttingDown;
        }
        info!("Initiating graceful shutdown");

        if self.shutdown_tx.send(ShutdownSignal::Graceful).is_err() {
            debug!("No subscribers for shutdown signal");
        }

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        let deadline = tokio::time::Instant::now() + self.timeout;
        for (name, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(task = %name, "Task joined"),
                Ok(Err(e)) => error!(task = %name, error = %e, "Task failed during shutdown"),
                Err(_) => {
                    warn!(task = %name, timeout = ?self.timeout, "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        *self.state.write().await = ShutdownState::Shutdown;
        info!("Shutdown complete");
    }

    /// Abort every registered task without waiting
    pub async fn shutdown_immediately(&self) {
        warn!("Initiating immediate shutdown");
        *self.state.write().await = ShutdownState::Shutdown;

        let _ = self.shutdown_tx.send(ShutdownSignal::Immediate);
        for (_, handle) in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
    }

    pub async fn is_shutting_down(&self) -> bool {
        *self.state.read().await != ShutdownState::Running
    }

    pub async fn state(&self) -> ShutdownState {
        *self.state.read().await
    }
}

/// Wait for SIGINT or SIGTERM
#[cfg(unix)]
pub async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
    }
}

/// Wait for Ctrl+C
#[cfg(not(unix))]
pub async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }
    info!("Received Ctrl+C");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_shutdown_stops_spawned_tasks() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        assert_eq!(coordinator.state().await, ShutdownState::Running);

        coordinator
            .spawn("sleeper", async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .await;
        assert_eq!(coordinator.task_count().await, 1);

        coordinator.shutdown().await;

        assert_eq!(coordinator.state().await, ShutdownState::Shutdown);
        assert_eq!(coordinator.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_registered_task_sees_signal() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let stopped = Arc::new(AtomicBool::new(false));

        let mut rx = coordinator.subscribe();
        let flag = stopped.clone();
        let handle = tokio::spawn(async move {
            let _ = rx.recv().await;
            flag.store(true, Ordering::SeqCst);
        });
        coordinator.register("listener", handle).await;

        coordinator.shutdown().await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_second_shutdown_is_noop() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        coordinator.shutdown().await;
        coordinator.shutdown().await;
        assert!(coordinator.is_shutting_down().await);
    }

    #[tokio::test]
    async fn test_stuck_task_is_aborted() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        coordinator.register("stuck", handle).await;

        coordinator.shutdown().await;
        assert_eq!(coordinator.state().await, ShutdownState::Shutdown);
    }
}
