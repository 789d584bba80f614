use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    signal,
    sync::{Mutex as TokioMutex, broadcast, mpsc, watch},
    time::timeout,
};

/// Represents different shutdown reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Graceful shutdown requested (SIGTERM, SIGINT)
    Graceful,
    /// Force shutdown (channel closed or lagged)
    Force,
}

#[derive(Debug, Default, Clone, Copy)]
struct LockState {
    shutting_down: bool,
    held: usize,
}

/// Process-wide two-stage shutdown coordinator.
///
/// Stage one broadcasts the shutdown to background participants (file watchers,
/// backend monitors) and waits for them to finish. Independently, critical sections
/// such as writing the inventory file take a [`ShutdownLock`], which is only granted
/// while shutdown has not started. Every wait is bounded by the shutdown timeout.
pub struct GracefulShutdown {
    /// Broadcast sender for shutdown signals
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    /// Flag indicating if shutdown has been initiated
    shutdown_initiated: Arc<AtomicBool>,
    /// Maximum time for each bounded wait
    shutdown_timeout: Duration,
    /// Advisory lock bookkeeping; the shutdown flag lives here too so granting
    /// and refusing a lock is atomic with initiating shutdown
    locks: Arc<watch::Sender<LockState>>,
    /// Cloned into every first-stage participant; dropped when stage one is awaited
    first_stage_tx: Mutex<Option<mpsc::Sender<()>>>,
    first_stage_rx: TokioMutex<mpsc::Receiver<()>>,
}

impl GracefulShutdown {
    /// Create a new GracefulShutdown manager with the default one-second timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(1))
    }

    /// Create a new GracefulShutdown manager with custom timeout
    pub fn with_timeout(shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        let (locks, _) = watch::channel(LockState::default());
        let (first_stage_tx, first_stage_rx) = mpsc::channel(1);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            shutdown_timeout,
            locks: Arc::new(locks),
            first_stage_tx: Mutex::new(Some(first_stage_tx)),
            first_stage_rx: TokioMutex::new(first_stage_rx),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Get a receiver for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Initiate shutdown. Returns `false` if it was already under way.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) -> bool {
        let initiated = self.locks.send_if_modified(|state| {
            if state.shutting_down {
                false
            } else {
                state.shutting_down = true;
                true
            }
        });
        if !initiated {
            tracing::warn!("Shutdown already initiated, ignoring {:?}", reason);
            return false;
        }

        self.shutdown_initiated.store(true, Ordering::Release);
        tracing::info!("Shutdown triggered: {:?}", reason);
        // No receivers simply means nobody is listening yet
        let _ = self.shutdown_tx.send(reason);
        true
    }

    /// Listen for OS signals and initiate a graceful shutdown on the first one.
    pub async fn run_signal_handler(&self) {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Unable to listen for SIGINT: {}", e);
                    return;
                }
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = wait_for_sigterm() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        self.trigger_shutdown(ShutdownReason::Graceful);
    }

    /// Wait indefinitely for shutdown signal (used in main application loop)
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        self.shutdown_token().wait_for_shutdown().await
    }

    /// Create a shutdown token that can be used to cancel operations
    pub fn shutdown_token(&self) -> ShutdownToken {
        ShutdownToken {
            receiver: self.subscribe(),
            shutdown_initiated: self.shutdown_initiated.clone(),
        }
    }

    /// Register a first-stage participant. Stage one completes once every
    /// returned handle has been dropped.
    pub fn first_stage(&self) -> FirstStage {
        let done = self
            .first_stage_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        FirstStage {
            token: self.shutdown_token(),
            _done: done,
        }
    }

    /// Wait for every first-stage participant to finish. Returns `false` if the
    /// shutdown timeout elapsed first.
    pub async fn wait_for_first_stage(&self) -> bool {
        drop(
            self.first_stage_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let mut rx = self.first_stage_rx.lock().await;
        match timeout(self.shutdown_timeout, rx.recv()).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(
                    "First shutdown stage did not finish within {:?}",
                    self.shutdown_timeout
                );
                false
            }
        }
    }

    /// Try to enter a critical section that must not be interrupted by shutdown.
    ///
    /// Never blocks: returns `None` once shutdown has been initiated.
    pub fn try_lock(&self) -> Option<ShutdownLock> {
        let granted = self.locks.send_if_modified(|state| {
            if state.shutting_down {
                false
            } else {
                state.held += 1;
                true
            }
        });
        granted.then(|| ShutdownLock {
            locks: self.locks.clone(),
        })
    }

    /// Wait until every granted [`ShutdownLock`] is released. Returns `false` if
    /// the shutdown timeout elapsed first.
    pub async fn wait_for_locks(&self) -> bool {
        let mut rx = self.locks.subscribe();
        match timeout(self.shutdown_timeout, rx.wait_for(|state| state.held == 0)).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(
                    "Shutdown locks still held after {:?}, continuing",
                    self.shutdown_timeout
                );
                false
            }
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!("Unable to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix systems, we only have Ctrl+C
    std::future::pending::<()>().await;
}

/// Permit for a critical section, released on drop.
#[must_use = "the lock is released as soon as it is dropped"]
pub struct ShutdownLock {
    locks: Arc<watch::Sender<LockState>>,
}

impl Drop for ShutdownLock {
    fn drop(&mut self) {
        self.locks.send_modify(|state| state.held -= 1);
    }
}

/// Handle held by a first-stage participant until it has stopped.
pub struct FirstStage {
    token: ShutdownToken,
    _done: Option<mpsc::Sender<()>>,
}

impl FirstStage {
    /// Resolves when shutdown starts. Drop the handle afterwards to acknowledge.
    pub async fn wait(&mut self) -> ShutdownReason {
        self.token.wait_for_shutdown().await
    }
}

/// A token that can be used to check for shutdown signals
pub struct ShutdownToken {
    receiver: broadcast::Receiver<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl Clone for ShutdownToken {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.resubscribe(),
            shutdown_initiated: self.shutdown_initiated.clone(),
        }
    }
}

impl ShutdownToken {
    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Wait for shutdown signal. Returns at once if shutdown already started.
    pub async fn wait_for_shutdown(&mut self) -> ShutdownReason {
        if self.is_shutdown_initiated() {
            return ShutdownReason::Graceful;
        }
        match self.receiver.recv().await {
            Ok(reason) => reason,
            Err(_) => ShutdownReason::Force,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::sleep;

    use super::*;

    #[tokio::test]
    async fn test_manual_trigger_shutdown() {
        let shutdown = GracefulShutdown::new();
        let mut receiver = shutdown.subscribe();
        assert!(!shutdown.is_shutdown_initiated());

        assert!(shutdown.trigger_shutdown(ShutdownReason::Graceful));
        assert!(shutdown.is_shutdown_initiated());
        assert_eq!(receiver.try_recv().unwrap(), ShutdownReason::Graceful);

        // Second trigger is ignored
        assert!(!shutdown.trigger_shutdown(ShutdownReason::Force));
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_token_created_after_trigger_still_fires() {
        let shutdown = GracefulShutdown::new();
        shutdown.trigger_shutdown(ShutdownReason::Graceful);

        let mut token = shutdown.shutdown_token();
        assert!(token.is_shutdown_initiated());
        assert_eq!(token.wait_for_shutdown().await, ShutdownReason::Graceful);
    }

    #[tokio::test]
    async fn test_lock_refused_after_shutdown() {
        let shutdown = GracefulShutdown::new();
        let lock = shutdown.try_lock();
        assert!(lock.is_some());
        drop(lock);

        shutdown.trigger_shutdown(ShutdownReason::Graceful);
        assert!(shutdown.try_lock().is_none());
        assert!(shutdown.wait_for_locks().await);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_held_lock() {
        let shutdown = Arc::new(GracefulShutdown::with_timeout(Duration::from_secs(2)));
        let lock = shutdown.try_lock().unwrap();
        shutdown.trigger_shutdown(ShutdownReason::Graceful);

        let released = tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            drop(lock);
        });

        assert!(shutdown.wait_for_locks().await);
        released.await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_wait_is_bounded() {
        let shutdown = GracefulShutdown::with_timeout(Duration::from_millis(50));
        let _lock = shutdown.try_lock().unwrap();
        shutdown.trigger_shutdown(ShutdownReason::Graceful);

        assert!(!shutdown.wait_for_locks().await);
    }

    #[tokio::test]
    async fn test_first_stage_waits_for_participants() {
        let shutdown = Arc::new(GracefulShutdown::with_timeout(Duration::from_secs(2)));
        let mut stage = shutdown.first_stage();
        let participant = tokio::spawn(async move {
            stage.wait().await;
            sleep(Duration::from_millis(20)).await;
            drop(stage);
        });

        shutdown.trigger_shutdown(ShutdownReason::Graceful);
        assert!(shutdown.wait_for_first_stage().await);
        participant.await.unwrap();
    }

    #[tokio::test]
    async fn test_first_stage_wait_is_bounded() {
        let shutdown = GracefulShutdown::with_timeout(Duration::from_millis(50));
        let _stuck = shutdown.first_stage();
        shutdown.trigger_shutdown(ShutdownReason::Graceful);

        assert!(!shutdown.wait_for_first_stage().await);
    }
}
