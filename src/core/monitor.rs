use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    core::{
        backend::{Stats, write_stats},
        transport::InstrumentedTransport,
    },
    ports::http_client::HttpClient,
    tracing_setup::monitor_span,
    utils::ShutdownToken,
};

/// Interval between two monitor cycles
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a monitor needs to keep one backend's [`Stats`] current.
pub(crate) struct MonitorTarget {
    pub id: String,
    pub health_url: String,
    pub health_timeout: Duration,
    pub transport: Arc<InstrumentedTransport>,
    pub stats: Arc<RwLock<Stats>>,
    pub prober: Arc<dyn HttpClient>,
}

/// Background task aggregating request stats and probing one backend every second.
pub struct BackendMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackendMonitor {
    pub(crate) fn spawn(target: MonitorTarget, shutdown: Option<ShutdownToken>) -> Self {
        let cancel = CancellationToken::new();
        let span = monitor_span(&target.id);
        let handle = tokio::spawn(run(target, cancel.clone(), shutdown).instrument(span));
        Self { cancel, handle }
    }

    /// Stop the monitor and wait until its task has exited.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!("Backend monitor task failed: {}", e);
        }
    }

    /// Request a stop without waiting for it.
    pub(crate) fn abort(&self) {
        self.cancel.cancel();
    }
}

async fn shutdown_requested(token: &mut Option<ShutdownToken>) {
    match token {
        Some(token) => {
            token.wait_for_shutdown().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run(target: MonitorTarget, cancel: CancellationToken, mut shutdown: Option<ShutdownToken>) {
    let mut ticker = interval_at(Instant::now() + MONITOR_INTERVAL, MONITOR_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut previous = Instant::now();

    tracing::debug!(backend = %target.id, "Backend monitor started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shutdown_requested(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }

        let elapsed = previous.elapsed();
        previous = Instant::now();
        let window = target.transport.drain();
        write_stats(&target.stats).record_window(window, elapsed);

        if target.health_url.is_empty() {
            write_stats(&target.stats).healthy = true;
            continue;
        }

        // The stats lock is not held while the probe is in flight
        let probe = tokio::select! {
            _ = cancel.cancelled() => break,
            result = target.prober.probe(&target.health_url, target.health_timeout) => result,
        };

        let success = match probe {
            Ok(status) if status.is_server_error() => {
                tracing::debug!(
                    backend = %target.id,
                    url = %target.health_url,
                    status = status.as_u16(),
                    "Health check failed"
                );
                false
            }
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(
                    backend = %target.id,
                    url = %target.health_url,
                    error = %e,
                    "Health check failed"
                );
                false
            }
        };

        let mut stats = write_stats(&target.stats);
        match stats.record_probe(success) {
            Some(false) => tracing::warn!(
                backend = %target.id,
                failures = stats.health_failures,
                "Consecutive health checks failed. Marking backend unhealthy"
            ),
            Some(true) => tracing::info!(
                backend = %target.id,
                "Health check succeeded. Marking backend healthy"
            ),
            None => {}
        }
    }

    tracing::debug!(backend = %target.id, "Backend monitor stopped");
}
