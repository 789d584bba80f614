use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

use crate::{
    config::BackendConfig,
    core::{
        droplet::Droplet,
        monitor::{BackendMonitor, MonitorTarget},
        transport::{InstrumentedTransport, WindowCounters},
    },
    ports::http_client::{HttpClient, HttpClientResult},
    utils::{Ewma, ShutdownToken},
};

/// A healthy backend is ejected once more than this many probes failed in a row.
pub const MAX_CONSECUTIVE_HEALTH_FAILURES: u32 = 5;

/// Samples covered by the rolling failure rate
const FAILURE_RATE_AGE: f64 = 10.0;

/// Errors related to backend operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    /// Error when a health URL cannot be parsed
    #[error("Invalid health URL for backend {id}: {reason}")]
    InvalidHealthUrl { id: String, reason: String },

    /// Error when the forwarding host is missing
    #[error("Backend {0} has no server host")]
    MissingHost(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Health and performance of one backend, refreshed once per second by its monitor.
#[derive(Debug, Clone)]
pub struct Stats {
    pub healthy: bool,
    /// Consecutive failed probes, reset by any successful probe
    pub health_failures: u32,
    /// Rolling relative latency: summed round-trip time per elapsed second per request
    pub latency: Ewma,
    /// Rolling share of requests that failed
    pub failure_rate: Ewma,
}

impl Stats {
    pub fn new(config: &BackendConfig, healthy: bool) -> Self {
        Self {
            healthy,
            health_failures: 0,
            latency: Ewma::new(config.latency_average_seconds as f64),
            failure_rate: Ewma::new(FAILURE_RATE_AGE),
        }
    }

    /// Fold one window of request accounting into the rolling averages.
    pub fn record_window(&mut self, window: WindowCounters, elapsed: Duration) {
        if window.requests == 0 {
            self.latency.add(0.0);
            self.failure_rate.add(0.0);
            return;
        }
        let requests = window.requests as f64;
        let elapsed = elapsed.as_secs_f64().max(f64::EPSILON);
        self.latency
            .add(window.latency_sum.as_secs_f64() / elapsed / requests);
        self.failure_rate.add(window.errors as f64 / requests);
    }

    /// Apply one probe outcome. Returns the new health state if it changed.
    pub fn record_probe(&mut self, success: bool) -> Option<bool> {
        if success {
            self.health_failures = 0;
        } else {
            self.health_failures += 1;
        }

        if self.healthy && self.health_failures > MAX_CONSECUTIVE_HEALTH_FAILURES {
            self.healthy = false;
            return Some(false);
        }
        if !self.healthy && self.health_failures == 0 {
            self.healthy = true;
            return Some(true);
        }
        None
    }
}

pub(crate) fn read_stats(stats: &RwLock<Stats>) -> RwLockReadGuard<'_, Stats> {
    stats.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_stats(stats: &RwLock<Stats>) -> RwLockWriteGuard<'_, Stats> {
    stats.write().unwrap_or_else(PoisonError::into_inner)
}

/// Shared dependencies for constructing backends.
#[derive(Clone)]
pub struct BackendContext {
    pub config: BackendConfig,
    /// Client requests are forwarded with
    pub client: Arc<dyn HttpClient>,
    /// Client health probes are sent with
    pub prober: Arc<dyn HttpClient>,
    /// Monitors exit once this fires
    pub shutdown: Option<ShutdownToken>,
}

/// The closed set of backend kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// A provisioned droplet, written back to the inventory file
    Droplet(Droplet),
    /// Injected at runtime; never persisted
    Ephemeral { name: String },
}

/// A single forwarding target with its own transport and monitor.
pub struct Backend {
    id: String,
    kind: BackendKind,
    host: String,
    health_url: String,
    transport: Arc<InstrumentedTransport>,
    stats: Arc<RwLock<Stats>>,
    monitor: Mutex<Option<BackendMonitor>>,
}

impl Backend {
    /// Create a backend for a droplet and start monitoring it.
    pub fn from_droplet(droplet: Droplet, ctx: &BackendContext) -> BackendResult<Arc<Self>> {
        let id = droplet.id.to_string();
        let host = droplet.server_host.clone();
        let health_url = droplet.health_url.clone();
        Self::build(id, BackendKind::Droplet(droplet), host, health_url, ctx)
    }

    /// Create a backend that is never persisted and start monitoring it.
    pub fn ephemeral(
        id: impl Into<String>,
        name: impl Into<String>,
        host: impl Into<String>,
        health_url: impl Into<String>,
        ctx: &BackendContext,
    ) -> BackendResult<Arc<Self>> {
        Self::build(
            id.into(),
            BackendKind::Ephemeral { name: name.into() },
            host.into(),
            health_url.into(),
            ctx,
        )
    }

    fn build(
        id: String,
        kind: BackendKind,
        host: String,
        health_url: String,
        ctx: &BackendContext,
    ) -> BackendResult<Arc<Self>> {
        if host.trim().is_empty() {
            return Err(BackendError::MissingHost(id));
        }
        if !health_url.is_empty() {
            let parsed =
                url::Url::parse(&health_url).map_err(|e| BackendError::InvalidHealthUrl {
                    id: id.clone(),
                    reason: e.to_string(),
                })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(BackendError::InvalidHealthUrl {
                    id,
                    reason: format!("unsupported scheme '{}'", parsed.scheme()),
                });
            }
        }

        // Without a probe to prove it, a backend starts out unhealthy
        let monitored = !ctx.config.disable_health_check;
        let healthy = !monitored || health_url.is_empty();

        let transport = Arc::new(InstrumentedTransport::new(ctx.client.clone()));
        let stats = Arc::new(RwLock::new(Stats::new(&ctx.config, healthy)));

        let monitor = monitored.then(|| {
            BackendMonitor::spawn(
                MonitorTarget {
                    id: id.clone(),
                    health_url: health_url.clone(),
                    health_timeout: ctx.config.health_check_timeout,
                    transport: transport.clone(),
                    stats: stats.clone(),
                    prober: ctx.prober.clone(),
                },
                ctx.shutdown.clone(),
            )
        });

        Ok(Arc::new(Self {
            id,
            kind,
            host,
            health_url,
            transport,
            stats,
            monitor: Mutex::new(monitor),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        match &self.kind {
            BackendKind::Droplet(droplet) => &droplet.name,
            BackendKind::Ephemeral { name } => name,
        }
    }

    pub fn kind(&self) -> &BackendKind {
        &self.kind
    }

    /// The droplet descriptor, for backends that are persisted.
    pub fn droplet(&self) -> Option<&Droplet> {
        match &self.kind {
            BackendKind::Droplet(droplet) => Some(droplet),
            BackendKind::Ephemeral { .. } => None,
        }
    }

    /// `host:port` requests are forwarded to
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn health_url(&self) -> &str {
        &self.health_url
    }

    pub fn is_healthy(&self) -> bool {
        read_stats(&self.stats).healthy
    }

    /// Override the health flag. A running monitor keeps applying its own policy.
    pub fn set_healthy(&self, healthy: bool) {
        let mut stats = write_stats(&self.stats);
        stats.healthy = healthy;
        stats.health_failures = 0;
    }

    /// A copy of the latest statistics.
    pub fn stats(&self) -> Stats {
        read_stats(&self.stats).clone()
    }

    /// Current rolling latency signal.
    pub fn latency(&self) -> f64 {
        read_stats(&self.stats).latency.value()
    }

    #[cfg(test)]
    pub(crate) fn set_latency(&self, latency: f64) {
        write_stats(&self.stats).latency.set(latency);
    }

    /// Requests currently in flight through this backend's transport.
    pub fn connections(&self) -> usize {
        self.transport.connections()
    }

    pub fn transport(&self) -> &InstrumentedTransport {
        &self.transport
    }

    /// Forward a request through the instrumented transport.
    pub async fn round_trip(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        self.transport.round_trip(req).await
    }

    /// Stop monitoring and wait for the monitor to exit. Later calls do nothing.
    pub async fn close(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
            tracing::debug!(backend = %self.id, "Backend closed");
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        if let Some(monitor) = self
            .monitor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            monitor.abort();
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("health_url", &self.health_url)
            .finish_non_exhaustive()
    }
}
