use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use axum::body::Body as AxumBody;
use hyper::{Request, Response};

use crate::ports::http_client::{HttpClient, HttpClientResult};

/// Per-window request accounting, drained once per second by the backend monitor.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct WindowCounters {
    pub requests: u64,
    pub errors: u64,
    pub latency_sum: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    running: usize,
    window: WindowCounters,
}

/// Transport wrapper that records in-flight requests, latency and errors for one backend.
pub struct InstrumentedTransport {
    inner: Arc<dyn HttpClient>,
    counters: Mutex<Counters>,
}

impl InstrumentedTransport {
    pub fn new(inner: Arc<dyn HttpClient>) -> Self {
        Self {
            inner,
            counters: Mutex::new(Counters::default()),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forward a request. Responses with status >= 500 are returned to the caller
    /// but counted as errors.
    pub async fn round_trip(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        let guard = InFlight::enter(self);
        let started = Instant::now();

        let result = self.inner.send_request(req).await;

        let failed = match &result {
            Ok(response) => response.status().is_server_error(),
            Err(_) => true,
        };
        guard.complete(started.elapsed(), failed);
        result
    }

    /// Number of requests currently being forwarded.
    pub fn connections(&self) -> usize {
        self.counters().running
    }

    /// Read and reset the window counters. Only the owning monitor calls this.
    pub(crate) fn drain(&self) -> WindowCounters {
        std::mem::take(&mut self.counters().window)
    }
}

/// Keeps the in-flight gauge accurate even when the request future is dropped.
struct InFlight<'a> {
    transport: &'a InstrumentedTransport,
}

impl<'a> InFlight<'a> {
    fn enter(transport: &'a InstrumentedTransport) -> Self {
        transport.counters().running += 1;
        Self { transport }
    }

    fn complete(self, elapsed: Duration, failed: bool) {
        let mut counters = self.transport.counters();
        counters.window.requests += 1;
        counters.window.latency_sum += elapsed;
        if failed {
            counters.window.errors += 1;
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut counters = self.transport.counters();
        counters.running = counters.running.saturating_sub(1);
    }
}
