use std::sync::{Arc, Mutex, PoisonError};

use crate::{
    config::LoadBalancerType,
    core::{backend::Backend, inventory::Inventory},
};

/// Trait defining the interface for load balancing strategies
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Select a healthy backend, or `None` if there is none.
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>>;
    /// Create a new instance of this strategy as a boxed trait object
    fn boxed(self) -> Box<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

/// Round-robin load balancing strategy that skips unhealthy backends
pub struct RoundRobinStrategy {
    cursor: Mutex<usize>,
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinStrategy {
    /// Create a new round-robin strategy
    pub fn new() -> Self {
        Self {
            cursor: Mutex::new(0),
        }
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        // At most one full cycle
        for _ in 0..backends.len() {
            let index = *cursor % backends.len();
            *cursor = (index + 1) % backends.len();
            if backends[index].is_healthy() {
                return Some(backends[index].clone());
            }
        }
        tracing::warn!("Unable to find a healthy backend");
        None
    }
}

/// Pick the healthy backend with the fewest requests in flight; earlier backends win ties
pub struct LeastConnectionsStrategy;

impl LoadBalancingStrategy for LeastConnectionsStrategy {
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let mut best: Option<(&Arc<Backend>, usize)> = None;
        for backend in backends.iter().filter(|b| b.is_healthy()) {
            let connections = backend.connections();
            if best.is_none_or(|(_, fewest)| connections < fewest) {
                best = Some((backend, connections));
            }
        }
        best.map(|(backend, _)| backend.clone())
    }
}

/// Pick the healthy backend with the lowest rolling latency; earlier backends win ties
pub struct LowestLatencyStrategy;

impl LoadBalancingStrategy for LowestLatencyStrategy {
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let mut best: Option<(&Arc<Backend>, f64)> = None;
        for backend in backends.iter().filter(|b| b.is_healthy()) {
            let latency = backend.latency();
            if best.is_none_or(|(_, lowest)| latency < lowest) {
                best = Some((backend, latency));
            }
        }
        best.map(|(backend, _)| backend.clone())
    }
}

/// Aggregate view over the backends of a load balancer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadBalancerStats {
    pub healthy: usize,
    pub unhealthy: usize,
    /// Mean latency signal of the healthy backends
    pub avg_latency: f64,
    /// Requests currently in flight across all backends
    pub connections: usize,
}

/// A strategy bound to exactly one inventory.
pub struct LoadBalancer {
    kind: LoadBalancerType,
    strategy: Box<dyn LoadBalancingStrategy>,
    inventory: Arc<Inventory>,
}

impl LoadBalancer {
    pub fn new(kind: LoadBalancerType, inventory: Arc<Inventory>) -> Self {
        Self {
            kind,
            strategy: LoadBalancerFactory::create_strategy(kind),
            inventory,
        }
    }

    /// A healthy backend for the next request, or `None` if the caller should answer 503.
    pub fn backend(&self) -> Option<Arc<Backend>> {
        self.inventory
            .with_backends(|backends| self.strategy.select(backends))
    }

    pub fn kind(&self) -> LoadBalancerType {
        self.kind
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    pub fn stats(&self) -> LoadBalancerStats {
        self.inventory.with_backends(|backends| {
            let mut stats = LoadBalancerStats::default();
            let mut latency_sum = 0.0;
            for backend in backends {
                stats.connections += backend.connections();
                if backend.is_healthy() {
                    stats.healthy += 1;
                    latency_sum += backend.latency();
                } else {
                    stats.unhealthy += 1;
                }
            }
            if stats.healthy > 0 {
                stats.avg_latency = latency_sum / stats.healthy as f64;
            }
            stats
        })
    }

    /// Close the bound inventory, stopping every backend monitor.
    pub async fn close(&self) {
        self.inventory.close().await;
    }
}

/// Factory for creating load balancing strategies from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    /// Create a new load balancing strategy based on configuration
    pub fn create_strategy(kind: LoadBalancerType) -> Box<dyn LoadBalancingStrategy> {
        match kind {
            LoadBalancerType::RoundRobin => RoundRobinStrategy::new().boxed(),
            LoadBalancerType::LeastConn => LeastConnectionsStrategy.boxed(),
            LoadBalancerType::LowestLatency => LowestLatencyStrategy.boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicU16, time::Duration};

    use axum::body::Body as AxumBody;
    use hyper::Request;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        core::{
            backend::{BackendContext, tests::test_context},
            transport::tests::MockHttpClient,
        },
        ports::http_client::HttpClient,
    };

    fn ctx() -> BackendContext {
        let client: Arc<dyn HttpClient> = Arc::new(MockHttpClient::new(200));
        test_context(client, true)
    }

    fn inventory_of(n: usize, ctx: &BackendContext) -> Arc<Inventory> {
        let inventory = Inventory::new(ctx.clone());
        for i in 0..n {
            let backend = Backend::ephemeral(
                i.to_string(),
                format!("backend {i}"),
                format!("127.0.0.1:{}", 9000 + i),
                "",
                ctx,
            )
            .unwrap();
            inventory.add_backend(backend).unwrap();
        }
        Arc::new(inventory)
    }

    fn picks(lb: &LoadBalancer, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| lb.backend().map(|b| b.id().to_string()).unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let lb = LoadBalancer::new(LoadBalancerType::RoundRobin, inventory_of(3, &ctx()));
        assert_eq!(picks(&lb, 7), vec!["0", "1", "2", "0", "1", "2", "0"]);
    }

    #[test]
    fn test_round_robin_skips_unhealthy() {
        let inventory = inventory_of(4, &ctx());
        let lb = LoadBalancer::new(LoadBalancerType::RoundRobin, inventory.clone());
        inventory.backend("2").unwrap().set_healthy(false);
        assert_eq!(picks(&lb, 6), vec!["0", "1", "3", "0", "1", "3"]);

        for backend in inventory.backends() {
            backend.set_healthy(false);
        }
        assert!(lb.backend().is_none());
    }

    #[test]
    fn test_round_robin_empty_inventory() {
        let lb = LoadBalancer::new(LoadBalancerType::RoundRobin, inventory_of(0, &ctx()));
        assert!(lb.backend().is_none());
    }

    #[tokio::test]
    async fn test_least_connections() {
        // (connections per backend, unhealthy indices, acceptable picks)
        let cases: Vec<(Vec<usize>, Vec<usize>, Vec<&str>)> = vec![
            (vec![1, 0, 0, 0], vec![], vec!["1", "2", "3"]),
            (vec![0, 1, 1, 1], vec![], vec!["0"]),
            (vec![2, 1, 0], vec![2], vec!["1"]),
            (vec![1000], vec![], vec!["0"]),
            (vec![1000], vec![0], vec![]),
            (vec![], vec![], vec![]),
        ];

        for (connections, unhealthy, allowed) in cases {
            let gate = Arc::new(Notify::new());
            let client: Arc<dyn HttpClient> = Arc::new(MockHttpClient {
                status: AtomicU16::new(200),
                gate: Some(gate.clone()),
            });
            let ctx = test_context(client, true);
            let inventory = inventory_of(connections.len(), &ctx);
            let lb = LoadBalancer::new(LoadBalancerType::LeastConn, inventory.clone());

            let mut pending = Vec::new();
            for (backend, count) in inventory.backends().into_iter().zip(&connections) {
                for _ in 0..*count {
                    let backend = backend.clone();
                    pending.push(tokio::spawn(async move {
                        let req = Request::builder()
                            .uri("http://backend.test/")
                            .body(AxumBody::empty())
                            .unwrap();
                        backend.round_trip(req).await
                    }));
                }
            }
            for (backend, count) in inventory.backends().iter().zip(&connections) {
                while backend.connections() < *count {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
            for index in &unhealthy {
                inventory.backends()[*index].set_healthy(false);
            }

            let picked = lb.backend().map(|b| b.id().to_string());
            match picked {
                Some(id) => assert!(
                    allowed.contains(&id.as_str()),
                    "picked {id} for {connections:?}, allowed {allowed:?}"
                ),
                None => assert!(allowed.is_empty(), "no pick for {connections:?}"),
            }

            for task in pending {
                task.abort();
            }
        }
    }

    #[test]
    fn test_least_connections_first_wins_ties() {
        let lb = LoadBalancer::new(LoadBalancerType::LeastConn, inventory_of(3, &ctx()));
        assert_eq!(picks(&lb, 3), vec!["0", "0", "0"]);
    }

    #[test]
    fn test_lowest_latency() {
        let inventory = inventory_of(3, &ctx());
        let lb = LoadBalancer::new(LoadBalancerType::LowestLatency, inventory.clone());
        assert_eq!(lb.backend().unwrap().id(), "0");

        let backends = inventory.backends();
        backends[0].set_latency(0.5);
        backends[1].set_latency(0.1);
        backends[2].set_latency(0.1);
        assert_eq!(lb.backend().unwrap().id(), "1");

        backends[1].set_healthy(false);
        assert_eq!(lb.backend().unwrap().id(), "2");
    }

    #[test]
    fn test_stats() {
        let inventory = inventory_of(3, &ctx());
        let lb = LoadBalancer::new(LoadBalancerType::RoundRobin, inventory.clone());
        let backends = inventory.backends();
        backends[0].set_latency(0.2);
        backends[1].set_latency(0.4);
        backends[2].set_healthy(false);

        let stats = lb.stats();
        assert_eq!(stats.healthy, 2);
        assert_eq!(stats.unhealthy, 1);
        assert_eq!(stats.connections, 0);
        assert!((stats.avg_latency - 0.3).abs() < 1e-9);
    }
}
