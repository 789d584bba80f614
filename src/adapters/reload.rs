use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use eyre::{Result, WrapErr};
use tokio::{
    sync::{Mutex, broadcast, watch},
    task::JoinHandle,
};

use crate::{
    adapters::{file_watcher::FileWatcher, http_client::HttpClientAdapter, http_handler::ProxyHandler},
    config::{ServerConfig, ServerConfigValidator, load_config},
    core::{BackendContext, Inventory, LoadBalancer},
    utils::{FirstStage, GracefulShutdown, ShutdownToken},
};

/// Which file a reload was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTarget {
    Config,
    Inventory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    Applied,
    /// Previous state is still in effect
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadEvent {
    pub target: ReloadTarget,
    pub outcome: ReloadOutcome,
}

/// Build the backend context for `config`: forwarding and probe clients plus monitor shutdown.
pub fn backend_context(
    config: &ServerConfig,
    shutdown: Option<ShutdownToken>,
) -> Result<BackendContext> {
    let backend = &config.backend;
    Ok(BackendContext {
        config: backend.clone(),
        client: Arc::new(HttpClientAdapter::new(backend.dial_timeout)?),
        prober: Arc::new(HttpClientAdapter::for_health_checks(
            backend.health_check_timeout,
        )?),
        shutdown,
    })
}

/// Load the inventory named by `config` and bind a balancer of the configured type to it.
pub async fn build_load_balancer(
    config: &ServerConfig,
    shutdown: Option<ShutdownToken>,
) -> Result<LoadBalancer> {
    let ctx = backend_context(config, shutdown)?;
    let inventory = Inventory::load(&config.inventory_file, ctx)
        .await
        .wrap_err_with(|| {
            format!(
                "Failed to load inventory from {}",
                config.inventory_file.display()
            )
        })?;
    Ok(LoadBalancer::new(
        config.loadbalancing.kind,
        Arc::new(inventory),
    ))
}

/// Applies configuration and inventory changes to a running [`ProxyHandler`].
///
/// Reloads are serialized. A failed reload leaves the handler untouched.
pub struct ReloadCoordinator {
    config_path: PathBuf,
    handler: Arc<ProxyHandler>,
    shutdown: Arc<GracefulShutdown>,
    events: broadcast::Sender<ReloadEvent>,
    inventory_path: watch::Sender<PathBuf>,
    reload_lock: Mutex<()>,
}

impl ReloadCoordinator {
    pub fn new(
        config_path: impl Into<PathBuf>,
        handler: Arc<ProxyHandler>,
        shutdown: Arc<GracefulShutdown>,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        let (inventory_path, _) = watch::channel(handler.config().inventory_file.clone());
        Self {
            config_path: config_path.into(),
            handler,
            shutdown,
            events,
            inventory_path,
            reload_lock: Mutex::new(()),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn handler(&self) -> &Arc<ProxyHandler> {
        &self.handler
    }

    /// Receive the outcome of every reload from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.events.subscribe()
    }

    /// Re-read the configuration file and apply it if it is valid and compatible.
    pub async fn reload_config(&self) -> ReloadOutcome {
        let _guard = self.reload_lock.lock().await;
        tracing::info!(path = %self.config_path.display(), "Reloading configuration");
        let outcome = match self.apply_config().await {
            Ok(()) => {
                tracing::info!("Configuration applied");
                ReloadOutcome::Applied
            }
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "Configuration NOT applied");
                ReloadOutcome::Rejected(format!("{e:#}"))
            }
        };
        self.publish(ReloadTarget::Config, outcome)
    }

    async fn apply_config(&self) -> Result<()> {
        let next = load_config(&self.config_path).await?;
        let current = self.handler.config();
        ServerConfigValidator::validate_reload(&current, &next)?;
        let next = Arc::new(next);

        if current.requires_new_backends(&next) {
            let balancer = build_load_balancer(&next, Some(self.shutdown.shutdown_token())).await?;
            let inventory_file = next.inventory_file.clone();
            self.handler.replace(next, Arc::new(balancer)).await;
            self.inventory_path.send_if_modified(|path| {
                if *path == inventory_file {
                    false
                } else {
                    *path = inventory_file;
                    true
                }
            });
        } else {
            self.handler.set_config(next);
        }
        Ok(())
    }

    /// Re-read the inventory file named by the current configuration and swap in a
    /// balancer of the current type over it.
    pub async fn reload_inventory(&self) -> ReloadOutcome {
        let _guard = self.reload_lock.lock().await;
        let config = self.handler.config();
        tracing::info!(path = %config.inventory_file.display(), "Reloading inventory");
        let outcome =
            match build_load_balancer(&config, Some(self.shutdown.shutdown_token())).await {
                Ok(balancer) => {
                    self.handler.set_load_balancer(Arc::new(balancer)).await;
                    tracing::info!("New inventory applied");
                    ReloadOutcome::Applied
                }
                Err(e) => {
                    tracing::error!(error = %format!("{e:#}"), "New inventory NOT applied");
                    ReloadOutcome::Rejected(format!("{e:#}"))
                }
            };
        self.publish(ReloadTarget::Inventory, outcome)
    }

    fn publish(&self, target: ReloadTarget, outcome: ReloadOutcome) -> ReloadOutcome {
        // No subscribers is fine
        let _ = self.events.send(ReloadEvent {
            target,
            outcome: outcome.clone(),
        });
        outcome
    }

    /// Start the file watchers. The inventory file is always watched, the
    /// configuration file only when `watch_config` is set.
    ///
    /// Every watcher takes part in the first shutdown stage.
    pub fn spawn_watchers(self: &Arc<Self>, watch_config: bool) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(2);

        if watch_config {
            let watcher = FileWatcher::new(&self.config_path)?;
            let stage = self.shutdown.first_stage();
            handles.push(tokio::spawn(self.clone().watch_config(watcher, stage)));
        }

        let watcher = FileWatcher::new(self.inventory_path.borrow().clone())?;
        let stage = self.shutdown.first_stage();
        handles.push(tokio::spawn(self.clone().watch_inventory(watcher, stage)));

        Ok(handles)
    }

    async fn watch_config(self: Arc<Self>, mut watcher: FileWatcher, mut stage: FirstStage) {
        loop {
            tokio::select! {
                _ = stage.wait() => break,
                changed = watcher.changed() => {
                    if !changed {
                        tracing::warn!(path = %watcher.path().display(), "Configuration watcher stopped");
                        break;
                    }
                    self.reload_config().await;
                }
            }
        }
        tracing::debug!("Configuration watcher exiting");
    }

    async fn watch_inventory(self: Arc<Self>, mut watcher: FileWatcher, mut stage: FirstStage) {
        let mut path_rx = self.inventory_path.subscribe();
        loop {
            tokio::select! {
                _ = stage.wait() => break,
                changed = watcher.changed() => {
                    if !changed {
                        tracing::warn!(path = %watcher.path().display(), "Inventory watcher stopped");
                        break;
                    }
                    self.reload_inventory().await;
                }
                Ok(()) = path_rx.changed() => {
                    let path = path_rx.borrow_and_update().clone();
                    match FileWatcher::new(&path) {
                        Ok(next) => watcher = next,
                        Err(e) => tracing::error!(
                            path = %path.display(),
                            error = %e,
                            "Unable to watch new inventory file"
                        ),
                    }
                }
            }
        }
        tracing::debug!("Inventory watcher exiting");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::config::LoadBalancerType;

    const INVENTORY: &str = r#"
[[droplet]]
id = 1
name = "auto-nginx 1"
server-host = "127.0.0.1:1"
"#;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn config_body(dir: &Path, balancer: &str) -> String {
        format!(
            "bind = \"127.0.0.1:0\"\nwatch-config = false\ninventory-file = \"{}\"\n\n[loadbalancing]\ntype = \"{balancer}\"\n\n[backend]\ndisable-health-check = true\n",
            dir.join("inventory.toml").display()
        )
    }

    async fn coordinator(dir: &Path) -> Arc<ReloadCoordinator> {
        std::fs::write(dir.join("inventory.toml"), INVENTORY).unwrap();
        let config_path = write_config(dir, &config_body(dir, "roundrobin"));
        let config = load_config(&config_path).await.unwrap();
        let balancer = build_load_balancer(&config, None).await.unwrap();
        let handler = Arc::new(ProxyHandler::new(Arc::new(config), Arc::new(balancer)));
        Arc::new(ReloadCoordinator::new(
            config_path,
            handler,
            Arc::new(GracefulShutdown::new()),
        ))
    }

    #[tokio::test]
    async fn test_balancer_type_change_swaps_strategy() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;
        let mut events = coordinator.subscribe();
        let before = coordinator.handler().load_balancer();

        write_config(dir.path(), &config_body(dir.path(), "leastconn"));
        assert_eq!(coordinator.reload_config().await, ReloadOutcome::Applied);

        let after = coordinator.handler().load_balancer();
        assert_eq!(after.kind(), LoadBalancerType::LeastConn);
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.inventory().ids(), vec!["1"]);

        let event = events.recv().await.unwrap();
        assert_eq!(event.target, ReloadTarget::Config);
        assert_eq!(event.outcome, ReloadOutcome::Applied);
    }

    #[tokio::test]
    async fn test_plain_setting_keeps_balancer() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;
        let before = coordinator.handler().load_balancer();

        let body = format!(
            "add-x-forwarded-for = false\n{}",
            config_body(dir.path(), "roundrobin")
        );
        write_config(dir.path(), &body);
        assert_eq!(coordinator.reload_config().await, ReloadOutcome::Applied);

        assert!(!coordinator.handler().config().add_x_forwarded_for);
        assert!(Arc::ptr_eq(&before, &coordinator.handler().load_balancer()));
    }

    #[tokio::test]
    async fn test_immutable_change_rejected() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;

        let body = config_body(dir.path(), "leastconn").replace("127.0.0.1:0", "127.0.0.1:1");
        write_config(dir.path(), &body);
        let outcome = coordinator.reload_config().await;
        assert!(
            matches!(&outcome, ReloadOutcome::Rejected(reason) if reason.contains("'bind'")),
            "{outcome:?}"
        );
        assert_eq!(
            coordinator.handler().load_balancer().kind(),
            LoadBalancerType::RoundRobin
        );
    }

    #[tokio::test]
    async fn test_broken_inventory_keeps_previous() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;
        let before = coordinator.handler().load_balancer();

        std::fs::write(dir.path().join("inventory.toml"), "[[droplet]]\nid = \"x\"\n").unwrap();
        let outcome = coordinator.reload_inventory().await;
        assert!(matches!(outcome, ReloadOutcome::Rejected(_)));
        assert!(Arc::ptr_eq(&before, &coordinator.handler().load_balancer()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watcher_applies_inventory_and_exits_on_shutdown() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;
        let mut events = coordinator.subscribe();
        let handles = coordinator.spawn_watchers(false).unwrap();

        let updated = format!(
            "{INVENTORY}\n[[droplet]]\nid = 2\nname = \"auto-nginx 2\"\nserver-host = \"127.0.0.1:2\"\n"
        );
        std::fs::write(dir.path().join("inventory.toml"), updated).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.target, ReloadTarget::Inventory);
        assert_eq!(event.outcome, ReloadOutcome::Applied);
        assert_eq!(
            coordinator.handler().load_balancer().inventory().ids(),
            vec!["1", "2"]
        );

        coordinator
            .shutdown
            .trigger_shutdown(crate::utils::ShutdownReason::Graceful);
        assert!(coordinator.shutdown.wait_for_first_stage().await);
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
