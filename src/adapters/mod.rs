pub mod file_watcher;
pub mod http_client;
pub mod http_handler;
pub mod reload;
pub mod websocket;

/// Re-export commonly used types from adapters
pub use file_watcher::FileWatcher;
pub use http_client::HttpClientAdapter;
pub use http_handler::{ProxyGeneration, ProxyHandler, router};
pub use reload::{
    ReloadCoordinator, ReloadEvent, ReloadOutcome, ReloadTarget, backend_context,
    build_load_balancer,
};
