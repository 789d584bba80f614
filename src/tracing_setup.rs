use eyre::{Result, eyre};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize structured logging with JSON output
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to initialize tracing: {e}"))?;

    tracing::info!("Structured logging initialized");
    Ok(())
}

/// Initialize console-friendly logging for development
pub fn init_console_tracing() -> Result<()> {
    Registry::default()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to initialize tracing: {e}"))?;

    tracing::info!("Console logging initialized");
    Ok(())
}

/// Span wrapping the lifetime of one backend's monitor task
pub fn monitor_span(backend_id: &str) -> tracing::Span {
    tracing::info_span!("monitor", backend = backend_id)
}
