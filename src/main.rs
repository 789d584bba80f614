use std::{net::SocketAddr, path::Path, sync::Arc};

use axum::{
    Router,
    extract::connect_info::Connected,
    serve::{IncomingStream, Listener, ListenerExt},
};
use clap::{Parser, Subcommand};
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use droplet_proxy::{
    GracefulShutdown, ProxyHandler, ReloadCoordinator,
    adapters::{build_load_balancer, router},
    config::{ServerConfig, ServerConfigValidator, load_config, loader::load_config_unchecked},
    tracing_setup,
};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file
    #[clap(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Log as JSON instead of human-readable text
    #[clap(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file
    Validate,
    /// Initialize a new configuration file
    Init,
    /// Start the proxy (default)
    Serve,
}

struct AxumListener<S> {
    stream: S,
    local_addr: SocketAddr,
}

impl<S, I, E> Listener for AxumListener<S>
where
    S: futures_util::Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                Some(Err(e)) => tracing::debug!("Accept error: {}", e),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Validate => validate_config_command(&args.config),
        Commands::Init => init_config_command(&args.config).await,
        Commands::Serve => serve(&args.config, args.json_logs).await,
    }
}

async fn serve(config_path: &str, json_logs: bool) -> Result<()> {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            A provider was probably installed already.",
            e
        );
    }

    if json_logs {
        tracing_setup::init_tracing()?;
    } else {
        tracing_setup::init_console_tracing()?;
    }

    tracing::info!("Loading configuration from {config_path}");
    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    let shutdown = Arc::new(GracefulShutdown::with_timeout(config.shutdown_timeout));
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        signal_shutdown.run_signal_handler().await;
    });

    let balancer = build_load_balancer(&config, Some(shutdown.shutdown_token()))
        .await
        .context("Failed to build load balancer")?;
    tracing::info!(
        strategy = %balancer.kind(),
        backends = balancer.inventory().len(),
        "Load balancer ready"
    );

    let config = Arc::new(config);
    let handler = Arc::new(ProxyHandler::new(config.clone(), Arc::new(balancer)));
    let coordinator = Arc::new(ReloadCoordinator::new(
        config_path,
        handler.clone(),
        shutdown.clone(),
    ));
    let _watchers = coordinator
        .spawn_watchers(config.watch_config)
        .context("Failed to start file watchers")?;

    let addr = config.bind_addr().context("Failed to resolve bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    let app = router(handler.clone());

    tracing::info!("droplet-proxy listening on {} (https: {})", addr, config.https);

    if config.https {
        let acceptor = tls_acceptor(&config)?;
        let local_addr = listener.local_addr().context("Failed to get local addr")?;
        let tls_listener = AxumListener {
            stream: tls_listener::TlsListener::new(acceptor, listener),
            local_addr,
        }
        .tap_io(|_io| {});
        run_server(tls_listener, app, &shutdown).await?;
    } else {
        run_server(listener, app, &shutdown).await?;
    }

    handler.close().await;
    if shutdown.wait_for_locks().await {
        tracing::info!("Graceful shutdown completed");
    }
    Ok(())
}

/// Serve until shutdown, then let the first stage finish before draining connections.
async fn run_server<L>(listener: L, app: Router, shutdown: &GracefulShutdown) -> Result<()>
where
    L: Listener<Addr = SocketAddr>,
    for<'a> SocketAddr: Connected<IncomingStream<'a, L>>,
{
    let mut token = shutdown.shutdown_token();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        token.wait_for_shutdown().await;
    })
    .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => return result.context("Server error"),
        reason = shutdown.wait_for_shutdown_signal() => {
            tracing::info!("Shutdown signal received: {:?}", reason);
        }
    }

    shutdown.wait_for_first_stage().await;

    match tokio::time::timeout(shutdown.shutdown_timeout(), &mut server).await {
        Ok(result) => result.context("Server error"),
        Err(_) => {
            tracing::warn!(
                "Connections still open after {:?}, closing them",
                shutdown.shutdown_timeout()
            );
            Ok(())
        }
    }
}

fn tls_acceptor(config: &ServerConfig) -> Result<tokio_rustls::TlsAcceptor> {
    use std::{fs::File, io::BufReader};

    use rustls_pemfile::{certs, private_key};

    let (Some(cert_path), Some(key_path)) = (&config.tls_cert_file, &config.tls_key_file) else {
        return Err(eyre!("HTTPS requested without certificate and key"));
    };

    let cert_file = &mut BufReader::new(
        File::open(cert_path)
            .with_context(|| format!("failed to open cert file {}", cert_path.display()))?,
    );
    let key_file = &mut BufReader::new(
        File::open(key_path)
            .with_context(|| format!("failed to open key file {}", key_path.display()))?,
    );

    let cert_chain = certs(cert_file).collect::<Result<Vec<_>, _>>()?;
    let key = private_key(key_file)?
        .ok_or_else(|| eyre!("No private key found in {}", key_path.display()))?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;

    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_config)))
}

/// Validate configuration file and exit
fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config_unchecked(Path::new(config_path)) {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Bind Address: {}", config.bind);
            println!("   • HTTPS: {}", config.https);
            println!("   • Load Balancer: {}", config.loadbalancing.kind);
            println!("   • Inventory: {}", config.inventory_file.display());
            println!(
                "   • Health Checks: {}",
                !config.backend.disable_health_check
            );
            println!("   • Watch Config: {}", config.watch_config);
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# droplet-proxy configuration

# Address to listen on. ":80" listens on all interfaces.
bind = ":8080"
https = false
# tls-cert-file = "cert.pem"
# tls-key-file = "key.pem"

add-x-forwarded-for = true
watch-config = true
inventory-file = "inventory.toml"
shutdown-timeout = "5s"

[loadbalancing]
# roundrobin, leastconn or lowestlatency
type = "roundrobin"

[backend]
dial-timeout = "2s"
latency-average-seconds = 30
health-check-timeout = "250ms"
new-host-port = 80
new-host-health-path = "/"
new-host-health-https = false
disable-health-check = false
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'droplet-proxy serve --config {config_path}' to start the proxy");
    Ok(())
}
