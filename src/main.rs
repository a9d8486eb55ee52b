use devgate::app::AppContext;
use devgate::config::Config;
use devgate::dns::DnsServer;
use devgate::reaper::run_reaper;
use devgate::registry::Registry;
use devgate::router::Router;
use devgate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("devgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    let root = config.server.resolve_root();
    if !root.is_dir() {
        warn!(root = %root.display(), "Apps root does not exist; every host will be unconfigured");
    }

    // Scratch directory for unix sockets, removed when dropped
    let socket_dir = tempfile::Builder::new()
        .prefix("devgate-sockets")
        .tempdir()
        .map_err(|e| anyhow::anyhow!("Failed to create socket directory: {}", e))?;

    print_startup_banner(&config, &root, socket_dir.path());

    let ctx = AppContext {
        root,
        socket_dir: socket_dir.path().to_path_buf(),
        defaults: config.defaults.clone(),
        launcher: config.launcher.clone(),
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Registry::new();

    let router = Router::new(&config.server, ctx, Arc::clone(&registry), shutdown_rx.clone())?;
    let router_handle = tokio::spawn(async move {
        if let Err(e) = router.run().await {
            error!(error = %e, "Router error");
        }
    });

    // Spawn idle reaper
    let reaper_handle = tokio::spawn(run_reaper(
        Arc::clone(&registry),
        config.server.reap_interval(),
        shutdown_rx.clone(),
    ));

    // Spawn DNS responder
    let dns_handle = if config.dns.enabled {
        let dns_addr: SocketAddr = format!("{}:{}", config.dns.bind, config.dns.port)
            .parse()
            .map_err(|e| {
                error!(bind = %config.dns.bind, port = config.dns.port, error = %e, "Invalid DNS bind address");
                anyhow::anyhow!("Invalid DNS bind address: {}", e)
            })?;
        let dns = DnsServer::bind(dns_addr).await?;
        Some(tokio::spawn(dns.run(shutdown_rx.clone())))
    } else {
        None
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown: the router stops accepting and the reaper stops ticking
    let _ = shutdown_tx.send(true);
    let _ = reaper_handle.await;

    // Stop every app before the socket directory goes away
    let running = registry.snapshot();
    if !running.is_empty() {
        info!(
            apps = ?running.iter().map(|app| app.host.as_str()).collect::<Vec<_>>(),
            "Stopping all apps..."
        );
    }
    registry.shutdown_all().await;

    // Wait for the listeners to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = router_handle.await;
        if let Some(handle) = dns_handle {
            let _ = handle.await;
        }
    })
    .await;

    if let Err(e) = socket_dir.close() {
        warn!(error = %e, "Failed to remove socket directory");
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config, root: &std::path::Path, socket_dir: &std::path::Path) {
    info!(name = PKG_NAME, version = VERSION, "Starting development router");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        domain = %config.server.domain,
        root = %root.display(),
        sockets = %socket_dir.display(),
        "Server configuration"
    );
    info!(
        enabled = config.dns.enabled,
        bind = %config.dns.bind,
        port = config.dns.port,
        "DNS responder settings"
    );
    info!(
        idle_timeout_secs = config.defaults.idle_timeout_secs,
        startup_timeout_secs = config.defaults.startup_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        reap_interval_ms = config.server.reap_interval_ms,
        "Request handling defaults"
    );
    info!(
        shutdown_grace_period_secs = config.defaults.shutdown_grace_period_secs,
        stop_signal = ?config.defaults.stop_signal,
        "Shutdown settings"
    );
    info!(
        interpreter = %config.launcher.interpreter,
        bootstrap = ?config.launcher.bootstrap,
        shell = %config.launcher.shell,
        "Launcher settings"
    );
}
