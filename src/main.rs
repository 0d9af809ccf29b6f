use launchpad::admin::{AdminServer, PKG_NAME, VERSION};
use launchpad::config::Config;
use launchpad::dispatch::ModelDispatcher;
use launchpad::ports::PortAllocator;
use launchpad::proxy::ProxyServer;
use launchpad::registry::AppRegistry;
use launchpad::supervisor::Supervisor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("launchpad=debug".parse().expect("valid log directive")),
        )
        .init();

    if let Ok(path) = dotenv {
        info!(path = %path.display(), "Loaded environment file");
    }

    let mut config = load_config()?;
    config.apply_env();

    let token = config.inference.load_token().map_err(|e| {
        error!(env = %config.inference.token_env, "Inference token missing");
        e
    })?;

    print_startup_banner(&config);

    std::fs::create_dir_all(&config.runtime.data_dir).map_err(|e| {
        anyhow::anyhow!(
            "Failed to create data directory '{}': {}",
            config.runtime.data_dir.display(),
            e
        )
    })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_url = (config.server.admin_port > 0)
        .then(|| format!("http://127.0.0.1:{}", config.server.admin_port));

    let registry = AppRegistry::new();
    let supervisor = Supervisor::new(
        config.runtime.clone(),
        Arc::new(PortAllocator::new()),
        admin_url,
    );
    let dispatcher = Arc::new(ModelDispatcher::new(
        config.models.clone(),
        &config.inference,
        token,
    )?);

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::new(
        proxy_addr,
        &config.server,
        Arc::clone(&registry),
        Arc::clone(&supervisor),
        dispatcher,
        shutdown_rx.clone(),
    );
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr = SocketAddr::from(([127, 0, 0, 1], config.server.admin_port));

        // Generate or use configured admin token
        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        let admin_server = AdminServer::new(
            admin_addr,
            Arc::clone(&registry),
            Arc::clone(&supervisor),
            shutdown_rx.clone(),
            admin_token,
        );
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    if let Some(idle_timeout) = config.runtime.idle_timeout() {
        let registry = Arc::clone(&registry);
        let supervisor = Arc::clone(&supervisor);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            idle_cleanup_loop(registry, supervisor, idle_timeout, shutdown_rx).await;
        });
    }

    wait_for_shutdown_signal().await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!(apps = registry.len(), "Stopping all applications...");
    supervisor.stop_all(&registry).await;

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Config path from the first argument; a missing default file means built-in defaults
fn load_config() -> anyhow::Result<Config> {
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if explicit.is_none() && !config_path.exists() {
        warn!(path = %config_path.display(), "No configuration file, using defaults");
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");
    Ok(config)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

async fn idle_cleanup_loop(
    registry: Arc<AppRegistry>,
    supervisor: Arc<Supervisor>,
    idle_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(10).min(idle_timeout);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                supervisor.cleanup_idle(&registry, idle_timeout).await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting application host");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = if config.server.admin_port > 0 { Some(config.server.admin_port) } else { None },
        public_url = ?config.server.public_url,
        max_source_bytes = config.server.max_source_bytes,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        command = %config.runtime.command,
        data_dir = %config.runtime.data_dir.display(),
        startup_timeout_secs = config.runtime.startup_timeout_secs,
        request_timeout_secs = config.runtime.request_timeout_secs,
        idle_timeout_secs = config.runtime.idle_timeout_secs,
        shutdown_grace_period_secs = config.runtime.shutdown_grace_period_secs,
        "Runtime settings"
    );
    warn!("Submitted programs run with the full privileges of this process");
    info!(
        model_count = config.models.len(),
        token_env = %config.inference.token_env,
        "Model dispatch configured"
    );
}
