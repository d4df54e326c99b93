use frontdoor::admin::{AdminServer, PKG_NAME, VERSION};
use frontdoor::config::{Config, DEFAULT_CONFIG_FILE};
use frontdoor::pool::PoolConfig;
use frontdoor::process::ProcessSupervisor;
use frontdoor::proxy::{ProxyServer, ProxySettings};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("frontdoor=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    let config = Config::resolve(config_path.as_deref()).map_err(|e| {
        let path = config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
        error!(path, error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    // A backend that cannot be spawned is fatal before anything listens
    let supervisor = ProcessSupervisor::new(config.backend.clone());
    let handle = supervisor.start().map_err(|e| {
        error!(command = %config.backend.command, error = %e, "Failed to start backend");
        e
    })?;
    info!(pid = ?handle.pid, port = handle.port, "Backend process started");

    // Readiness is checked in the background; requests get 503 until then
    let readiness = Arc::clone(&supervisor);
    let startup_timeout = config.backend.startup_timeout();
    tokio::spawn(async move {
        readiness.await_ready(startup_timeout).await;
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bind_ip: IpAddr = config.server.bind.parse().map_err(|e| {
        error!(bind = %config.server.bind, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e)
    })?;
    let bind_addr = SocketAddr::new(bind_ip, config.server.port);

    let listener = match TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "Failed to bind proxy listener");
            supervisor.stop().await;
            return Err(e.into());
        }
    };

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let proxy = ProxyServer::with_pool_config(
        bind_addr,
        supervisor.subscribe(),
        ProxySettings::from_config(&config),
        shutdown_rx.clone(),
        pool_config,
    );
    let pool_stats = proxy.pool().stats();

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.serve(listener).await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Status listener is local-only and optional
    let admin_handle = config.server.admin_port.map(|admin_port| {
        let admin_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), admin_port);
        let admin_server = AdminServer::new(
            admin_addr,
            Arc::clone(&supervisor),
            pool_stats,
            shutdown_rx.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        })
    });

    wait_for_shutdown_signal().await;

    // Stop accepting and drain before the backend goes away
    let _ = shutdown_tx.send(true);

    let drain_bound = config.server.drain_timeout() + Duration::from_secs(1);
    if tokio::time::timeout(drain_bound, proxy_handle).await.is_err() {
        warn!("Proxy server did not finish draining in time");
    }

    if let Some(handle) = admin_handle {
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    info!("Stopping backend...");
    supervisor.stop().await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, only Ctrl+C will stop the server");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return;
            }
        };

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
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting front door");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        drain_timeout_secs = config.server.drain_timeout_secs,
        max_body_bytes = config.server.max_body_bytes,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        command = %config.backend.command,
        working_dir = ?config.backend.working_dir,
        address = %config.backend.address(),
        health_path = ?config.backend.health_path,
        "Backend configuration"
    );
    info!(
        startup_timeout_secs = config.backend.startup_timeout_secs,
        request_timeout_secs = config.backend.request_timeout_secs,
        shutdown_grace_period_secs = config.backend.shutdown_grace_period_secs,
        restart_policy = ?config.backend.restart.policy,
        "Request handling defaults"
    );
}
