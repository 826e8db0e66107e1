use shadowgate::config::Config;
use shadowgate::forward::{ForwardConfig, HttpForwarder};
use shadowgate::guard::AccessGuard;
use shadowgate::inventory::InventoryFetcher;
use shadowgate::proxy::{GatewayServer, GatewayState};
use shadowgate::relay::{RelayConfig, WebSocketRelay};
use shadowgate::routes::{RouteEntry, RouteTableHandle, RoutingTable};
use shadowgate::session::{SessionConfig, SessionManager};
use shadowgate::status::{StatusServer, StatusState, PKG_NAME, VERSION};
use shadowgate::sync::RouteSynchronizer;
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
                .add_directive("shadowgate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Panel session and inventory; neither exists before the panel is set up
    let setup_mode = config.panel.setup_mode();
    let fetcher = if setup_mode {
        warn!("Dashboard path is not configured, forwarding everything to the panel (setup mode)");
        None
    } else {
        let session = Arc::new(SessionManager::new(SessionConfig::from_panel(&config.panel)?)?);
        Some(Arc::new(InventoryFetcher::new(
            session,
            config.panel.inbound_list_path.clone(),
        )))
    };

    let dashboard = RouteEntry::dashboard(
        config.panel.dashboard_prefix(),
        config.panel.admin_target(),
        !setup_mode,
    );
    let guard = if setup_mode {
        None
    } else {
        config.gateway.public_domain.as_deref().map(AccessGuard::new)
    };

    let table = Arc::new(RouteTableHandle::new(RoutingTable::with_dashboard(dashboard.clone())));
    let backend_host = config.panel.host.clone().unwrap_or_default();
    let synchronizer = Arc::new(RouteSynchronizer::new(
        fetcher.clone(),
        Arc::clone(&table),
        dashboard,
        backend_host,
    ));

    // Populate routes before accepting traffic
    if let Err(e) = synchronizer.synchronize().await {
        error!(critical = true, error = %e, "Initial synchronization failed, no usable panel session");
        std::process::exit(1);
    }

    let sync_handle = config.sync.interval().map(|interval| {
        let synchronizer = Arc::clone(&synchronizer);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { synchronizer.run_periodic(interval, shutdown).await })
    });

    let forwarder = HttpForwarder::new(ForwardConfig {
        request_timeout: config.gateway.request_timeout(),
        ..ForwardConfig::default()
    });
    let forward_stats = forwarder.stats();
    let relay = Arc::new(WebSocketRelay::new(RelayConfig {
        dial_timeout: config.gateway.relay_dial_timeout(),
        close_timeout: config.gateway.relay_close_timeout(),
    }));

    let state = Arc::new(GatewayState {
        table: Arc::clone(&table),
        guard,
        forwarder,
        relay: Arc::clone(&relay),
    });

    let gateway_addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let gateway = GatewayServer::new(gateway_addr, state, shutdown_rx.clone());
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    let status_handle = if config.status.enabled {
        let status_addr: SocketAddr = format!("{}:{}", config.status.bind, config.status.port).parse()?;
        let status_state = Arc::new(StatusState {
            sync: synchronizer.status(),
            table,
            fetcher,
            relay,
            forward: forward_stats,
            max_staleness: config.sync.health_max_staleness(),
            token: config.status.token.clone(),
        });
        let status_server = StatusServer::new(status_addr, status_state, shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = status_server.run().await {
                error!(error = %e, "Status server error");
            }
        }))
    } else {
        None
    };

    wait_for_signal().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = gateway_handle.await;
        if let Some(handle) = status_handle {
            let _ = handle.await;
        }
        if let Some(handle) = sync_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
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

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.gateway.bind,
        port = config.gateway.port,
        public_domain = ?config.gateway.public_domain,
        request_timeout_secs = config.gateway.request_timeout_secs,
        relay_dial_timeout_secs = config.gateway.relay_dial_timeout_secs,
        relay_close_timeout_secs = config.gateway.relay_close_timeout_secs,
        "Gateway configuration"
    );
    info!(
        panel = %config.panel.admin_target(),
        dashboard = %config.panel.dashboard_prefix(),
        setup_mode = config.panel.setup_mode(),
        login_interval_secs = config.panel.login_interval_secs,
        max_login_attempts = ?config.panel.max_login_attempts,
        call_timeout_secs = config.panel.call_timeout_secs,
        "Panel settings"
    );
    info!(
        interval_secs = config.sync.interval_secs,
        health_max_staleness_secs = config.sync.health_max_staleness_secs,
        status_enabled = config.status.enabled,
        status_port = config.status.port,
        "Synchronization and status settings"
    );
}
