use jobgate::api::{ControlPlane, PKG_NAME, VERSION};
use jobgate::config::{Config, DEFAULT_CONFIG_PATH};
use jobgate::nomad::NomadClient;
use jobgate::orchestrator::JobOrchestrator;
use jobgate::proxy::ProxyServer;
use jobgate::registry::RouteRegistry;
use jobgate::router::VirtualHostRouter;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("jobgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; an explicit path must exist, the default may not
    let (config_path, explicit) = match std::env::args().nth(1) {
        Some(path) => (PathBuf::from(path), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };

    let loaded = if explicit {
        Config::load(&config_path)
    } else {
        Config::load_or_default(&config_path)
    };
    let mut config = loaded.map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    config.apply_env_overrides(|key| std::env::var(key).ok());
    config.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let nomad = NomadClient::new(&config.scheduler, config.workload.port_label.clone())?;
    match nomad.agent_self().await {
        Ok(()) => info!(address = nomad.address(), "Connected to Nomad"),
        Err(e) => warn!(address = nomad.address(), error = %e, "Unable to reach Nomad, continuing"),
    }

    let registry = Arc::new(RouteRegistry::new());
    let orchestrator = Arc::new(
        JobOrchestrator::new(
            Arc::new(nomad),
            Arc::clone(&registry),
            config.server.domain.clone(),
            config.workload.clone(),
            config.readiness.clone(),
        )
        .with_datacenters(config.scheduler.datacenters.clone())
        .with_shutdown(shutdown_rx.clone()),
    );

    let router = Arc::new(VirtualHostRouter::new(
        &config.server.domain,
        config.server.api_host(),
        Arc::clone(&registry),
    ));

    let control_plane = Arc::new(
        ControlPlane::new(Arc::clone(&orchestrator), config.server.api_token.clone())
            .with_max_body_bytes(config.server.max_body_bytes),
    );
    if config.server.api_token.is_none() {
        warn!("No api_token configured, the control plane is unauthenticated");
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = ProxyServer::new(bind_addr, router, control_plane, shutdown_rx)
        .with_request_timeout(config.server.request_timeout())
        .with_drain_timeout(config.server.drain_timeout());

    let mut server_handle = tokio::spawn(server.run());

    // Wait for shutdown signal (Ctrl+C or SIGTERM), or the server dying on its own
    let server_result = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut server_handle => Some(result),
    };

    // Signal shutdown: stops accepting, drains connections, aborts in-flight creations
    let _ = shutdown_tx.send(true);

    let server_result = match server_result {
        Some(result) => result,
        None => server_handle.await,
    };
    let mut failed = match server_result {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            error!(error = %e, "Gateway server error");
            true
        }
        Err(e) => {
            error!(error = %e, "Gateway server task failed");
            true
        }
    };

    info!(jobs = registry.len(), "Purging all jobs...");
    if let Err(e) = orchestrator.shutdown_all().await {
        error!(error = %e, "Error purging jobs");
        failed = true;
    }

    if failed {
        anyhow::bail!("Shutdown completed with errors");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, only Ctrl+C will stop the gateway");
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
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");

    info!(
        bind = %config.server.bind,
        port = config.server.port,
        domain = %config.server.domain,
        api_host = %config.server.api_host(),
        auth = config.server.api_token.is_some(),
        "Server configuration"
    );
    info!(
        subdomains = %format!("*.{}", config.server.domain),
        target = "127.0.0.1:<allocated port>",
        "Subdomain reverse proxy"
    );
    info!(
        address = %config.scheduler.address,
        region = ?config.scheduler.region,
        namespace = ?config.scheduler.namespace,
        datacenters = ?config.scheduler.datacenters,
        "Scheduler settings"
    );
    info!(
        image = %config.workload.image,
        driver = %config.workload.driver,
        cpu_mhz = config.workload.cpu_mhz,
        memory_mb = config.workload.memory_mb,
        "Workload settings"
    );
    info!(
        poll_interval_ms = config.readiness.poll_interval_ms,
        max_attempts = config.readiness.max_attempts,
        request_timeout_secs = config.server.request_timeout_secs,
        drain_timeout_secs = config.server.drain_timeout_secs,
        "Timing settings"
    );
}
