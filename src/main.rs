use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use versiongate::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use versiongate::config::Config;
use versiongate::db::SqliteStore;
use versiongate::docker::DockerRuntime;
use versiongate::lifecycle::LifecycleManager;
use versiongate::probe::HttpProbe;
use versiongate::proxy::{ProxyServer, Router};
use versiongate::registry::ServiceRegistry;
use versiongate::selector::VersionSelector;

/// Extra time given to background tasks after the proxy has drained
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("versiongate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if explicit_path.is_none() && !config_path.exists() {
        info!("No config.toml found, using defaults");
        let config = Config::default();
        config.validate()?;
        config
    } else {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    };

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Service registry
    let store = SqliteStore::open(&config.registry.database)
        .with_context(|| format!("opening registry database '{}'", config.registry.database))?;
    let registry = Arc::new(
        ServiceRegistry::new(Arc::new(store), &config.registry)
            .context("loading service registry")?,
    );

    // Container lifecycle
    let runtime = DockerRuntime::connect(config.lifecycle.docker_host.as_deref()).await?;
    let probe = HttpProbe::new(config.lifecycle.probe_request_timeout());
    let lifecycle = LifecycleManager::new(
        Arc::new(runtime),
        Arc::new(probe),
        config.lifecycle.clone(),
    );
    let selector = Arc::new(VersionSelector::new());

    // Admin API (loopback only)
    let admin_addr: SocketAddr = config.server.admin_addr().parse().map_err(|e| {
        error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
        anyhow::anyhow!("Invalid admin bind address: {}", e)
    })?;
    let admin_state = Arc::new(AdminState {
        registry: Arc::clone(&registry),
        lifecycle: Arc::clone(&lifecycle),
        auth_token: config.server.admin_token.clone(),
    });
    if admin_state.auth_token.is_none() {
        warn!("admin_token not set, admin API writes are unauthenticated");
    }
    let admin_server = AdminServer::bind(admin_addr, admin_state, shutdown_rx.clone())
        .await
        .with_context(|| format!("binding admin API on {}", admin_addr))?;
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Idle reaper
    let reaper_handle = tokio::spawn(Arc::clone(&lifecycle).run_reaper(shutdown_rx.clone()));

    // Public proxy
    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;
    let router = Arc::new(Router::new(
        Arc::clone(&registry),
        selector,
        Arc::clone(&lifecycle),
        &config.server,
    ));
    let proxy = ProxyServer::bind(
        proxy_addr,
        router,
        shutdown_rx.clone(),
        config.server.drain_timeout(),
    )
    .await
    .with_context(|| format!("binding proxy on {}", proxy_addr))?;
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_signal().await?;

    // Stop accepting, drain open connections. Pending readiness waits end
    // now rather than holding the drain open.
    let _ = shutdown_tx.send(true);
    lifecycle.begin_shutdown();
    if let Err(e) = proxy_handle.await {
        error!(error = %e, "Proxy task failed");
    }

    // Tear down every container, once
    info!("Stopping all instances...");
    let report = lifecycle.stop_and_remove_all().await;
    if report.is_clean() {
        info!(removed = report.removed.len(), "All instances removed");
    } else {
        warn!(
            removed = report.removed.len(),
            failures = report.failures.len(),
            "Instances removed with errors"
        );
        for failure in &report.failures {
            error!(failure = %failure, "Teardown failure");
        }
    }

    let _ = tokio::time::timeout(TASK_STOP_TIMEOUT, async {
        let _ = admin_handle.await;
        let _ = reaper_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("listening for Ctrl+C")?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("listening for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_host = %config.server.admin_host,
        admin_port = config.server.admin_port,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        drain_timeout_secs = config.server.drain_timeout_secs,
        "Request handling settings"
    );
    info!(
        database = %config.registry.database,
        host_template = %config.registry.host_template,
        host_pool_size = config.registry.host_pool_size,
        "Registry settings"
    );
    info!(
        idle_timeout_secs = config.lifecycle.idle_timeout_secs,
        reap_interval_secs = config.lifecycle.reap_interval_secs,
        port_range = %format!("{}-{}", config.lifecycle.port_range_start, config.lifecycle.port_range_end),
        probe_attempts = config.lifecycle.probe_attempts,
        probe_interval_ms = config.lifecycle.probe_interval_ms,
        "Lifecycle settings"
    );
}
