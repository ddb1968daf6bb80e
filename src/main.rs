use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cachegate::admin::AdminServer;
use cachegate::backend::BackendPool;
use cachegate::cache::{self, Cache, CacheConfig};
use cachegate::config::Config;
use cachegate::invalidator::Invalidator;
use cachegate::proxy::{Proxy, ProxyServer};
use tokio::sync::watch;
use tracing::{error, info};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        eprintln!(
            "Failed to load configuration from {}: {}",
            config_path.display(),
            e
        );
        e
    })?;

    init_logging(&config)?;
    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Cache is a leaf shared by the proxy and the invalidator.
    let cache = Arc::new(Cache::new(CacheConfig {
        ttl: config.cache.ttl(),
        clean_frequency: config.cache.clean_frequency(),
        max_entries: config.cache.max_entries,
        max_entry_size: config.cache.max_entry_size,
        hard_max_cache_size: config.cache.hard_max_cache_size,
        verbose: config.log.is_debug(),
    })?);

    let sweeper_handle = tokio::spawn(cache::clean_loop(
        Arc::clone(&cache),
        shutdown_rx.clone(),
    ));

    // Invalidator worker pool
    let invalidator = Invalidator::new(Arc::clone(&cache), config.invalidator.max_workers);
    let invalidator_handle = {
        let invalidator = Arc::clone(&invalidator);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = invalidator.run(shutdown_rx).await {
                error!(error = %e, "Invalidator error");
            }
        })
    };

    // Admin API server
    let admin_addr: SocketAddr = config.invalidator.addr.parse()?;
    let admin_server = AdminServer::new(admin_addr, Arc::clone(&invalidator), shutdown_rx.clone());
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Proxy server
    let backends = BackendPool::from_addrs(&config.proxy.backend_addrs)?;
    let proxy = Arc::new(Proxy::new(&config.proxy, Arc::clone(&cache), backends)?);
    let proxy_addr: SocketAddr = config.proxy.addr.parse()?;
    let proxy_server = ProxyServer::new(proxy_addr, proxy, shutdown_rx.clone());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    info!(addr = %config.proxy.addr, "Listening on: http://{}/", config.proxy.addr);

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

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
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown; the invalidator drains its queue before exiting.
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = admin_handle.await;
        let _ = invalidator_handle.await;
        let _ = sweeper_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(config.log.filter_directive().parse()?);

    if config.log.is_console() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log.output)
            .map_err(|e| {
                anyhow::anyhow!("could not open log file '{}': {}", config.log.output, e)
            })?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .init();
    }
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        addr = %config.proxy.addr,
        admin_addr = %config.invalidator.addr,
        backend_count = config.proxy.backend_addrs.len(),
        backends = ?config.proxy.backend_addrs,
        "Server configuration"
    );
    info!(
        ttl_min = config.cache.ttl,
        clean_frequency_min = config.cache.clean_frequency,
        max_entries = config.cache.max_entries,
        max_entry_size = config.cache.max_entry_size,
        hard_max_cache_size_mb = config.cache.hard_max_cache_size,
        "Cache settings"
    );
    info!(
        nocache_rules = config.proxy.nocache.len(),
        set_headers = config.proxy.response.headers.set.len(),
        unset_headers = config.proxy.response.headers.unset.len(),
        max_workers = config.invalidator.max_workers,
        "Rules and invalidation settings"
    );
}
