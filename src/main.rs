//! rstomp - STOMP message broker
//!
//! Serves STOMP 1.0, 1.1 and 1.2 over TCP or TLS.

use rstomp_server::bus::create_local_bus;
use rstomp_server::metrics::run_metrics_server;
use rstomp_server::{tls, Bridge, Config, Metrics, Server, ServerConfig, StompHandler};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

const BUS_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // RSTOMP_CONFIG names a YAML file; env variables override it
    let config_path = std::env::var("RSTOMP_CONFIG").ok();
    let mut config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    if let Err(e) = config.load_secrets() {
        tracing::error!("Failed to load auth secrets: {}", e);
        return Err(e.into());
    }
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting rstomp server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Versions: {} (heart-beat {})",
        config.stomp.supported_versions.join(","),
        config.stomp.heartbeat
    );

    if config.auth.secured {
        if config.auth.users.is_empty() {
            tracing::error!("auth.secured=true but no users configured!");
            return Err("Authentication required but no users configured".into());
        }
        tracing::info!(
            "  Authentication: enabled ({} user(s))",
            config.auth.users.len()
        );
    } else {
        tracing::info!("  Authentication: disabled");
    }

    let mut server_config = ServerConfig::from_config(&config);
    if config.tls.enabled {
        server_config = server_config.with_tls(tls::create_tls_acceptor(&config.tls)?);
        tracing::info!("  TLS: enabled");
        if config.tls.require_client_cert {
            tracing::info!("  mTLS: enabled (client certificate required)");
        }
    } else {
        tracing::info!("  TLS: disabled");
    }

    let mut handler = StompHandler::from_config(&config);

    let (metrics_shutdown_tx, _) = broadcast::channel::<()>(1);
    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        handler = handler.with_metrics(metrics.clone());
        let addr = config.metrics.bind_addr;
        let shutdown_rx = metrics_shutdown_tx.subscribe();
        tracing::info!("  Metrics: http://{}/metrics", addr);
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown_rx).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    if config.bridge.enabled {
        let bus = create_local_bus(BUS_CHANNEL_CAPACITY);
        let bridge = Bridge::new(config.bridge.to_options(), bus)?;
        tracing::info!(
            "  Bridge: enabled ({} inbound, {} outbound)",
            config.bridge.inbound.len(),
            config.bridge.outbound.len()
        );
        handler = handler.with_bridge(bridge);
    }

    let server = Arc::new(Server::new(server_config, Arc::new(handler)));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
        let _ = metrics_shutdown_tx.send(());
    });

    server.run().await?;

    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}
