#![forbid(unsafe_code)]

use anyhow::Result;
use sfu_gateway::media::{MediaConfig, MediaServer, MediasoupEngine};
use sfu_gateway::metrics::ServerMetrics;
use sfu_gateway::signaling::SignalingServer;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_gateway=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("sfu-gateway - Starting server");

    let mut media_config = MediaConfig::from_env()?;

    // ICE candidates need a reachable address; loopback suits local testing
    match &media_config.webrtc_transport_config.announced_address {
        Some(ip) => info!("Using ANNOUNCE_IP={}", ip),
        None => {
            let default_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
            info!("No ANNOUNCE_IP set, using {}", default_ip);
            media_config.webrtc_transport_config = media_config
                .webrtc_transport_config
                .with_public_ip(default_ip);
        }
    }

    let media = Arc::new(MediaServer::new(Arc::new(MediasoupEngine::new()), media_config));

    // Without a worker there is nothing to serve
    media.initialize().await?;
    info!("Media engine initialized");

    let metrics = ServerMetrics::new();
    let signaling_server = SignalingServer::new(media.clone(), metrics);
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down...");
    };

    if let Err(e) = signaling_server.serve(port, shutdown).await {
        error!("Signaling server error: {}", e);
    }

    media.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
