use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Json,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use signalk_hub_core::{format_timestamp, HubConfig};
use signalk_hub_protocol::DiscoveryResponse;
use signalk_hub_server::{pipeline, tcp, ws, Hub, IngestHandle};

/// Environment variable naming the configuration file.
const CONFIG_ENV: &str = "SIGNALK_HUB_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,signalk_hub_server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Signal K hub starting...");

    let config = load_config()?;
    let ws_addr = config.ws_addr;
    let tcp_addr = config.tcp_addr;
    let http_addr = config.http_addr;
    let demo = config.demo;

    let hub = Hub::new(config)?;
    let (ingest, ingest_handle) = pipeline::spawn(hub.clone(), hub.config().ingest_queue);

    let ws_handle = {
        let hub = hub.clone();
        let ingest = ingest.clone();
        tokio::spawn(async move {
            if let Err(e) = ws::run(ws_addr, hub, ingest).await {
                tracing::error!("WebSocket transport error: {}", e);
            }
        })
    };

    let tcp_handle = {
        let hub = hub.clone();
        let ingest = ingest.clone();
        tokio::spawn(async move {
            if let Err(e) = tcp::run(tcp_addr, hub, ingest).await {
                tracing::error!("TCP transport error: {}", e);
            }
        })
    };

    let http_handle = {
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = start_http_server(http_addr, hub).await {
                tracing::error!("HTTP server error: {}", e);
            }
        })
    };

    let demo_handle = if demo {
        let ingest = ingest.clone();
        Some(tokio::spawn(async move {
            generate_demo_data(ingest).await;
        }))
    } else {
        None
    };
    drop(ingest);

    tracing::info!("Signal K hub ready");
    tracing::info!("   WebSocket: ws://{}/signalk/v1/stream", ws_addr);
    tracing::info!("   TCP:       tcp://{}", tcp_addr);
    tracing::info!("   HTTP API:  http://{}/signalk/v1/api", http_addr);
    tracing::info!("   Discovery: http://{}/signalk", http_addr);

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = ws_handle => {
            tracing::warn!("WebSocket transport stopped");
        }
        _ = tcp_handle => {
            tracing::warn!("TCP transport stopped");
        }
        _ = http_handle => {
            tracing::warn!("HTTP server stopped");
        }
        _ = ingest_handle => {
            tracing::warn!("Ingestion worker stopped");
        }
    }

    if let Some(handle) = demo_handle {
        handle.abort();
    }
    hub.shutdown();
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Configuration from the file named by `SIGNALK_HUB_CONFIG` or the first
/// argument; defaults when neither is given.
fn load_config() -> anyhow::Result<HubConfig> {
    let path = std::env::var(CONFIG_ENV).ok().or_else(|| std::env::args().nth(1));
    match path {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path);
            HubConfig::load(&path).with_context(|| format!("failed to load {}", path))
        }
        None => {
            tracing::info!("No configuration file, using defaults");
            Ok(HubConfig::default())
        }
    }
}

/// Start the HTTP API server
async fn start_http_server(addr: SocketAddr, hub: Arc<Hub>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/signalk", get(discovery_handler))
        .route("/signalk/v1/api", get(full_api_handler))
        .route("/signalk/v1/api/*path", get(path_handler))
        .with_state(hub);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Discovery endpoint handler
async fn discovery_handler(State(hub): State<Arc<Hub>>, headers: HeaderMap) -> Json<DiscoveryResponse> {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|host| host.rsplit_once(':').map_or(host, |(name, _)| name))
        .unwrap_or("localhost");

    let config = hub.config();
    Json(DiscoveryResponse::new(
        &config.name,
        &config.version,
        host,
        config.http_addr.port(),
        config.ws_addr.port(),
        config.tcp_addr.port(),
    ))
}

/// Full API handler - returns the whole model without internal bookkeeping
async fn full_api_handler(State(hub): State<Arc<Hub>>) -> Json<Value> {
    let model = hub.snapshot().await.safe();
    Json(model.document())
}

/// Path-based API handler, `/` or `.` separated
async fn path_handler(Path(path): Path<String>, State(hub): State<Arc<Hub>>) -> Result<Json<Value>, StatusCode> {
    let path = path.trim_matches('/').replace('/', ".");
    let model = hub.snapshot().await.safe();

    match model.node_at(&path) {
        Some(id) => Ok(Json(model.to_json(id))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// Generate demo data - simulated boat navigation
async fn generate_demo_data(ingest: IngestHandle) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(1));
    let started = tokio::time::Instant::now();
    let mut latitude = 52.0987654;
    let mut longitude = 4.9876545;

    loop {
        interval.tick().await;

        // Move the boat
        latitude += 0.00001;
        longitude += 0.00002;

        // Vary speed and course slightly
        let t = started.elapsed().as_secs_f64();
        let sog = 3.85 + t.sin() * 0.5;
        let cog = 1.52 + t.cos() * 0.1;

        let delta = json!({
            "context": "vessels.self",
            "updates": [{
                "source": {"label": "demo", "type": "signalk"},
                "timestamp": format_timestamp(&chrono::Utc::now()),
                "values": [
                    {"path": "navigation.position", "value": {"latitude": latitude, "longitude": longitude}},
                    {"path": "navigation.speedOverGround", "value": sog},
                    {"path": "navigation.courseOverGroundTrue", "value": cog}
                ]
            }]
        });

        if ingest.submit(None, delta.to_string()).await.is_err() {
            tracing::error!("Failed to submit demo delta - ingestion stopped");
            break;
        }
    }
}
